// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Protected binary signatures.

A protected binary ships with a signature file next to it. The signature
covers the binary and a flags byte recording whether the binary is blessed.
The signing service signs the digest. The signature file bundles the
signature with the signing certificate and the flags.

The digest and signature file layout live behind [ProtectedBinaryCodec] so
deployments can swap in a different codec.
*/

use {
    crate::error::{Result, SigningError},
    sha2::{Digest, Sha512},
    std::{fs::File, io::Read, path::Path},
};

/// Flags byte of blessed binaries.
pub const FLAG_BLESSED: u8 = 1;

/// Flags byte of everything else.
pub const FLAG_UNBLESSED: u8 = 0;

pub fn flags(blessed: bool) -> u8 {
    if blessed {
        FLAG_BLESSED
    } else {
        FLAG_UNBLESSED
    }
}

/// Computes digests of protected binaries and encodes signature files.
pub trait ProtectedBinaryCodec: Send + Sync {
    /// Digest of a binary to be signed by the signing service.
    fn digest(&self, path: &Path, flags: u8) -> Result<Vec<u8>>;

    /// Encode the signature file content.
    fn signature_file(&self, signature: &[u8], certificate: &[u8], flags: u8) -> Result<Vec<u8>>;
}

/// Default codec.
///
/// The digest is SHA-512 over the binary followed by the flags byte. The
/// signature file is a sequence of protobuf style fields: certificate (1),
/// signature (2) and flags (3).
#[derive(Clone, Copy, Debug, Default)]
pub struct WidevineCodec;

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn write_bytes_field(out: &mut Vec<u8>, field: u64, data: &[u8]) {
    write_varint(out, field << 3 | 2);
    write_varint(out, data.len() as u64);
    out.extend_from_slice(data);
}

impl ProtectedBinaryCodec for WidevineCodec {
    fn digest(&self, path: &Path, flags: u8) -> Result<Vec<u8>> {
        let mut fh = File::open(path).map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?;
        let mut hasher = Sha512::new();
        let mut buf = vec![0u8; 65536];

        loop {
            let count = fh.read(&mut buf)?;
            if count == 0 {
                break;
            }
            hasher.update(&buf[0..count]);
        }
        hasher.update([flags]);

        Ok(hasher.finalize().to_vec())
    }

    fn signature_file(&self, signature: &[u8], certificate: &[u8], flags: u8) -> Result<Vec<u8>> {
        if signature.is_empty() {
            return Err(SigningError::Envelope("empty protected binary signature".into()));
        }

        let mut out = vec![];
        write_bytes_field(&mut out, 1, certificate);
        write_bytes_field(&mut out, 2, signature);
        write_varint(&mut out, 3 << 3);
        write_varint(&mut out, flags as u64);

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_covers_flags() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("plugin-container");
        std::fs::write(&path, b"binary")?;

        let codec = WidevineCodec;
        let blessed = codec.digest(&path, flags(true))?;
        let unblessed = codec.digest(&path, flags(false))?;
        assert_eq!(blessed.len(), 64);
        assert_ne!(blessed, unblessed);

        let mut expected = Sha512::new();
        expected.update(b"binary\x01");
        assert_eq!(blessed, expected.finalize().to_vec());

        Ok(())
    }

    #[test]
    fn signature_file_layout() -> Result<()> {
        let data = WidevineCodec.signature_file(&[0xaa; 200], b"cert", FLAG_BLESSED)?;

        assert_eq!(&data[0..6], b"\x0a\x04cert");
        // 200 needs a two byte varint.
        assert_eq!(&data[6..9], &[0x12, 0xc8, 0x01]);
        assert_eq!(&data[209..], &[0x18, 0x01]);

        assert!(WidevineCodec.signature_file(&[], b"cert", 0).is_err());

        Ok(())
    }
}
