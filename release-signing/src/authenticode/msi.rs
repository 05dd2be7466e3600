// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Authenticode for Windows Installer packages.

Installer packages are compound files. The signature lives in the
`\u{5}DigitalSignature` stream of the root storage. The digest walks every
storage depth first, visiting children ordered by their UTF-16LE encoded
names, hashing stream contents and then the CLSID of each storage. The
signature streams themselves are not covered.
*/

use {
    super::DigestAlgorithm,
    crate::error::{Result, SigningError},
    cfb::CompoundFile,
    digest::DynDigest,
    std::{
        fs::File,
        io::{Read, Seek, SeekFrom, Write},
        path::{Path, PathBuf},
    },
};

pub const DIGITAL_SIGNATURE_STREAM: &str = "\u{5}DigitalSignature";
pub const DIGITAL_SIGNATURE_EX_STREAM: &str = "\u{5}MsiDigitalSignatureEx";

fn msi_error(path: &Path, e: impl ToString) -> SigningError {
    SigningError::Envelope(format!("{}: {}", path.display(), e.to_string()))
}

fn open(path: &Path) -> Result<CompoundFile<File>> {
    cfb::open(path).map_err(|e| msi_error(path, e))
}

fn root_stream(name: &str) -> PathBuf {
    Path::new("/").join(name)
}

/// Whether the package carries a signature stream.
pub fn is_signed(path: &Path) -> Result<bool> {
    Ok(open(path)?.is_stream(root_stream(DIGITAL_SIGNATURE_STREAM)))
}

fn sort_key(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

fn hash_storage<F: Read + Seek>(
    compound: &mut CompoundFile<F>,
    storage: &Path,
    is_root: bool,
    hasher: &mut dyn DynDigest,
) -> Result<()> {
    let mut children = compound
        .read_storage(storage)?
        .map(|e| (e.name().to_string(), e.path().to_path_buf(), e.is_stream()))
        .collect::<Vec<_>>();
    children.sort_by_key(|(name, _, _)| sort_key(name));

    let mut buf = vec![0u8; 32768];

    for (name, child, is_stream) in children {
        if is_root && (name == DIGITAL_SIGNATURE_STREAM || name == DIGITAL_SIGNATURE_EX_STREAM) {
            continue;
        }

        if is_stream {
            let mut stream = compound.open_stream(&child)?;
            loop {
                let count = stream.read(&mut buf)?;
                if count == 0 {
                    break;
                }
                hasher.update(&buf[0..count]);
            }
        } else {
            hash_storage(compound, &child, false, hasher)?;
        }
    }

    let clsid = compound.entry(storage)?.clsid().to_bytes_le();
    hasher.update(&clsid);

    Ok(())
}

/// Compute the Authenticode digest of an installer package.
pub fn digest(path: &Path, algorithm: DigestAlgorithm) -> Result<Vec<u8>> {
    let mut compound = open(path)?;
    let mut hasher = algorithm.hasher();

    hash_storage(&mut compound, Path::new("/"), true, hasher.as_mut())?;

    Ok(hasher.finalize().to_vec())
}

/// Add a PKCS#7 signature stream, atomically replacing the package.
pub fn embed(path: &Path, pkcs7: &[u8]) -> Result<()> {
    if is_signed(path)? {
        return Err(msi_error(path, "package is already signed"));
    }

    crate::io::write_atomically(path, |temp| {
        let mut source =
            File::open(path).map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?;
        let file = temp.as_file_mut();
        std::io::copy(&mut source, file)?;
        file.seek(SeekFrom::Start(0))?;

        let mut compound = CompoundFile::open(file).map_err(|e| msi_error(path, e))?;
        {
            let mut stream = compound.create_stream(root_stream(DIGITAL_SIGNATURE_STREAM))?;
            stream.write_all(pkcs7)?;
        }
        compound.flush()?;

        Ok(())
    })
}

/// The signature stream of a signed package.
pub fn embedded_signature(path: &Path) -> Result<Option<Vec<u8>>> {
    let mut compound = open(path)?;
    let name = root_stream(DIGITAL_SIGNATURE_STREAM);
    if !compound.is_stream(&name) {
        return Ok(None);
    }

    let mut data = vec![];
    compound.open_stream(&name)?.read_to_end(&mut data)?;

    Ok(Some(data))
}
