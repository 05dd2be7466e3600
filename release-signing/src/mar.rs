// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Update package (MAR) signature blocks.

A MAR file is laid out as follows (integers are big endian):

```text
"MAR1" | u32 index offset
u64 file size | u32 signature count | { u32 algorithm | u32 size | bytes }*
u32 additional section count | { u32 block size | u32 block id | bytes }*
file data
u32 index size | { u32 offset | u32 size | u32 flags | name \0 }*
```

Signatures cover everything in the file except the signature bytes
themselves. To hash sign a package, a signature block holding a zeroed
signature of the final length is inserted, the digest is computed, and the
real signature is spliced in its place.
*/

use {
    crate::error::{Result, SigningError},
    digest::Digest,
    rsa::{
        pkcs1::DecodeRsaPublicKey, pkcs8::DecodePublicKey, Hash, PaddingScheme, PublicKey,
        RsaPublicKey,
    },
};

const MAR_MAGIC: &[u8; 4] = b"MAR1";
const HEADER_SIZE: usize = 8;

/// Signature algorithms a MAR can carry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureAlgorithm {
    /// RSA-PKCS1-SHA1 with a 2048 bit key.
    Sha1,
    /// RSA-PKCS1-SHA384 with a 4096 bit key.
    Sha384,
}

impl SignatureAlgorithm {
    pub fn id(&self) -> u32 {
        match self {
            Self::Sha1 => 1,
            Self::Sha384 => 2,
        }
    }

    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            1 => Ok(Self::Sha1),
            2 => Ok(Self::Sha384),
            _ => Err(SigningError::Envelope(format!(
                "unknown MAR signature algorithm {}",
                id
            ))),
        }
    }

    /// Length in bytes of a signature.
    pub fn signature_length(&self) -> usize {
        match self {
            Self::Sha1 => 256,
            Self::Sha384 => 512,
        }
    }

    fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            Self::Sha1 => {
                let mut h = sha1::Sha1::new();
                for part in parts {
                    h.update(part);
                }
                h.finalize().to_vec()
            }
            Self::Sha384 => {
                let mut h = sha2::Sha384::new();
                for part in parts {
                    h.update(part);
                }
                h.finalize().to_vec()
            }
        }
    }
}

/// A signature stored in a MAR.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MarSignature {
    pub algorithm_id: u32,
    pub signature: Vec<u8>,
}

/// An entry of the MAR index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MarIndexEntry {
    pub offset: u32,
    pub size: u32,
    pub flags: u32,
    pub name: Vec<u8>,
}

/// Parsed structure of a MAR file.
#[derive(Clone, Debug)]
pub struct MarLayout {
    pub index_offset: u32,
    /// File size recorded in the signature block.
    pub file_size: Option<u64>,
    pub signatures: Vec<MarSignature>,
    /// Raw additional sections, including their count, if present.
    pub additional: Option<Vec<u8>>,
    /// Offset just past the signature block.
    pub signatures_end: usize,
    pub data_offset: usize,
    pub index: Vec<MarIndexEntry>,
}

fn mar_error(msg: impl ToString) -> SigningError {
    SigningError::Envelope(format!("invalid MAR: {}", msg.to_string()))
}

fn be_u32(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| mar_error(format!("truncated at offset {}", pos)))
}

fn be_u64(data: &[u8], pos: usize) -> Result<u64> {
    let hi = be_u32(data, pos)? as u64;
    let lo = be_u32(data, pos + 4)? as u64;
    Ok((hi << 32) | lo)
}

impl MarLayout {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.get(0..4) != Some(MAR_MAGIC.as_ref()) {
            return Err(mar_error("bad magic"));
        }

        let index_offset = be_u32(data, 4)?;
        let mut pos = index_offset as usize;
        let index_size = be_u32(data, pos)? as usize;
        pos += 4;
        let index_end = pos + index_size;
        if index_end > data.len() {
            return Err(mar_error("index extends past end of file"));
        }

        let mut index = vec![];
        while pos < index_end {
            if pos + 12 > index_end {
                return Err(mar_error(format!("truncated index entry at offset {}", pos)));
            }
            let offset = be_u32(data, pos)?;
            let size = be_u32(data, pos + 4)?;
            let flags = be_u32(data, pos + 8)?;
            pos += 12;

            let rest = data
                .get(pos..index_end)
                .ok_or_else(|| mar_error("truncated index"))?;
            let nul = rest
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| mar_error("unterminated index entry name"))?;
            let name = rest[..nul].to_vec();
            pos += nul + 1;

            if (offset as usize) < HEADER_SIZE
                || offset as u64 + size as u64 > index_offset as u64
            {
                return Err(mar_error(format!(
                    "entry {} lies outside the file data",
                    String::from_utf8_lossy(&name)
                )));
            }

            index.push(MarIndexEntry {
                offset,
                size,
                flags,
                name,
            });
        }

        let data_offset = index
            .iter()
            .map(|e| e.offset as usize)
            .min()
            .unwrap_or(index_offset as usize);
        if data_offset > index_offset as usize {
            return Err(mar_error("index precedes file data"));
        }

        let mut layout = Self {
            index_offset,
            file_size: None,
            signatures: vec![],
            additional: None,
            signatures_end: HEADER_SIZE,
            data_offset,
            index,
        };

        // Packages produced without a signature block have data right
        // after the header.
        if data_offset > HEADER_SIZE {
            let mut pos = HEADER_SIZE;
            layout.file_size = Some(be_u64(data, pos)?);
            let count = be_u32(data, pos + 8)?;
            pos += 12;

            for _ in 0..count {
                let algorithm_id = be_u32(data, pos)?;
                let size = be_u32(data, pos + 4)? as usize;
                pos += 8;
                let signature = data
                    .get(pos..pos + size)
                    .ok_or_else(|| mar_error("truncated signature"))?
                    .to_vec();
                pos += size;

                layout.signatures.push(MarSignature {
                    algorithm_id,
                    signature,
                });
            }
            layout.signatures_end = pos;

            if pos > data_offset {
                return Err(mar_error("signature block overlaps file data"));
            }
            if pos < data_offset {
                layout.additional = Some(data[pos..data_offset].to_vec());
            }
        }

        Ok(layout)
    }

    /// Digest of the signed content for the first signature.
    pub fn signed_digest(&self, data: &[u8]) -> Result<(SignatureAlgorithm, Vec<u8>)> {
        let first = self
            .signatures
            .first()
            .ok_or_else(|| mar_error("package has no signatures"))?;
        let algorithm = SignatureAlgorithm::from_id(first.algorithm_id)?;
        let file_size = self
            .file_size
            .ok_or_else(|| mar_error("package has no signature block"))?;

        let mut block = vec![];
        block.extend_from_slice(&file_size.to_be_bytes());
        block.extend_from_slice(&(self.signatures.len() as u32).to_be_bytes());

        let mut parts: Vec<&[u8]> = vec![&data[0..HEADER_SIZE]];
        let mut sig_headers = vec![];
        for sig in &self.signatures {
            let mut h = vec![];
            h.extend_from_slice(&sig.algorithm_id.to_be_bytes());
            h.extend_from_slice(&(sig.signature.len() as u32).to_be_bytes());
            sig_headers.push(h);
        }

        parts.push(&block);
        for h in &sig_headers {
            parts.push(h);
        }
        parts.push(&data[self.signatures_end..]);

        Ok((algorithm, algorithm.digest(&parts)))
    }
}

/// Rewrite a MAR with a single signature of the given algorithm.
///
/// When `signature` is `None` a zeroed placeholder of the algorithm's
/// signature length is written. Index offsets, the index offset and the
/// recorded file size are updated for the new block size.
pub fn add_signature_block(
    data: &[u8],
    algorithm: SignatureAlgorithm,
    signature: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let layout = MarLayout::parse(data)?;

    let placeholder;
    let signature = match signature {
        Some(sig) => sig,
        None => {
            placeholder = vec![0u8; algorithm.signature_length()];
            &placeholder
        }
    };

    let mut out = Vec::with_capacity(data.len() + signature.len() + 64);
    out.extend_from_slice(MAR_MAGIC);
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&1u32.to_be_bytes());
    out.extend_from_slice(&algorithm.id().to_be_bytes());
    out.extend_from_slice(&(signature.len() as u32).to_be_bytes());
    out.extend_from_slice(signature);

    match &layout.additional {
        Some(additional) => out.extend_from_slice(additional),
        None => out.extend_from_slice(&0u32.to_be_bytes()),
    }

    let new_data_offset = out.len();
    out.extend_from_slice(&data[layout.data_offset..layout.index_offset as usize]);

    let index_offset = out.len();
    let delta = new_data_offset as i64 - layout.data_offset as i64;

    let mut index = vec![];
    for entry in &layout.index {
        let offset = u32::try_from(entry.offset as i64 + delta)
            .map_err(|_| mar_error("entry offset out of range"))?;
        index.extend_from_slice(&offset.to_be_bytes());
        index.extend_from_slice(&entry.size.to_be_bytes());
        index.extend_from_slice(&entry.flags.to_be_bytes());
        index.extend_from_slice(&entry.name);
        index.push(0);
    }
    out.extend_from_slice(&(index.len() as u32).to_be_bytes());
    out.extend_from_slice(&index);

    let index_offset =
        u32::try_from(index_offset).map_err(|_| mar_error("package too large"))?;
    out[4..8].copy_from_slice(&index_offset.to_be_bytes());
    let file_size = out.len() as u64;
    out[8..16].copy_from_slice(&file_size.to_be_bytes());

    Ok(out)
}

/// Compute the digest to sign for a package with a placeholder signature.
pub fn signature_digest(data: &[u8]) -> Result<Vec<u8>> {
    let layout = MarLayout::parse(data)?;
    Ok(layout.signed_digest(data)?.1)
}

fn parse_public_key(pem_data: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem_data)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem_data))
        .map_err(|e| SigningError::Verification(format!("unable to parse public key: {}", e)))
}

/// Verify the first signature of a package against a PEM public key.
pub fn verify_signature(data: &[u8], public_key_pem: &str) -> Result<()> {
    let layout = MarLayout::parse(data)?;
    let (algorithm, digest) = layout.signed_digest(data)?;
    let key = parse_public_key(public_key_pem)?;

    let hash = match algorithm {
        SignatureAlgorithm::Sha1 => Hash::SHA1,
        SignatureAlgorithm::Sha384 => Hash::SHA2_384,
    };

    key.verify(
        PaddingScheme::new_pkcs1v15_sign(Some(hash)),
        &digest,
        &layout.signatures[0].signature,
    )
    .map_err(|e| SigningError::Verification(format!("MAR signature does not verify: {}", e)))
}
