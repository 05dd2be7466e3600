// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Authenticode for PE images.

The image digest covers the whole file except the optional header checksum,
the certificate table data directory entry and the certificate table
itself. Unsigned images are hashed as if zero padded to a multiple of 8
bytes, which is where the certificate table is appended.
*/

use {
    super::DigestAlgorithm,
    crate::error::{Result, SigningError},
};

const WIN_CERT_REVISION_2_0: u16 = 0x0200;
const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;

/// Index of the certificate table in the data directories.
const CERTIFICATE_TABLE_INDEX: usize = 4;

fn pe_error(msg: impl ToString) -> SigningError {
    SigningError::Envelope(format!("invalid PE image: {}", msg.to_string()))
}

fn le_u16(data: &[u8], pos: usize) -> Result<u16> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| pe_error(format!("truncated at {}", pos)))
}

fn le_u32(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| pe_error(format!("truncated at {}", pos)))
}

/// Offsets of the fields Authenticode cares about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PeLayout {
    pub checksum_offset: usize,
    pub certificate_directory_offset: usize,
    /// File offset and size of the certificate table, if present.
    pub certificate_table: Option<(usize, usize)>,
}

impl PeLayout {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.get(0..2) != Some(b"MZ".as_ref()) {
            return Err(pe_error("missing MZ header"));
        }

        let pe_offset = le_u32(data, 0x3c)? as usize;
        if data.get(pe_offset..pe_offset + 4) != Some(b"PE\0\0".as_ref()) {
            return Err(pe_error("missing PE signature"));
        }

        let optional_header = pe_offset + 24;
        let (rva_count_offset, directories_offset) = match le_u16(data, optional_header)? {
            0x10b => (optional_header + 92, optional_header + 96),
            0x20b => (optional_header + 108, optional_header + 112),
            magic => return Err(pe_error(format!("unknown optional header magic {:#x}", magic))),
        };

        if (le_u32(data, rva_count_offset)? as usize) <= CERTIFICATE_TABLE_INDEX {
            return Err(pe_error("no certificate table data directory"));
        }

        let certificate_directory_offset = directories_offset + CERTIFICATE_TABLE_INDEX * 8;
        let table_offset = le_u32(data, certificate_directory_offset)? as usize;
        let table_size = le_u32(data, certificate_directory_offset + 4)? as usize;

        let certificate_table = if table_offset != 0 && table_size != 0 {
            if table_offset + table_size > data.len() {
                return Err(pe_error("certificate table extends past end of file"));
            }
            Some((table_offset, table_size))
        } else {
            None
        };

        Ok(Self {
            checksum_offset: optional_header + 64,
            certificate_directory_offset,
            certificate_table,
        })
    }
}

/// Whether the image carries a certificate table.
pub fn is_signed(data: &[u8]) -> Result<bool> {
    Ok(PeLayout::parse(data)?.certificate_table.is_some())
}

/// Compute the Authenticode digest of an image.
pub fn digest(data: &[u8], algorithm: DigestAlgorithm) -> Result<Vec<u8>> {
    let layout = PeLayout::parse(data)?;
    let mut hasher = algorithm.hasher();

    let end = match layout.certificate_table {
        Some((offset, _)) => offset,
        None => data.len(),
    };
    if end < layout.certificate_directory_offset + 8 {
        return Err(pe_error("certificate table overlaps headers"));
    }

    hasher.update(&data[0..layout.checksum_offset]);
    hasher.update(&data[layout.checksum_offset + 4..layout.certificate_directory_offset]);
    hasher.update(&data[layout.certificate_directory_offset + 8..end]);

    if layout.certificate_table.is_none() {
        let padding = (8 - data.len() % 8) % 8;
        hasher.update(&vec![0u8; padding]);
    }

    Ok(hasher.finalize().to_vec())
}

/// Compute the optional header checksum.
pub fn checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum = 0u64;
    let mut pos = 0;

    while pos < data.len() {
        if pos == checksum_offset {
            pos += 4;
            continue;
        }
        let word = match data.get(pos + 1) {
            Some(hi) => u16::from_le_bytes([data[pos], *hi]),
            None => data[pos] as u16,
        };
        sum += word as u64;
        sum = (sum & 0xffff) + (sum >> 16);
        pos += 2;
    }

    sum = (sum & 0xffff) + (sum >> 16);

    (sum as u32).wrapping_add(data.len() as u32)
}

/// Append a PKCS#7 signature to an unsigned image.
pub fn embed(data: &[u8], pkcs7: &[u8]) -> Result<Vec<u8>> {
    let layout = PeLayout::parse(data)?;
    if layout.certificate_table.is_some() {
        return Err(SigningError::Envelope("image is already signed".into()));
    }

    let mut out = data.to_vec();
    out.resize(out.len() + (8 - out.len() % 8) % 8, 0);
    let table_offset = out.len();

    let entry_len = 8 + pkcs7.len();
    let padded_len = entry_len + (8 - entry_len % 8) % 8;

    out.extend_from_slice(&(padded_len as u32).to_le_bytes());
    out.extend_from_slice(&WIN_CERT_REVISION_2_0.to_le_bytes());
    out.extend_from_slice(&WIN_CERT_TYPE_PKCS_SIGNED_DATA.to_le_bytes());
    out.extend_from_slice(pkcs7);
    out.resize(table_offset + padded_len, 0);

    let dir = layout.certificate_directory_offset;
    out[dir..dir + 4].copy_from_slice(&(table_offset as u32).to_le_bytes());
    out[dir + 4..dir + 8].copy_from_slice(&(padded_len as u32).to_le_bytes());

    let checksum = checksum(&out, layout.checksum_offset);
    out[layout.checksum_offset..layout.checksum_offset + 4]
        .copy_from_slice(&checksum.to_le_bytes());

    Ok(out)
}

/// The PKCS#7 blob of a signed image.
pub fn embedded_signature(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let layout = PeLayout::parse(data)?;

    Ok(match layout.certificate_table {
        Some((offset, _)) => {
            let len = le_u32(data, offset)? as usize;
            let content = data
                .get(offset + 8..offset + len)
                .ok_or_else(|| pe_error("truncated certificate entry"))?;
            Some(content.to_vec())
        }
        None => None,
    })
}
