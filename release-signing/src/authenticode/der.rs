// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal DER walking for certificate fields and timestamp responses.

use crate::error::{Result, SigningError};

fn der_error(msg: &str) -> SigningError {
    SigningError::Envelope(format!("malformed DER: {}", msg))
}

/// A DER element: its tag, the full encoding and the content octets.
#[derive(Clone, Copy, Debug)]
pub struct Element<'a> {
    pub tag: u8,
    pub encoded: &'a [u8],
    pub content: &'a [u8],
}

/// Read the element at the start of `data`, returning it and the rest.
pub fn read_element(data: &[u8]) -> Result<(Element<'_>, &[u8])> {
    let tag = *data.first().ok_or_else(|| der_error("truncated tag"))?;
    let first = *data.get(1).ok_or_else(|| der_error("truncated length"))?;

    let (header_len, content_len) = if first & 0x80 == 0 {
        (2, first as usize)
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 4 {
            return Err(der_error("unsupported length encoding"));
        }
        let bytes = data
            .get(2..2 + count)
            .ok_or_else(|| der_error("truncated length"))?;
        let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (2 + count, len)
    };

    let end = header_len + content_len;
    if data.len() < end {
        return Err(der_error("truncated content"));
    }

    Ok((
        Element {
            tag,
            encoded: &data[0..end],
            content: &data[header_len..end],
        },
        &data[end..],
    ))
}

/// Split the content of a constructed element into its children.
pub fn children(content: &[u8]) -> Result<Vec<Element<'_>>> {
    let mut elements = vec![];
    let mut rest = content;
    while !rest.is_empty() {
        let (element, next) = read_element(rest)?;
        elements.push(element);
        rest = next;
    }

    Ok(elements)
}

/// Extract the DER encoded issuer name and serial number of a certificate.
pub fn issuer_and_serial(certificate: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let (cert, _) = read_element(certificate)?;
    if cert.tag != 0x30 {
        return Err(der_error("certificate is not a SEQUENCE"));
    }

    let (tbs, _) = read_element(cert.content)?;
    if tbs.tag != 0x30 {
        return Err(der_error("tbsCertificate is not a SEQUENCE"));
    }

    let (mut field, mut rest) = read_element(tbs.content)?;
    // [0] EXPLICIT version
    if field.tag == 0xa0 {
        let next = read_element(rest)?;
        field = next.0;
        rest = next.1;
    }
    if field.tag != 0x02 {
        return Err(der_error("serial number is not an INTEGER"));
    }
    let serial = field.encoded.to_vec();

    let (_signature_algorithm, rest) = read_element(rest)?;
    let (issuer, _) = read_element(rest)?;
    if issuer.tag != 0x30 {
        return Err(der_error("issuer is not a SEQUENCE"));
    }

    Ok((issuer.encoded.to_vec(), serial))
}
