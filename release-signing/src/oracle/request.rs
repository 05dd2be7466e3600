// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing service request bodies. */

use {
    crate::{
        error::{Result, SigningError},
        format::SigningFormat,
    },
    serde::Serialize,
    std::{
        io::{Read, Write},
        path::Path,
    },
};

/// Input bytes are base64 encoded in blocks of this size. It is a multiple
/// of 3 so that blocks concatenate into a single valid encoding.
const ENCODE_BLOCK_SIZE: usize = 1020;

/// Format specific options sent with a request.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SigningOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cose_algorithms: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkcs7_digest: Option<String>,
}

impl SigningOptions {
    /// Options a format requires, if any.
    pub fn for_format(format: &SigningFormat, extension_id: Option<&str>) -> Result<Option<Self>> {
        if format.is_apk() {
            let mut options = Self {
                zip: Some("passthrough".to_string()),
                ..Default::default()
            };
            if format.unprefixed().ends_with("_sha1") {
                options.pkcs7_digest = Some("SHA1".to_string());
            }

            Ok(Some(options))
        } else if format.is_xpi() {
            let id = extension_id.ok_or_else(|| {
                SigningError::Classification(format!(
                    "{} requires an extension id",
                    format.base()
                ))
            })?;
            let (algorithms, digest) = format.xpi_signing_options()?;

            Ok(Some(Self {
                id: Some(id.to_string()),
                cose_algorithms: Some(algorithms),
                pkcs7_digest: Some(digest),
                ..Default::default()
            }))
        } else {
            Ok(None)
        }
    }
}

/// What gets signed.
#[derive(Clone, Copy, Debug)]
pub enum Payload<'a> {
    Bytes(&'a [u8]),
    File(&'a Path),
}

fn read_block(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Write a request body of the form
/// `[{"input": "<base64>", "keyid": "..", "options": {..}}]`.
///
/// File payloads are encoded incrementally and are never fully loaded.
pub fn write_request_body(
    writer: &mut impl Write,
    payload: Payload<'_>,
    key_id: Option<&str>,
    options: Option<&SigningOptions>,
) -> Result<()> {
    writer.write_all(b"[{\"input\": \"")?;

    match payload {
        Payload::Bytes(data) => {
            writer.write_all(base64::encode(data).as_bytes())?;
        }
        Payload::File(path) => {
            let mut fh = std::fs::File::open(path)
                .map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?;
            let mut block = [0u8; ENCODE_BLOCK_SIZE];
            loop {
                let count = read_block(&mut fh, &mut block)?;
                if count == 0 {
                    break;
                }
                writer.write_all(base64::encode(&block[0..count]).as_bytes())?;
                if count < ENCODE_BLOCK_SIZE {
                    break;
                }
            }
        }
    }

    writer.write_all(b"\"")?;

    if let Some(key_id) = key_id {
        write!(writer, ", \"keyid\": {}", serde_json::to_string(key_id)?)?;
    }
    if let Some(options) = options {
        write!(writer, ", \"options\": {}", serde_json::to_string(options)?)?;
    }

    writer.write_all(b"}]")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::Value};

    #[test]
    fn options_for_formats() -> Result<()> {
        assert_eq!(
            SigningOptions::for_format(&SigningFormat::parse("autograph_mar384")?, None)?,
            None
        );

        let options =
            SigningOptions::for_format(&SigningFormat::parse("autograph_apk_foo_sha1")?, None)?
                .unwrap();
        assert_eq!(options.zip.as_deref(), Some("passthrough"));
        assert_eq!(options.pkcs7_digest.as_deref(), Some("SHA1"));

        let options =
            SigningOptions::for_format(&SigningFormat::parse("autograph_focus")?, None)?.unwrap();
        assert_eq!(options.pkcs7_digest, None);

        let options = SigningOptions::for_format(
            &SigningFormat::parse("stage_autograph_omnija")?,
            Some("omni.ja@mozilla.org"),
        )?
        .unwrap();
        assert_eq!(
            serde_json::to_value(&options)?,
            serde_json::json!({
                "id": "omni.ja@mozilla.org",
                "cose_algorithms": ["ES256"],
                "pkcs7_digest": "SHA256",
            })
        );

        assert!(
            SigningOptions::for_format(&SigningFormat::parse("autograph_langpack")?, None).is_err()
        );

        Ok(())
    }

    #[test]
    fn body_streams_file() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("input");
        // Not a multiple of the block size.
        let data = (0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        std::fs::write(&path, &data)?;

        let mut body = vec![];
        write_request_body(&mut body, Payload::File(&path), Some("key1"), None)?;

        let value: Value = serde_json::from_slice(&body)?;
        let input = value[0]["input"].as_str().unwrap();
        assert_eq!(base64::decode(input)?, data);
        assert_eq!(value[0]["keyid"], "key1");
        assert!(value[0].get("options").is_none());

        let mut body = vec![];
        write_request_body(&mut body, Payload::Bytes(b"digest"), None, None)?;
        assert_eq!(
            String::from_utf8_lossy(&body),
            format!("[{{\"input\": \"{}\"}}]", base64::encode(b"digest"))
        );

        Ok(())
    }
}
