// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test fixtures: a fake signing service, fake collaborators and archive builders.

use {
    crate::{
        authenticode::{
            der,
            timestamp::{TimestampTransport, RFC3161_CONTENT_TYPE},
        },
        config::{OracleEndpoint, OracleRegistry, OracleSettings, SigningConfig},
        container::{
            jar::{JarEntry, JarReader, JarWriter},
            ArchiveKind, TarCompression,
        },
        context::SigningContext,
        dmg::{tarball_path, DiskImageConverter},
        error::{Result, SigningError},
        oracle::{OracleHttpRequest, OracleHttpResponse, OracleTransport},
    },
    async_trait::async_trait,
    sha2::{Digest, Sha256},
    std::{
        collections::BTreeMap,
        io::{Read, Write},
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    },
    url::Url,
    yasna::{models::ObjectIdentifier, DERWriter, Tag},
};

pub const TEST_CERT_TYPE: &str = "project:releng:signing:cert:dep-signing";

/// Formats the test endpoint advertises.
pub const TEST_FORMATS: &[&str] = &[
    "autograph_authenticode",
    "autograph_authenticode_202404",
    "autograph_authenticode_ev",
    "autograph_authenticode_sha2",
    "autograph_authenticode_sha2_rfc3161_stub",
    "autograph_authenticode_sha2_stub",
    "autograph_focus",
    "autograph_gpg",
    "autograph_hash_only_mar384",
    "autograph_langpack",
    "autograph_mar384",
    "autograph_omnija",
    "autograph_rsa",
    "autograph_stage_mar384",
    "autograph_widevine",
    "autograph_xpi_SHA256_ES256_PS256",
    "default",
    "macapp",
    "privileged_webextension",
    "stage_autograph_hash_only_mar384",
    "system_addon",
    "widevine",
];

pub const ARMORED_SIGNATURE: &str =
    "-----BEGIN PGP SIGNATURE-----\n\nZmFrZQ==\n-----END PGP SIGNATURE-----\n";

/// A request as seen by [FakeOracle].
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub url: String,
    pub authorization: String,
    pub body: serde_json::Value,
}

/// An in-process signing service.
///
/// `file` requests for zip input return the archive with signature files
/// under `META-INF`. Other files get `signed` appended. `hash` requests
/// return a fixed signature of 512 bytes unless configured otherwise.
/// `data` requests return [ARMORED_SIGNATURE].
#[derive(Default)]
pub struct FakeOracle {
    requests: Mutex<Vec<RecordedRequest>>,
    attempts: AtomicUsize,
    transport_failures: AtomicUsize,
    status: Mutex<Option<(u16, String)>>,
    signature_length: Mutex<Option<usize>>,
}

impl FakeOracle {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Fail the next `count` requests in transport.
    pub fn fail_next_transport(&self, count: usize) {
        self.transport_failures.store(count, Ordering::SeqCst);
    }

    /// Answer every request with an HTTP status and body.
    pub fn respond_with_status(&self, status: u16, body: &str) {
        *self.status.lock().unwrap() = Some((status, body.to_string()));
    }

    pub fn set_signature_length(&self, length: usize) {
        *self.signature_length.lock().unwrap() = Some(length);
    }

    fn signed_file(input: &[u8]) -> Result<Vec<u8>> {
        match JarReader::from_bytes(input) {
            Ok(reader) => {
                let mut writer = JarWriter::new();
                for entry in reader.entries() {
                    writer.add(entry.clone());
                }
                writer.add(JarEntry::new(
                    "META-INF/manifest.mf",
                    b"Manifest-Version: 1.0\n",
                    true,
                )?);
                writer.add(JarEntry::new("META-INF/mozilla.rsa", b"signature", true)?);
                writer.to_bytes()
            }
            Err(_) => {
                let mut out = input.to_vec();
                out.extend_from_slice(b"signed");
                Ok(out)
            }
        }
    }
}

#[async_trait]
impl OracleTransport for FakeOracle {
    async fn post(&self, request: &OracleHttpRequest) -> Result<OracleHttpResponse> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let body: serde_json::Value = serde_json::from_slice(&std::fs::read(&request.body_path)?)?;
        assert_eq!(
            std::fs::metadata(&request.body_path)?.len(),
            request.content_length
        );
        self.requests.lock().unwrap().push(RecordedRequest {
            url: request.url.to_string(),
            authorization: request.authorization.clone(),
            body: body.clone(),
        });

        if self
            .transport_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SigningError::Oracle("connection reset".into()));
        }

        if let Some((status, body)) = self.status.lock().unwrap().clone() {
            return Ok(OracleHttpResponse {
                status,
                body: body.into_bytes(),
            });
        }

        let input = base64::decode(body[0]["input"].as_str().unwrap_or_default())?;

        let response = match request.url.path().rsplit('/').next() {
            Some("file") => {
                serde_json::json!([{"signed_file": base64::encode(Self::signed_file(&input)?)}])
            }
            Some("hash") => {
                let length = self.signature_length.lock().unwrap().unwrap_or(512);
                serde_json::json!([{"signature": base64::encode(vec![0x5au8; length])}])
            }
            Some("data") => serde_json::json!([{ "signature": ARMORED_SIGNATURE }]),
            _ => {
                return Ok(OracleHttpResponse {
                    status: 404,
                    body: b"not found".to_vec(),
                })
            }
        };

        Ok(OracleHttpResponse {
            status: 200,
            body: serde_json::to_vec(&response)?,
        })
    }
}

/// Serial number of the certificate [FakeTimestamper] returns.
pub const TIMESTAMP_CERT_SERIAL: u32 = 4711;

/// A request as seen by [FakeTimestamper].
#[derive(Clone, Debug)]
pub struct RecordedTimestampRequest {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// An in-process timestamp server.
///
/// RFC 3161 requests are answered with a token over the requested digest.
/// Legacy requests are answered with a `SignedData` whose signer carries the
/// SHA-256 digest of the countersigned signature.
#[derive(Default)]
pub struct FakeTimestamper {
    requests: Mutex<Vec<RecordedTimestampRequest>>,
    failures: AtomicUsize,
    status: Mutex<Option<u16>>,
}

fn write_oid(writer: DERWriter, oid: &[u64]) {
    writer.write_oid(&ObjectIdentifier::from_slice(oid));
}

/// A PKCS#7 `ContentInfo` holding `SignedData` around `content`.
fn fake_signed_data(
    content_type: &[u64],
    content: &[u8],
    certificates: &[Vec<u8>],
    signer_info: &[u8],
) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            write_oid(writer.next(), &[1, 2, 840, 113549, 1, 7, 2]);
            writer.next().write_tagged(Tag::context(0), |writer| {
                writer.write_sequence(|writer| {
                    writer.next().write_u8(1);
                    writer.next().write_set(|writer| {
                        write_algorithm(writer.next());
                    });
                    writer.next().write_sequence(|writer| {
                        write_oid(writer.next(), content_type);
                        writer
                            .next()
                            .write_tagged(Tag::context(0), |writer| writer.write_bytes(content));
                    });
                    if !certificates.is_empty() {
                        writer
                            .next()
                            .write_tagged_implicit(Tag::context(0), |writer| {
                                writer.write_set_of(|writer| {
                                    for cert in certificates {
                                        writer.next().write_der(cert);
                                    }
                                });
                            });
                    }
                    writer
                        .next()
                        .write_set(|writer| writer.next().write_der(signer_info));
                });
            });
        });
    })
}

fn fake_signer_info(digest: &[u8]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_u8(1);
            writer.next().write_bytes(digest);
        })
    })
}

impl FakeTimestamper {
    pub fn requests(&self) -> Vec<RecordedTimestampRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Answer the next `count` requests with HTTP 503.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Answer every request with an empty body and `status`.
    pub fn respond_with_status(&self, status: u16) {
        *self.status.lock().unwrap() = Some(status);
    }

    /// A `TimeStampResp` with `status` answering a DER `TimeStampReq`.
    pub fn rfc3161_response(request: &[u8], status: u8) -> Result<Vec<u8>> {
        let (request, _) = der::read_element(request)?;
        let fields = der::children(request.content)?;
        let message_imprint = fields[1];
        let nonce = fields[2];
        let digest = der::children(message_imprint.content)?[1].content;

        let tst_info = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer.next().write_u8(1);
                write_oid(writer.next(), &[1, 3, 6, 1, 4, 1, 4146, 2, 3]);
                writer.next().write_der(message_imprint.encoded);
                writer.next().write_u32(1);
                writer.next().write_der(b"\x18\x0f20261019120000Z");
                writer.next().write_der(nonce.encoded);
            })
        });
        let token = fake_signed_data(
            &[1, 2, 840, 113549, 1, 9, 16, 1, 4],
            &tst_info,
            &[],
            &fake_signer_info(digest),
        );

        Ok(yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer
                    .next()
                    .write_sequence(|writer| writer.next().write_u8(status));
                if status <= 1 {
                    writer.next().write_der(&token);
                }
            })
        }))
    }

    /// A base64 `SignedData` answering a legacy `TimeStampRequest`.
    pub fn legacy_response(request: &[u8]) -> Result<Vec<u8>> {
        let request = base64::decode(request)?;
        let (request, _) = der::read_element(&request)?;
        let content_info = der::children(request.content)?[1];
        let explicit = der::children(content_info.content)?[1];
        let (signature, _) = der::read_element(explicit.content)?;

        let response = fake_signed_data(
            &[1, 2, 840, 113549, 1, 7, 1],
            signature.content,
            &[fake_certificate("Timestamp Authority", TIMESTAMP_CERT_SERIAL)],
            &fake_signer_info(&Sha256::digest(signature.content)),
        );

        Ok(base64::encode(response).into_bytes())
    }
}

#[async_trait]
impl TimestampTransport for FakeTimestamper {
    async fn post(
        &self,
        url: &Url,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<OracleHttpResponse> {
        self.requests.lock().unwrap().push(RecordedTimestampRequest {
            url: url.to_string(),
            content_type: content_type.to_string(),
            body: body.clone(),
        });

        let unavailable = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let status = if unavailable {
            Some(503)
        } else {
            *self.status.lock().unwrap()
        };
        if let Some(status) = status {
            return Ok(OracleHttpResponse {
                status,
                body: vec![],
            });
        }

        let body = if content_type == RFC3161_CONTENT_TYPE {
            Self::rfc3161_response(&body, 0)?
        } else {
            Self::legacy_response(&body)?
        };

        Ok(OracleHttpResponse { status: 200, body })
    }
}

/// Disk image converter producing a fixed tarball.
pub struct FakeDiskImages {
    members: Vec<(String, Vec<u8>)>,
    conversions: AtomicUsize,
}

impl FakeDiskImages {
    pub fn new(members: &[(&str, &[u8])]) -> Self {
        Self {
            members: members
                .iter()
                .map(|(name, data)| (name.to_string(), data.to_vec()))
                .collect(),
            conversions: AtomicUsize::new(0),
        }
    }

    pub fn conversions(&self) -> usize {
        self.conversions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiskImageConverter for FakeDiskImages {
    async fn convert(&self, source: &Path, scratch_dir: &Path) -> Result<PathBuf> {
        assert!(scratch_dir.is_dir());
        self.conversions.fetch_add(1, Ordering::SeqCst);

        let dest = tarball_path(source);
        let members = self
            .members
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
            .collect::<Vec<_>>();
        write_tar(&dest, &members)?;

        Ok(dest)
    }
}

pub fn test_endpoint(formats: &[&str]) -> OracleEndpoint {
    OracleEndpoint {
        url: "https://autograph.example.com".to_string(),
        client_id: "signer".to_string(),
        key: "secret".to_string(),
        formats: formats.iter().map(|s| s.to_string()).collect(),
        key_id: None,
    }
}

pub fn test_config(dir: &Path) -> SigningConfig {
    let mut config = SigningConfig::new(dir.join("work"), dir.join("artifacts"));
    config.oracle = OracleSettings {
        retry_delay_ms: 0,
        ..Default::default()
    };
    config
}

/// A context rooted at `dir` using `oracle` as the signing service.
pub fn test_context(dir: &Path, oracle: Arc<FakeOracle>) -> SigningContext {
    test_context_with_config(test_config(dir), oracle)
}

pub fn test_context_with_config(config: SigningConfig, oracle: Arc<FakeOracle>) -> SigningContext {
    std::fs::create_dir_all(&config.work_dir).unwrap();
    std::fs::create_dir_all(&config.artifact_dir).unwrap();

    let mut endpoints = BTreeMap::new();
    endpoints.insert(TEST_CERT_TYPE.to_string(), vec![test_endpoint(TEST_FORMATS)]);

    SigningContext::new(config, OracleRegistry::new(endpoints), TEST_CERT_TYPE)
        .unwrap()
        .with_transport(oracle)
        .with_timestamp_transport(Arc::new(FakeTimestamper::default()))
        .with_disk_image_converter(Arc::new(FakeDiskImages::new(&[])))
}

/// Write a file, creating parent directories.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

/// Write a deflated zip archive.
pub fn write_zip(path: &Path, members: &[(&str, &[u8])]) -> Result<()> {
    let mut zf = zip::ZipWriter::new(std::fs::File::create(path)?);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, data) in members {
        zf.start_file(*name, options)?;
        zf.write_all(data)?;
    }
    zf.finish()?;

    Ok(())
}

/// Read all members of a zip archive in archive order.
pub fn read_zip(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path)?)?;

    let mut res = vec![];
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let mut data = vec![];
        file.read_to_end(&mut data)?;
        res.push((file.name().to_string(), data));
    }

    Ok(res)
}

/// Write a tar archive compressed according to the file name.
pub fn write_tar(path: &Path, members: &[(&str, &[u8])]) -> Result<()> {
    let compression = match ArchiveKind::from_path(path) {
        Some(ArchiveKind::Tar(compression)) => compression,
        _ => panic!("{} is not a tarball name", path.display()),
    };

    let fh = std::fs::File::create(path)?;
    let writer: Box<dyn Write> = match compression {
        TarCompression::Gzip => Box::new(flate2::write::GzEncoder::new(
            fh,
            flate2::Compression::default(),
        )),
        TarCompression::Bzip2 => Box::new(bzip2::write::BzEncoder::new(
            fh,
            bzip2::Compression::default(),
        )),
        TarCompression::Xz => Box::new(xz2::write::XzEncoder::new(fh, 6)),
    };

    let mut builder = tar::Builder::new(writer);
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, name, *data)?;
    }
    // Finishing the builder and dropping the encoder flushes everything.
    builder.into_inner()?.flush()?;

    Ok(())
}

fn write_name(writer: DERWriter, cn: &str) {
    writer.write_sequence(|writer| {
        writer.next().write_set(|writer| {
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&ObjectIdentifier::from_slice(&[2, 5, 4, 3]));
                writer.next().write_utf8_string(cn);
            });
        });
    });
}

fn write_algorithm(writer: DERWriter) {
    writer.write_sequence(|writer| {
        writer
            .next()
            .write_oid(&ObjectIdentifier::from_slice(&[1, 2, 840, 113549, 1, 1, 11]));
        writer.next().write_null();
    });
}

/// A self issued certificate shaped like X.509.
///
/// Only the structure is meaningful. Nothing verifies the signature.
pub fn fake_certificate(cn: &str, serial: u32) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_sequence(|writer| {
                writer
                    .next()
                    .write_tagged(Tag::context(0), |writer| writer.write_u8(2));
                writer.next().write_u32(serial);
                write_algorithm(writer.next());
                write_name(writer.next(), cn);
                write_name(writer.next(), cn);
                writer.next().write_sequence(|writer| {
                    write_algorithm(writer.next());
                    writer.next().write_bitvec_bytes(&[0u8; 16], 128);
                });
            });
            write_algorithm(writer.next());
            writer.next().write_bitvec_bytes(&[0u8; 32], 256);
        });
    })
}
