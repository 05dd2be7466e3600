// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Timestamp countersignatures for Authenticode signatures.

A timestamp server countersigns the signature value of a `SignerInfo`. The
countersignature is stored as an unsigned attribute of that `SignerInfo`,
so it does not change what the signing service signed.

Two protocols are spoken:

* RFC 3161. A DER `TimeStampReq` over the SHA-256 digest of the signature
  is posted as `application/timestamp-query`. The `timeStampToken` of the
  response is stored under `SPC_RFC3161_OBJID`.
* The legacy Authenticode protocol. A base64 `TimeStampRequest` holding the
  signature itself is posted. The response is a base64 PKCS#7 `SignedData`
  whose `SignerInfo` is stored as a PKCS#9 countersignature. Its
  certificates join the certificates of the signature.
*/

use {
    super::der::{self, Element},
    crate::{
        config::{OracleSettings, SigningConfig, TimestampStyle},
        error::{Result, SigningError},
        format::SigningFormat,
        oracle::{OracleHttpResponse, ReqwestTransport},
    },
    async_trait::async_trait,
    log::{info, warn},
    rand::Rng,
    reqwest::header::CONTENT_TYPE,
    sha2::{Digest, Sha256},
    std::{sync::Arc, time::Duration},
    url::Url,
    yasna::{models::ObjectIdentifier, DERWriter, Tag},
};

const OID_DATA: &[u64] = &[1, 2, 840, 113549, 1, 7, 1];
const OID_SIGNED_DATA: &[u64] = &[1, 2, 840, 113549, 1, 7, 2];
const OID_COUNTERSIGNATURE: &[u64] = &[1, 2, 840, 113549, 1, 9, 6];
const OID_TST_INFO: &[u64] = &[1, 2, 840, 113549, 1, 9, 16, 1, 4];
const OID_SHA256: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 1];
const OID_SPC_TIME_STAMP_REQUEST: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 3, 2, 1];
const OID_SPC_RFC3161: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 3, 3, 1];

pub const RFC3161_CONTENT_TYPE: &str = "application/timestamp-query";
pub const LEGACY_CONTENT_TYPE: &str = "application/octet-stream";

fn timestamp_error(msg: impl ToString) -> SigningError {
    SigningError::Timestamp(msg.to_string())
}

fn write_oid(writer: DERWriter, oid: &[u64]) {
    writer.write_oid(&ObjectIdentifier::from_slice(oid));
}

fn oid_der(oid: &[u64]) -> Vec<u8> {
    yasna::construct_der(|writer| write_oid(writer, oid))
}

/// Expect an element with `tag` and return it.
fn expect_tag<'a>(element: Option<&Element<'a>>, tag: u8, what: &str) -> Result<Element<'a>> {
    match element {
        Some(element) if element.tag == tag => Ok(*element),
        _ => Err(timestamp_error(format!("malformed response: expected {}", what))),
    }
}

/// An unsigned attribute to add to a `SignerInfo`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Countersignature {
    /// DER encoded `Attribute`.
    pub attribute: Vec<u8>,
    /// Certificates to add to the `SignedData`.
    pub certificates: Vec<Vec<u8>>,
}

impl Countersignature {
    fn new(oid: &[u64], value: &[u8], certificates: Vec<Vec<u8>>) -> Self {
        let attribute = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                write_oid(writer.next(), oid);
                writer
                    .next()
                    .write_set(|writer| writer.next().write_der(value));
            })
        });

        Self {
            attribute,
            certificates,
        }
    }
}

/// DER `TimeStampReq` over the SHA-256 digest of `signature`.
pub fn rfc3161_request(signature: &[u8], nonce: u64) -> Vec<u8> {
    let digest = Sha256::digest(signature);

    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_u8(1);
            writer.next().write_sequence(|writer| {
                writer.next().write_sequence(|writer| {
                    write_oid(writer.next(), OID_SHA256);
                    writer.next().write_null();
                });
                writer.next().write_bytes(&digest);
            });
            writer.next().write_u64(nonce);
            writer.next().write_bool(true);
        })
    })
}

/// Extract the `timeStampToken` of a `TimeStampResp`.
///
/// The token must cover the SHA-256 digest of `signature` and reflect
/// `nonce` if it carries one.
pub fn parse_rfc3161_response(
    response: &[u8],
    signature: &[u8],
    nonce: u64,
) -> Result<Countersignature> {
    let (resp, _) = der::read_element(response)?;
    let resp = expect_tag(Some(&resp), 0x30, "TimeStampResp")?;
    let parts = der::children(resp.content)?;

    let status_info = expect_tag(parts.first(), 0x30, "PKIStatusInfo")?;
    let status_fields = der::children(status_info.content)?;
    let status = expect_tag(status_fields.first(), 0x02, "PKIStatus")?;
    // granted (0) or grantedWithMods (1)
    if !matches!(status.content, [0] | [1]) {
        return Err(timestamp_error(format!(
            "request rejected with status {:?}",
            status.content
        )));
    }

    let token = expect_tag(parts.get(1), 0x30, "timeStampToken")?;
    let tst_info = token_tst_info(&token)?;

    let imprint = expect_tag(tst_info.get(2), 0x30, "messageImprint")?;
    let imprint = der::children(imprint.content)?;
    let hashed_message = expect_tag(imprint.get(1), 0x04, "hashedMessage")?;
    if hashed_message.content != Sha256::digest(signature).as_slice() {
        return Err(timestamp_error("timestamp token does not cover the signature"));
    }

    // The nonce is the first INTEGER after genTime.
    if let Some(token_nonce) = tst_info.iter().skip(5).find(|e| e.tag == 0x02) {
        if token_nonce.encoded != yasna::construct_der(|w| w.write_u64(nonce)).as_slice() {
            return Err(timestamp_error("nonce mismatch"));
        }
    }

    Ok(Countersignature::new(OID_SPC_RFC3161, token.encoded, vec![]))
}

/// The fields of the `TSTInfo` inside a timestamp token.
fn token_tst_info<'a>(token: &Element<'a>) -> Result<Vec<Element<'a>>> {
    let content_info = der::children(token.content)?;
    let oid = expect_tag(content_info.first(), 0x06, "contentType")?;
    if oid.encoded != oid_der(OID_SIGNED_DATA).as_slice() {
        return Err(timestamp_error("timestamp token is not SignedData"));
    }
    let explicit = expect_tag(content_info.get(1), 0xa0, "content")?;
    let (signed_data, _) = der::read_element(explicit.content)?;
    let signed_data = der::children(signed_data.content)?;

    let encap = expect_tag(signed_data.get(2), 0x30, "encapContentInfo")?;
    let encap = der::children(encap.content)?;
    let content_type = expect_tag(encap.first(), 0x06, "eContentType")?;
    if content_type.encoded != oid_der(OID_TST_INFO).as_slice() {
        return Err(timestamp_error("timestamp token does not hold TSTInfo"));
    }
    let explicit = expect_tag(encap.get(1), 0xa0, "eContent")?;
    let (octets, _) = der::read_element(explicit.content)?;
    let octets = expect_tag(Some(&octets), 0x04, "eContent octets")?;

    let (tst_info, _) = der::read_element(octets.content)?;
    der::children(tst_info.content)
}

/// Base64 body of a legacy Authenticode `TimeStampRequest`.
pub fn legacy_request(signature: &[u8]) -> Vec<u8> {
    let der = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            write_oid(writer.next(), OID_SPC_TIME_STAMP_REQUEST);
            writer.next().write_sequence(|writer| {
                write_oid(writer.next(), OID_DATA);
                writer
                    .next()
                    .write_tagged(Tag::context(0), |writer| writer.write_bytes(signature));
            });
        })
    });

    base64::encode(der).into_bytes()
}

/// Extract the countersigning `SignerInfo` and certificates of a legacy
/// response.
pub fn parse_legacy_response(response: &[u8]) -> Result<Countersignature> {
    let text = response
        .iter()
        .filter(|b| !b.is_ascii_whitespace())
        .copied()
        .collect::<Vec<_>>();
    let der_bytes = base64::decode(text)?;

    let (content_info, _) = der::read_element(&der_bytes)?;
    let content_info = der::children(content_info.content)?;
    let oid = expect_tag(content_info.first(), 0x06, "contentType")?;
    if oid.encoded != oid_der(OID_SIGNED_DATA).as_slice() {
        return Err(timestamp_error("response is not SignedData"));
    }
    let explicit = expect_tag(content_info.get(1), 0xa0, "content")?;
    let (signed_data, _) = der::read_element(explicit.content)?;
    let signed_data = der::children(signed_data.content)?;

    let mut certificates = vec![];
    let mut signer_infos = None;
    for element in signed_data.iter().skip(3) {
        match element.tag {
            0xa0 => {
                certificates = der::children(element.content)?
                    .iter()
                    .map(|cert| cert.encoded.to_vec())
                    .collect();
            }
            0x31 => signer_infos = Some(*element),
            _ => {}
        }
    }

    let signer_infos = signer_infos.ok_or_else(|| timestamp_error("response has no signers"))?;
    let signer_info = der::children(signer_infos.content)?;
    let signer_info = expect_tag(signer_info.first(), 0x30, "SignerInfo")?;

    Ok(Countersignature::new(
        OID_COUNTERSIGNATURE,
        signer_info.encoded,
        certificates,
    ))
}

/// Sends requests to a timestamp server.
///
/// Errors returned by a transport are treated as transient and are
/// retried. HTTP error statuses are returned as responses.
#[async_trait]
pub trait TimestampTransport: Send + Sync {
    async fn post(&self, url: &Url, content_type: &str, body: Vec<u8>)
        -> Result<OracleHttpResponse>;
}

#[async_trait]
impl TimestampTransport for ReqwestTransport {
    async fn post(
        &self,
        url: &Url,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<OracleHttpResponse> {
        let res = self
            .client()
            .post(url.clone())
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;

        let status = res.status().as_u16();
        let body = res.bytes().await?.to_vec();

        Ok(OracleHttpResponse { status, body })
    }
}

/// Requests countersignatures from the configured timestamp server.
#[derive(Clone)]
pub struct Timestamper {
    transport: Arc<dyn TimestampTransport>,
    url: Url,
    style: TimestampStyle,
    settings: OracleSettings,
}

impl Timestamper {
    /// Construct the timestamper for `format`, if signatures of that format
    /// are timestamped.
    ///
    /// `_rfc3161_stub` formats always use RFC 3161. Nothing is timestamped
    /// without a timestamp URL.
    pub fn for_format(
        config: &SigningConfig,
        format: &SigningFormat,
        transport: Arc<dyn TimestampTransport>,
    ) -> Result<Option<Self>> {
        let forced = format
            .authenticode_variant()
            .map(|v| v.rfc3161)
            .unwrap_or(false);
        let style = if forced {
            Some(TimestampStyle::Rfc3161)
        } else {
            config.authenticode_timestamp_style
        };

        let (url, style) = match (&config.authenticode_timestamp_url, style) {
            (Some(url), Some(style)) => (url, style),
            (None, Some(_)) => {
                warn!("no timestamp URL configured; {} signatures are not timestamped", format);
                return Ok(None);
            }
            (_, None) => return Ok(None),
        };
        let url = Url::parse(url).map_err(|e| {
            SigningError::Config(format!("invalid timestamp URL {}: {}", url, e))
        })?;

        Ok(Some(Self {
            transport,
            url,
            style,
            settings: config.oracle,
        }))
    }

    pub fn style(&self) -> TimestampStyle {
        self.style
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .settings
            .retry_delay_ms
            .saturating_mul(1 << attempt.saturating_sub(1).min(16));

        Duration::from_millis(exp.min(self.settings.max_retry_delay_ms))
    }

    /// Countersign `signature`, the signature value of a `SignerInfo`.
    pub async fn countersign(&self, signature: &[u8]) -> Result<Countersignature> {
        let nonce = rand::thread_rng().gen::<u64>();
        let (content_type, body) = match self.style {
            TimestampStyle::Rfc3161 => (RFC3161_CONTENT_TYPE, rfc3161_request(signature, nonce)),
            TimestampStyle::Legacy => (LEGACY_CONTENT_TYPE, legacy_request(signature)),
        };
        info!("requesting {:?} timestamp from {}", self.style, self.url);

        let response = tokio::time::timeout(
            self.settings.deadline(),
            self.send_with_retries(content_type, body),
        )
        .await
        .map_err(|_| {
            timestamp_error(format!(
                "request to {} exceeded deadline of {}s",
                self.url, self.settings.deadline_secs
            ))
        })??;

        match self.style {
            TimestampStyle::Rfc3161 => parse_rfc3161_response(&response.body, signature, nonce),
            TimestampStyle::Legacy => parse_legacy_response(&response.body),
        }
    }

    /// Transport failures and server errors are retried. Other HTTP
    /// errors are terminal.
    async fn send_with_retries(
        &self,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<OracleHttpResponse> {
        let attempts = self.settings.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match self
                .transport
                .post(&self.url, content_type, body.clone())
                .await
            {
                Ok(response) if (200..300).contains(&response.status) => return Ok(response),
                Ok(response) if response.status < 500 => {
                    return Err(timestamp_error(format!(
                        "{} returned HTTP {}",
                        self.url, response.status
                    )));
                }
                Ok(response) => timestamp_error(format!("HTTP {}", response.status)),
                Err(e) => e,
            };

            if attempt >= attempts {
                return Err(timestamp_error(format!(
                    "request to {} failed after {} attempts: {}",
                    self.url, attempts, err
                )));
            }

            let delay = self.retry_delay(attempt);
            warn!(
                "timestamp request to {} failed (attempt {}/{}): {}; retrying in {:?}",
                self.url, attempt, attempts, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
