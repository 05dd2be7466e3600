// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Client for the remote signing service.

The service exposes `POST {url}/sign/file`, `/sign/hash` and `/sign/data`.
Requests are JSON arrays with a single object holding the base64 encoded
input, an optional key id and format specific options. Requests are
authenticated with [Hawk](hawk).

Transport failures are retried with exponential backoff. HTTP error
responses are not retried. A deadline bounds each call including its
retries.
*/

pub mod hawk;
pub mod request;
pub mod transport;

pub use {
    request::{Payload, SigningOptions},
    transport::{OracleHttpRequest, OracleHttpResponse, OracleTransport, ReqwestTransport},
};

use {
    crate::{
        config::{OracleEndpoint, OracleSettings},
        error::{Result, SigningError},
        format::SigningFormat,
    },
    log::{debug, info, warn},
    rand::Rng,
    serde::Deserialize,
    std::{
        io::{BufReader, BufWriter, Write},
        path::{Path, PathBuf},
        sync::Arc,
        time::{Duration, Instant},
    },
    url::Url,
};

/// What the service signs and what it returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigningMethod {
    /// The input is a file. The response is the signed file.
    File,
    /// The input is a digest. The response is a signature.
    Hash,
    /// The input is arbitrary data. The response is a signature.
    Data,
}

impl SigningMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Hash => "hash",
            Self::Data => "data",
        }
    }
}

#[derive(Deserialize)]
struct SignResponseItem {
    #[serde(default)]
    signed_file: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

fn parse_response(method: SigningMethod, body: &[u8]) -> Result<String> {
    let items: Vec<SignResponseItem> = serde_json::from_slice(body)
        .map_err(|e| SigningError::Oracle(format!("malformed response: {}", e)))?;

    let item = items
        .into_iter()
        .next()
        .ok_or_else(|| SigningError::Oracle("response contained no results".into()))?;

    let (field, value) = match method {
        SigningMethod::File => ("signed_file", item.signed_file),
        SigningMethod::Hash | SigningMethod::Data => ("signature", item.signature),
    };

    value.ok_or_else(|| SigningError::Oracle(format!("response lacks {}", field)))
}

/// Performs authenticated signing requests.
#[derive(Clone)]
pub struct OracleClient {
    transport: Arc<dyn OracleTransport>,
    settings: OracleSettings,
    scratch_dir: PathBuf,
}

impl OracleClient {
    /// Construct a client writing request bodies into `scratch_dir`.
    pub fn new(
        transport: Arc<dyn OracleTransport>,
        settings: OracleSettings,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transport,
            settings,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn settings(&self) -> &OracleSettings {
        &self.settings
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.retry_delay_ms as f64;
        let exp = base * 2f64.powi(attempt.saturating_sub(1) as i32);
        let jittered = exp * rand::thread_rng().gen_range(0.5..1.5);

        Duration::from_millis(jittered.min(self.settings.max_retry_delay_ms as f64) as u64)
    }

    /// Sign a payload and return the raw response value.
    ///
    /// For [SigningMethod::File] and [SigningMethod::Hash] the value is
    /// base64. For [SigningMethod::Data] it is whatever the signer produces,
    /// such as an ASCII armored signature.
    pub async fn sign(
        &self,
        endpoint: &OracleEndpoint,
        method: SigningMethod,
        payload: Payload<'_>,
        format: &SigningFormat,
        extension_id: Option<&str>,
    ) -> Result<String> {
        let key_id = format.key_id().or(endpoint.key_id.as_deref());
        let options = SigningOptions::for_format(format, extension_id)?;
        let url = Url::parse(&format!(
            "{}/sign/{}",
            endpoint.url.trim_end_matches('/'),
            method.as_str()
        ))?;

        let body = tempfile::Builder::new()
            .prefix("signing-request-")
            .suffix(".json")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| SigningError::IoPath(self.scratch_dir.clone(), e))?;
        {
            let mut writer = BufWriter::new(body.as_file());
            request::write_request_body(&mut writer, payload, key_id, options.as_ref())?;
            writer.flush()?;
        }
        let content_length = body.as_file().metadata()?.len();
        let payload_hash = hawk::payload_hash(
            transport::REQUEST_CONTENT_TYPE,
            BufReader::new(std::fs::File::open(body.path())?),
        )?;

        info!(
            "requesting {} signature from {} (key id {})",
            format.base(),
            url,
            key_id.unwrap_or("<default>")
        );
        let start = Instant::now();

        let response = tokio::time::timeout(
            self.settings.deadline(),
            self.send_with_retries(endpoint, &url, body.path(), content_length, &payload_hash),
        )
        .await
        .map_err(|_| {
            SigningError::Oracle(format!(
                "request to {} exceeded deadline of {}s",
                url, self.settings.deadline_secs
            ))
        })??;

        debug!(
            "{} responded in {:.2}s",
            url,
            start.elapsed().as_secs_f64()
        );

        parse_response(method, &response.body)
    }

    async fn send_with_retries(
        &self,
        endpoint: &OracleEndpoint,
        url: &Url,
        body_path: &Path,
        content_length: u64,
        payload_hash: &str,
    ) -> Result<OracleHttpResponse> {
        let attempts = self.settings.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let authorization = hawk::HawkRequest::new(
                &endpoint.client_id,
                &endpoint.key,
                Some(payload_hash),
            )
            .authorization("POST", url);

            let request = OracleHttpRequest {
                url: url.clone(),
                authorization,
                body_path: body_path.to_path_buf(),
                content_length,
            };

            match self.transport.post(&request).await {
                Ok(response) if (200..300).contains(&response.status) => return Ok(response),
                Ok(response) => {
                    return Err(SigningError::OracleStatus {
                        url: url.to_string(),
                        status: response.status,
                        body: String::from_utf8_lossy(&response.body).to_string(),
                    });
                }
                Err(e) if attempt < attempts => {
                    let delay = self.retry_delay(attempt);
                    warn!(
                        "request to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        url, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(SigningError::Oracle(format!(
                        "request to {} failed after {} attempts: {}",
                        url, attempts, e
                    )));
                }
            }
        }
    }

    /// Sign a file and write the signed result to `dest`.
    pub async fn sign_file(
        &self,
        endpoint: &OracleEndpoint,
        source: &Path,
        format: &SigningFormat,
        extension_id: Option<&str>,
        dest: &Path,
    ) -> Result<()> {
        let signed = self
            .sign(
                endpoint,
                SigningMethod::File,
                Payload::File(source),
                format,
                extension_id,
            )
            .await?;

        crate::io::write_bytes_atomically(dest, &base64::decode(signed.trim())?)
    }

    /// Sign a digest and return the raw signature.
    pub async fn sign_hash(
        &self,
        endpoint: &OracleEndpoint,
        digest: &[u8],
        format: &SigningFormat,
    ) -> Result<Vec<u8>> {
        let signature = self
            .sign(
                endpoint,
                SigningMethod::Hash,
                Payload::Bytes(digest),
                format,
                None,
            )
            .await?;

        Ok(base64::decode(signature.trim())?)
    }
}
