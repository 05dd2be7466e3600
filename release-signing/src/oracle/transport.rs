// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! HTTP transport to the signing service. */

use {
    crate::error::{Result, SigningError},
    async_trait::async_trait,
    reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE},
    std::{path::PathBuf, time::Duration},
    url::Url,
};

/// Content type of request bodies.
pub const REQUEST_CONTENT_TYPE: &str = "application/json";

/// A fully authenticated request, with its body stored in a file.
#[derive(Clone, Debug)]
pub struct OracleHttpRequest {
    pub url: Url,
    pub authorization: String,
    pub body_path: PathBuf,
    pub content_length: u64,
}

/// A response from the signing service.
#[derive(Clone, Debug)]
pub struct OracleHttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Sends requests to the signing service.
///
/// Errors returned by a transport are treated as transient and are
/// retried. HTTP error statuses are returned as responses.
#[async_trait]
pub trait OracleTransport: Send + Sync {
    async fn post(&self, request: &OracleHttpRequest) -> Result<OracleHttpResponse>;
}

/// [OracleTransport] backed by a [reqwest::Client].
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("release-signing/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl OracleTransport for ReqwestTransport {
    async fn post(&self, request: &OracleHttpRequest) -> Result<OracleHttpResponse> {
        let body = tokio::fs::File::open(&request.body_path)
            .await
            .map_err(|e| SigningError::IoPath(request.body_path.clone(), e))?;

        let res = self
            .client
            .post(request.url.clone())
            .header(AUTHORIZATION, &request.authorization)
            .header(CONTENT_TYPE, REQUEST_CONTENT_TYPE)
            .header(CONTENT_LENGTH, request.content_length)
            .body(reqwest::Body::from(body))
            .send()
            .await?;

        let status = res.status().as_u16();
        let body = res.bytes().await?.to_vec();

        Ok(OracleHttpResponse { status, body })
    }
}
