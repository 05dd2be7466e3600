// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use {std::path::PathBuf, thiserror::Error};

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum SigningError {
    /// A format or a file could not be mapped to a signing operation.
    #[error("classification error: {0}")]
    Classification(String),

    #[error("container error on {path}: {cause}")]
    Container { path: PathBuf, cause: String },

    #[error("no signing endpoint supports format {format} for {cert_type}")]
    NoSuitableEndpoint { cert_type: String, format: String },

    /// The signing service rejected a request or could not be reached.
    #[error("signing service error: {0}")]
    Oracle(String),

    #[error("signing service returned HTTP {status} from {url}: {body}")]
    OracleStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("signature has unexpected length: expected {expected} bytes, got {actual}")]
    SignatureLength { expected: usize, actual: usize },

    #[error("signature verification failed: {0}")]
    Verification(String),

    #[error("signature envelope error: {0}")]
    Envelope(String),

    /// The timestamp server failed or returned an unusable response.
    #[error("timestamp error: {0}")]
    Timestamp(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path {0}: {1:?}")]
    IoPath(PathBuf, std::io::Error),

    #[error("JSON error: {0:?}")]
    Json(#[from] serde_json::Error),

    #[error("base64 decoding error: {0:?}")]
    Base64(#[from] base64::DecodeError),

    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[error("zip error: {0:?}")]
    Zip(#[from] zip::result::ZipError),

    #[error("HTTP error: {0:?}")]
    Reqwest(#[from] reqwest::Error),

    #[error("failed to sign {path} as {format}: {source}")]
    Request {
        path: PathBuf,
        format: String,
        #[source]
        source: Box<SigningError>,
    },
}

impl SigningError {
    /// Wrap an error with the artifact and format it occurred on.
    pub fn for_request(self, path: impl Into<PathBuf>, format: impl ToString) -> Self {
        Self::Request {
            path: path.into(),
            format: format.to_string(),
            source: Box::new(self),
        }
    }

    pub(crate) fn container(path: impl Into<PathBuf>, cause: impl ToString) -> Self {
        Self::Container {
            path: path.into(),
            cause: cause.to_string(),
        }
    }

    /// Obtain the innermost error, unwrapping request context.
    pub fn root_cause(&self) -> &SigningError {
        match self {
            Self::Request { source, .. } => source.root_cause(),
            e => e,
        }
    }
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, SigningError>;
