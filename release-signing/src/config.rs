// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signer configuration.

Two documents configure the signer. [SigningConfig] holds paths, limits and
tuning knobs. [OracleRegistry] holds the signing service endpoints, keyed by
the certificate scope of the task (e.g.
`project:releng:signing:cert:dep-signing`). Both are JSON and are loaded
once per process.
*/

use {
    crate::{
        error::{Result, SigningError},
        format::SigningFormat,
    },
    serde::Deserialize,
    std::{
        collections::{BTreeMap, BTreeSet},
        fmt::{Debug, Formatter},
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// A signing service endpoint.
#[derive(Clone, Deserialize, Eq, PartialEq)]
pub struct OracleEndpoint {
    /// Base URL. Requests go to `{url}/sign/{method}`.
    pub url: String,
    /// Hawk credential id.
    pub client_id: String,
    /// Hawk shared secret.
    #[serde(alias = "access_key")]
    pub key: String,
    /// Formats this endpoint can produce.
    pub formats: BTreeSet<String>,
    /// Key used when a format does not name one.
    #[serde(default)]
    pub key_id: Option<String>,
}

impl Debug for OracleEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleEndpoint")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("key", &"<redacted>")
            .field("formats", &self.formats)
            .field("key_id", &self.key_id)
            .finish()
    }
}

impl OracleEndpoint {
    pub fn supports(&self, format: &str) -> bool {
        self.formats.contains(format)
    }
}

/// Signing endpoints keyed by certificate scope.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct OracleRegistry {
    endpoints: BTreeMap<String, Vec<OracleEndpoint>>,
}

impl OracleRegistry {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| SigningError::Config(format!("invalid signing endpoint config: {}", e)))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            std::fs::read(path).map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?;
        Self::from_json(&data)
    }

    /// Construct from an explicit endpoint map.
    pub fn new(endpoints: BTreeMap<String, Vec<OracleEndpoint>>) -> Self {
        Self { endpoints }
    }

    /// Find the first endpoint under `cert_type` that can produce `format`.
    ///
    /// Only the base format is considered. A key id suffix does not affect
    /// endpoint selection.
    pub fn resolve(&self, cert_type: &str, format: &SigningFormat) -> Result<&OracleEndpoint> {
        self.endpoints
            .get(cert_type)
            .and_then(|endpoints| endpoints.iter().find(|e| e.supports(format.base())))
            .ok_or_else(|| SigningError::NoSuitableEndpoint {
                cert_type: cert_type.to_string(),
                format: format.base().to_string(),
            })
    }
}

/// Size ceilings applied to archives before anything is extracted.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct ArchiveLimits {
    /// Maximum size of an archive file.
    pub max_archive_size: u64,
    /// Maximum compressed size of a single member.
    pub max_member_size: u64,
    /// Maximum uncompressed to compressed size ratio of a member.
    pub max_compression_ratio: f64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_archive_size: 4 * 1024 * 1024 * 1024,
            max_member_size: 2 * 1024 * 1024 * 1024,
            max_compression_ratio: 100.0,
        }
    }
}

/// Tuning for signing service requests.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    /// Total attempts for a request that fails in transport.
    pub attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub retry_delay_ms: u64,
    /// Upper bound on a single retry delay, in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Deadline for a request including all retries, in seconds.
    pub deadline_secs: u64,
    /// Upper bound on concurrent requests made for one archive.
    pub max_concurrent_signings: usize,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay_ms: 2000,
            max_retry_delay_ms: 60_000,
            deadline_secs: 600,
            max_concurrent_signings: 10,
        }
    }
}

impl OracleSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

/// How Authenticode signatures are countersigned by a timestamp server.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub enum TimestampStyle {
    /// The pre RFC 3161 Authenticode protocol.
    #[serde(rename = "old")]
    Legacy,
    #[serde(rename = "rfc3161")]
    Rfc3161,
}

fn default_mar_verify_keys() -> BTreeMap<String, BTreeMap<String, String>> {
    let stage = [("dep-signing", "autograph_stage.pem")];
    let hash_only = [
        ("release-signing", "release_primary.pem"),
        ("nightly-signing", "nightly_aurora_level3_primary.pem"),
        ("dep-signing", "dep1.pem"),
    ];

    let to_map = |entries: &[(&str, &str)]| {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
    };

    let mut keys = BTreeMap::new();
    for prefix in ["", "stage_", "gcp_prod_"] {
        keys.insert(format!("{}autograph_stage_mar384", prefix), to_map(&stage));
        keys.insert(
            format!("{}autograph_hash_only_mar384", prefix),
            to_map(&hash_only),
        );
    }
    keys
}

/// Public keys for verifying freshly signed update packages.
#[derive(Clone, Debug, Deserialize)]
pub struct MarVerification {
    /// Directory holding PEM public keys.
    pub keys_dir: PathBuf,
    /// Format -> certificate level -> key file name.
    #[serde(default = "default_mar_verify_keys")]
    pub defaults: BTreeMap<String, BTreeMap<String, String>>,
}

impl MarVerification {
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            keys_dir: keys_dir.into(),
            defaults: default_mar_verify_keys(),
        }
    }

    /// Resolve the verification key file for a signing operation.
    ///
    /// An explicit key id selects `<key_id>.pem`. Otherwise the key comes
    /// from the defaults table, using the last `:` component of the cert
    /// scope as the certificate level.
    pub fn key_path(&self, cert_type: &str, format: &SigningFormat) -> Result<PathBuf> {
        if let Some(key_id) = format.key_id() {
            if key_id.contains('/') || key_id.contains('\\') || key_id == ".." {
                return Err(SigningError::Config(format!(
                    "key id {} is not a valid key file name",
                    key_id
                )));
            }
            return Ok(self.keys_dir.join(format!("{}.pem", key_id)));
        }

        let level = cert_type.rsplit(':').next().unwrap_or(cert_type);

        self.defaults
            .get(format.base())
            .and_then(|levels| levels.get(level))
            .map(|name| self.keys_dir.join(name))
            .ok_or_else(|| {
                SigningError::Config(format!(
                    "no verification key for {} at {}",
                    format.base(),
                    level
                ))
            })
    }
}

fn default_dmg() -> PathBuf {
    PathBuf::from("dmg")
}

fn default_hfsplus() -> PathBuf {
    PathBuf::from("hfsplus")
}

/// Primary signer configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct SigningConfig {
    /// Directory artifacts are signed in. Scratch space is created here.
    pub work_dir: PathBuf,
    /// Directory receiving auxiliary outputs such as diff logs.
    pub artifact_dir: PathBuf,
    #[serde(default = "default_dmg")]
    pub dmg: PathBuf,
    #[serde(default = "default_hfsplus")]
    pub hfsplus: PathBuf,
    /// Public GPG key shipped next to `.asc` signatures.
    #[serde(default)]
    pub gpg_pubkey: Option<PathBuf>,
    /// Certificate embedded in protected binary signature files.
    #[serde(default)]
    pub widevine_cert: Option<PathBuf>,
    /// PEM certificate chains keyed by names like `authenticode_cert`,
    /// `authenticode_cert_ev` or `authenticode_cert_202404`.
    #[serde(default)]
    pub authenticode_certs: BTreeMap<String, PathBuf>,
    /// Cross certificate added to stub installer signatures.
    #[serde(default)]
    pub authenticode_cross_cert: Option<PathBuf>,
    /// Timestamp server countersigning Authenticode signatures.
    #[serde(default)]
    pub authenticode_timestamp_url: Option<String>,
    /// Without a style only `_rfc3161_stub` formats are timestamped.
    #[serde(default)]
    pub authenticode_timestamp_style: Option<TimestampStyle>,
    #[serde(default)]
    pub mar_verification: Option<MarVerification>,
    #[serde(default)]
    pub limits: ArchiveLimits,
    #[serde(default)]
    pub oracle: OracleSettings,
}

impl SigningConfig {
    pub fn new(work_dir: impl Into<PathBuf>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            artifact_dir: artifact_dir.into(),
            dmg: default_dmg(),
            hfsplus: default_hfsplus(),
            gpg_pubkey: None,
            widevine_cert: None,
            authenticode_certs: BTreeMap::new(),
            authenticode_cross_cert: None,
            authenticode_timestamp_url: None,
            authenticode_timestamp_style: None,
            mar_verification: None,
            limits: ArchiveLimits::default(),
            oracle: OracleSettings::default(),
        }
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| SigningError::Config(format!("invalid signer config: {}", e)))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            std::fs::read(path).map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?;
        Self::from_json(&data)
    }

    /// Check that everything the given formats need is configured.
    pub fn validate_for_formats<'a>(
        &self,
        formats: impl IntoIterator<Item = &'a SigningFormat>,
    ) -> Result<()> {
        use crate::format::Strategy;

        for format in formats {
            match format.strategy()? {
                Strategy::Widevine if self.widevine_cert.is_none() => {
                    return Err(SigningError::Config(format!(
                        "{} requires widevine_cert",
                        format.base()
                    )));
                }
                Strategy::Gpg => match &self.gpg_pubkey {
                    Some(path) if path.exists() => {}
                    _ => {
                        return Err(SigningError::Config(format!(
                            "{} requires an existing gpg_pubkey",
                            format.base()
                        )));
                    }
                },
                _ => {}
            }
        }

        Ok(())
    }
}
