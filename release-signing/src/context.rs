// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Per process signing state. */

use {
    crate::{
        authenticode::timestamp::TimestampTransport,
        config::{OracleEndpoint, OracleRegistry, SigningConfig},
        dmg::{self, DiskImageConverter, ExternalDiskImageConverter},
        error::{Result, SigningError},
        format::SigningFormat,
        oracle::{OracleClient, OracleTransport, Payload, ReqwestTransport, SigningMethod},
        widevine::{ProtectedBinaryCodec, WidevineCodec},
    },
    log::info,
    std::{
        path::{Path, PathBuf},
        sync::Arc,
    },
    tempfile::TempDir,
};

/// Configuration and collaborators shared by all signing operations.
///
/// A context is built once and is read only afterwards.
#[derive(Clone)]
pub struct SigningContext {
    config: SigningConfig,
    registry: OracleRegistry,
    cert_type: String,
    oracle: OracleClient,
    timestamps: Arc<dyn TimestampTransport>,
    disk_images: Arc<dyn DiskImageConverter>,
    protected_binaries: Arc<dyn ProtectedBinaryCodec>,
}

impl SigningContext {
    /// Construct a context talking to the signing service over HTTPS.
    ///
    /// `cert_type` is the certificate scope of the task and selects the
    /// endpoints used.
    pub fn new(
        config: SigningConfig,
        registry: OracleRegistry,
        cert_type: impl ToString,
    ) -> Result<Self> {
        let http = Arc::new(ReqwestTransport::new()?);
        let transport: Arc<dyn OracleTransport> = http.clone();
        let disk_images: Arc<dyn DiskImageConverter> = Arc::new(
            ExternalDiskImageConverter::new(&config.dmg, &config.hfsplus),
        );

        Ok(Self {
            oracle: OracleClient::new(transport, config.oracle, &config.work_dir),
            config,
            registry,
            cert_type: cert_type.to_string(),
            timestamps: http,
            disk_images,
            protected_binaries: Arc::new(WidevineCodec),
        })
    }

    /// Replace the transport used to reach the signing service.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn OracleTransport>) -> Self {
        self.oracle = OracleClient::new(transport, self.config.oracle, &self.config.work_dir);
        self
    }

    /// Replace the transport used to reach the timestamp server.
    #[must_use]
    pub fn with_timestamp_transport(mut self, transport: Arc<dyn TimestampTransport>) -> Self {
        self.timestamps = transport;
        self
    }

    #[must_use]
    pub fn with_disk_image_converter(mut self, converter: Arc<dyn DiskImageConverter>) -> Self {
        self.disk_images = converter;
        self
    }

    #[must_use]
    pub fn with_protected_binary_codec(mut self, codec: Arc<dyn ProtectedBinaryCodec>) -> Self {
        self.protected_binaries = codec;
        self
    }

    pub fn config(&self) -> &SigningConfig {
        &self.config
    }

    pub fn registry(&self) -> &OracleRegistry {
        &self.registry
    }

    pub fn cert_type(&self) -> &str {
        &self.cert_type
    }

    pub fn timestamp_transport(&self) -> Arc<dyn TimestampTransport> {
        self.timestamps.clone()
    }

    pub fn protected_binary_codec(&self) -> &dyn ProtectedBinaryCodec {
        self.protected_binaries.as_ref()
    }

    /// Resolve the endpoint handling `format`.
    pub fn endpoint(&self, format: &SigningFormat) -> Result<&OracleEndpoint> {
        self.registry.resolve(&self.cert_type, format)
    }

    /// Create a scratch directory under the work directory.
    ///
    /// The directory is deleted when the returned value is dropped.
    pub fn scratch_dir(&self, prefix: &str) -> Result<TempDir> {
        std::fs::create_dir_all(&self.config.work_dir)
            .map_err(|e| SigningError::IoPath(self.config.work_dir.clone(), e))?;

        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.config.work_dir)
            .map_err(|e| SigningError::IoPath(self.config.work_dir.clone(), e))
    }

    /// Have the signing service sign a file and write the result to `dest`.
    pub async fn sign_file(
        &self,
        source: &Path,
        format: &SigningFormat,
        extension_id: Option<&str>,
        dest: &Path,
    ) -> Result<()> {
        let endpoint = self.endpoint(format)?;
        self.oracle
            .sign_file(endpoint, source, format, extension_id, dest)
            .await
    }

    /// Have the signing service sign a digest.
    pub async fn sign_hash(&self, digest: &[u8], format: &SigningFormat) -> Result<Vec<u8>> {
        let endpoint = self.endpoint(format)?;
        self.oracle.sign_hash(endpoint, digest, format).await
    }

    /// Have the signing service produce a detached signature of a file.
    ///
    /// The signature is returned as produced, e.g. ASCII armored.
    pub async fn sign_data(&self, source: &Path, format: &SigningFormat) -> Result<String> {
        let endpoint = self.endpoint(format)?;
        self.oracle
            .sign(
                endpoint,
                SigningMethod::Data,
                Payload::File(source),
                format,
                None,
            )
            .await
    }

    /// Convert a disk image to a tarball. Other paths are returned as is.
    pub async fn convert_disk_image_if_needed(&self, path: &Path) -> Result<PathBuf> {
        if !dmg::is_disk_image(path) {
            return Ok(path.to_path_buf());
        }

        info!("converting disk image {}", path.display());
        let scratch = self.scratch_dir("dmg-")?;
        self.disk_images.convert(path, scratch.path()).await
    }

    /// Read the certificate embedded in protected binary signatures.
    pub fn widevine_certificate(&self) -> Result<Vec<u8>> {
        let path = self
            .config
            .widevine_cert
            .as_ref()
            .ok_or_else(|| SigningError::Config("widevine_cert is not configured".into()))?;

        std::fs::read(path).map_err(|e| SigningError::IoPath(path.clone(), e))
    }
}
