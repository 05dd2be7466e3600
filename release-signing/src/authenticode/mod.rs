// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Authenticode signatures for Windows binaries.

Signing a binary is a four step affair:

1. Compute the envelope specific digest of the file and wrap it in an
   `SpcIndirectDataContent` plus authenticated attributes
   ([PreparedSignature::new]).
2. Have the signing service sign the digest of the authenticated attributes
   ([PreparedSignature::signed_attributes_digest]).
3. Optionally have a timestamp server countersign the signature
   ([timestamp::Timestamper]).
4. Assemble the PKCS#7 `SignedData` and embed it in the file
   ([PreparedSignature::finish] and [Envelope::embed]).

PE images (`.exe`, `.dll`, `.bin`) and Windows Installer packages (`.msi`)
are supported.
*/

pub mod der;
pub mod msi;
pub mod pe;
pub mod pkcs7;
pub mod timestamp;

use {
    crate::{
        config::SigningConfig,
        error::{Result, SigningError},
        format::SigningFormat,
    },
    digest::{Digest, DynDigest},
    log::debug,
    pkcs7::{AuthenticatedAttributes, SignerIdentity},
    timestamp::Countersignature,
    std::path::{Path, PathBuf},
};

/// Digest used for the file digest and the attribute digest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestAlgorithm {
    Sha256,
}

impl DigestAlgorithm {
    pub fn oid(&self) -> &'static [u64] {
        match self {
            Self::Sha256 => &[2, 16, 840, 1, 101, 3, 4, 2, 1],
        }
    }

    pub fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            Self::Sha256 => Box::new(sha2::Sha256::new()),
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize().to_vec()
    }

    /// The digest algorithm of a format.
    ///
    /// Every current Authenticode format signs SHA-256 digests.
    pub fn for_format(format: &SigningFormat) -> Result<Self> {
        if format.authenticode_variant().is_none() {
            return Err(SigningError::Classification(format!(
                "{} is not an Authenticode format",
                format
            )));
        }

        Ok(Self::Sha256)
    }
}

/// Where a signature is stored in a file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Envelope {
    /// PE certificate table.
    Pe,
    /// `\u{5}DigitalSignature` stream of a compound file.
    Msi,
}

impl Envelope {
    /// Resolve the envelope for a file name.
    pub fn for_path(path: &Path) -> Result<Self> {
        let name = crate::io::file_name_lower(path);

        match name.rsplit_once('.').map(|(_, ext)| ext) {
            Some("exe" | "dll" | "bin") => Ok(Self::Pe),
            Some("msi") => Ok(Self::Msi),
            Some("msix") => Err(SigningError::Envelope(format!(
                "{}: MSIX packages have no Authenticode envelope",
                path.display()
            ))),
            _ => Err(SigningError::Classification(format!(
                "{} is not a Windows binary",
                path.display()
            ))),
        }
    }

    pub fn is_signed(&self, path: &Path) -> Result<bool> {
        match self {
            Self::Pe => pe::is_signed(&read(path)?),
            Self::Msi => msi::is_signed(path),
        }
    }

    pub fn digest(&self, path: &Path, algorithm: DigestAlgorithm) -> Result<Vec<u8>> {
        match self {
            Self::Pe => pe::digest(&read(path)?, algorithm),
            Self::Msi => msi::digest(path, algorithm),
        }
    }

    pub fn spc_indirect_data(&self, digest: &[u8], algorithm: DigestAlgorithm) -> Vec<u8> {
        match self {
            Self::Pe => pkcs7::spc_indirect_data_pe(digest, algorithm),
            Self::Msi => pkcs7::spc_indirect_data_msi(digest, algorithm),
        }
    }

    /// Embed a PKCS#7 signature, atomically replacing the file.
    pub fn embed(&self, path: &Path, pkcs7: &[u8]) -> Result<()> {
        match self {
            Self::Pe => {
                let signed = pe::embed(&read(path)?, pkcs7)?;
                crate::io::write_bytes_atomically(path, &signed)
            }
            Self::Msi => msi::embed(path, pkcs7),
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| SigningError::IoPath(path.to_path_buf(), e))
}

/// Name of the configured certificate chain for a format.
///
/// `authenticode_cert`, then `_ev` for EV formats, then the certificate
/// generation and finally the explicit key id.
pub fn certificate_name(format: &SigningFormat) -> Result<String> {
    let variant = format.authenticode_variant().ok_or_else(|| {
        SigningError::Classification(format!("{} is not an Authenticode format", format))
    })?;

    let mut name = "authenticode_cert".to_string();
    if variant.ev {
        name.push_str("_ev");
    }
    if let Some(generation) = variant.generation {
        name.push('_');
        name.push_str(generation);
    }
    if let Some(key_id) = format.key_id() {
        name.push('_');
        name.push_str(key_id);
    }

    Ok(name)
}

/// Load the signer certificates for a format.
///
/// Stub installer formats also carry the cross certificate.
pub fn load_signer(config: &SigningConfig, format: &SigningFormat) -> Result<SignerIdentity> {
    let name = certificate_name(format)?;
    let stub = format
        .authenticode_variant()
        .map(|v| v.stub)
        .unwrap_or_default();

    let mut paths: Vec<&PathBuf> = vec![config.authenticode_certs.get(&name).ok_or_else(|| {
        SigningError::Config(format!("no certificate configured as {} for {}", name, format))
    })?];

    if stub {
        paths.push(config.authenticode_cross_cert.as_ref().ok_or_else(|| {
            SigningError::Config(format!("{} requires authenticode_cross_cert", format))
        })?);
    }

    let sources = paths
        .iter()
        .map(|p| read(p))
        .collect::<Result<Vec<_>>>()?;
    debug!("using certificates {:?} for {}", paths, format);

    SignerIdentity::from_pem_sources(&sources.iter().map(|s| s.as_slice()).collect::<Vec<_>>())
}

/// A signature awaiting the signer's signature value.
#[derive(Clone, Debug)]
pub struct PreparedSignature {
    envelope: Envelope,
    algorithm: DigestAlgorithm,
    spc_indirect_data: Vec<u8>,
    attributes: AuthenticatedAttributes,
}

impl PreparedSignature {
    /// Digest `path` and build what the signer signs.
    ///
    /// A comment becomes the program name of installer packages. It is
    /// ignored for PE images.
    pub fn new(path: &Path, algorithm: DigestAlgorithm, comment: Option<&str>) -> Result<Self> {
        let envelope = Envelope::for_path(path)?;
        let digest = envelope.digest(path, algorithm)?;
        let spc_indirect_data = envelope.spc_indirect_data(&digest, algorithm);

        let comment = match envelope {
            Envelope::Msi => comment,
            Envelope::Pe => None,
        };
        let attributes = AuthenticatedAttributes::new(&spc_indirect_data, algorithm, comment)?;

        Ok(Self {
            envelope,
            algorithm,
            spc_indirect_data,
            attributes,
        })
    }

    pub fn envelope(&self) -> Envelope {
        self.envelope
    }

    /// The digest the signing service signs.
    pub fn signed_attributes_digest(&self) -> Vec<u8> {
        self.algorithm.digest(self.attributes.signed_bytes())
    }

    /// Assemble the PKCS#7 signature.
    pub fn finish(
        &self,
        signer: &SignerIdentity,
        signature: &[u8],
        countersignature: Option<&Countersignature>,
    ) -> Vec<u8> {
        pkcs7::signed_data(
            &self.spc_indirect_data,
            &self.attributes,
            self.algorithm,
            signer,
            signature,
            countersignature,
        )
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::{fake_certificate, write_file},
    };

    #[test]
    fn envelope_selection() {
        assert_eq!(Envelope::for_path(Path::new("a/setup.EXE")).ok(), Some(Envelope::Pe));
        assert_eq!(Envelope::for_path(Path::new("xul.dll")).ok(), Some(Envelope::Pe));
        assert_eq!(Envelope::for_path(Path::new("x.msi")).ok(), Some(Envelope::Msi));
        assert!(matches!(
            Envelope::for_path(Path::new("x.msix")),
            Err(SigningError::Envelope(_))
        ));
        assert!(matches!(
            Envelope::for_path(Path::new("x.txt")),
            Err(SigningError::Classification(_))
        ));
    }

    #[test]
    fn certificate_names() -> Result<()> {
        let name = |s: &str| -> Result<String> { certificate_name(&SigningFormat::parse(s)?) };

        assert_eq!(name("autograph_authenticode_sha2")?, "authenticode_cert");
        assert_eq!(name("autograph_authenticode_ev")?, "authenticode_cert_ev");
        assert_eq!(
            name("autograph_authenticode_202404")?,
            "authenticode_cert_202404"
        );
        assert_eq!(
            name("autograph_authenticode_ev_202412")?,
            "authenticode_cert_ev_202412"
        );
        assert_eq!(
            name("stage_autograph_authenticode_sha2_stub:mozilla")?,
            "authenticode_cert_mozilla"
        );
        assert!(name("autograph_gpg").is_err());

        Ok(())
    }

    #[test]
    fn digest_algorithms() -> Result<()> {
        assert_eq!(
            DigestAlgorithm::for_format(&SigningFormat::parse("autograph_authenticode")?)?,
            DigestAlgorithm::Sha256
        );
        assert_eq!(
            DigestAlgorithm::for_format(&SigningFormat::parse("autograph_authenticode_sha2")?)?,
            DigestAlgorithm::Sha256
        );
        assert_eq!(
            hex::encode(DigestAlgorithm::Sha256.digest(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(DigestAlgorithm::for_format(&SigningFormat::parse("autograph_gpg")?).is_err());

        Ok(())
    }

    #[test]
    fn stub_formats_need_cross_cert() -> Result<()> {
        let td = tempfile::tempdir()?;
        let cert = td.path().join("cert.pem");
        let cross = td.path().join("cross.pem");
        write_file(
            &cert,
            pem::encode(&pem::Pem::new("CERTIFICATE", fake_certificate("Signer", 1))).as_bytes(),
        )?;
        write_file(
            &cross,
            pem::encode(&pem::Pem::new("CERTIFICATE", fake_certificate("Cross", 2))).as_bytes(),
        )?;

        let mut config = crate::config::SigningConfig::new(td.path(), td.path());
        config
            .authenticode_certs
            .insert("authenticode_cert".into(), cert);

        let format = SigningFormat::parse("autograph_authenticode_sha2")?;
        assert_eq!(load_signer(&config, &format)?.certificates().len(), 1);

        let stub = SigningFormat::parse("autograph_authenticode_sha2_stub")?;
        assert!(matches!(
            load_signer(&config, &stub),
            Err(SigningError::Config(_))
        ));

        config.authenticode_cross_cert = Some(cross);
        assert_eq!(load_signer(&config, &stub)?.certificates().len(), 2);

        let ev = SigningFormat::parse("autograph_authenticode_ev")?;
        assert!(load_signer(&config, &ev).is_err());

        Ok(())
    }

    #[test]
    fn prepared_pe_signature() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("setup.exe");
        write_file(&path, &pe::tests::build_pe(b"code"))?;

        let prepared = PreparedSignature::new(&path, DigestAlgorithm::Sha256, Some("ignored"))?;
        assert_eq!(prepared.envelope(), Envelope::Pe);
        assert_eq!(prepared.signed_attributes_digest().len(), 32);

        let signer = SignerIdentity::new(vec![fake_certificate("Signer", 1)])?;
        let pkcs7 = prepared.finish(&signer, &[1u8; 256], None);
        prepared.envelope().embed(&path, &pkcs7)?;

        assert!(Envelope::Pe.is_signed(&path)?);
        assert_eq!(
            pe::embedded_signature(&std::fs::read(&path)?)?.map(|s| s[0..pkcs7.len()].to_vec()),
            Some(pkcs7)
        );

        Ok(())
    }
}
