// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing format strings.

A signing format names what kind of signature an artifact receives. Format
strings may carry an explicit key identifier after the first colon
(`autograph_hash_only_mar384:firefox_2024_rel`) and may be qualified by an
environment prefix (`stage_`, `gcp_prod_`). The prefix is ignored when
choosing a [Strategy] but the full base format is what the signing service
sees.
*/

use {
    crate::error::{Result, SigningError},
    std::fmt::{Display, Formatter},
};

/// Environment prefixes stripped before dispatch.
const FORMAT_PREFIXES: &[&str] = &["stage_", "gcp_prod_"];

/// Extension id used when signing `omni.ja` resource archives.
pub const OMNIJA_EXTENSION_ID: &str = "omni.ja@mozilla.org";

/// The way an artifact is signed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    /// Send the whole file and replace it with the signed response.
    File,
    /// Write a detached RSA signature of the file digest to `<file>.sig`.
    Detached,
    /// Write an ASCII armored GPG signature to `<file>.asc`.
    Gpg,
    /// Sign protected binaries inside an archive.
    Widevine,
    /// Re-sign `omni.ja` resource archives inside an archive.
    Omnija,
    /// Hash sign an update package.
    Mar,
    /// Embed Authenticode signatures in Windows binaries.
    Authenticode,
    /// Sign an add-on or language pack.
    Xpi,
    /// Sign a macOS application tarball.
    MacApp,
}

/// Variant details for Authenticode formats.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthenticodeVariant {
    pub ev: bool,
    pub stub: bool,
    /// Timestamp with RFC 3161 regardless of the configured style.
    pub rfc3161: bool,
    pub generation: Option<&'static str>,
}

/// A parsed signing format string.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SigningFormat {
    raw: String,
    base: String,
    key_id: Option<String>,
}

impl SigningFormat {
    /// Parse a `format[:keyid]` string.
    pub fn parse(s: &str) -> Result<Self> {
        let (base, key_id) = match s.split_once(':') {
            Some((base, key_id)) => (base, Some(key_id)),
            None => (s, None),
        };

        if base.is_empty() {
            return Err(SigningError::Classification(format!(
                "empty signing format in {:?}",
                s
            )));
        }

        Ok(Self {
            raw: s.to_string(),
            base: base.to_string(),
            key_id: key_id.filter(|k| !k.is_empty()).map(|k| k.to_string()),
        })
    }

    /// The format string as it was declared.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The format without any key identifier.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Explicit key identifier, if one was given.
    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// The base format with environment prefixes removed.
    pub fn unprefixed(&self) -> &str {
        strip_prefixes(&self.base)
    }

    /// Resolve the strategy that handles this format.
    ///
    /// Unrecognized formats receive plain file signing. Apple notarization
    /// formats are handled by a different service and are refused.
    pub fn strategy(&self) -> Result<Strategy> {
        let fmt = self.unprefixed();

        if fmt.starts_with("apple_notarization") {
            return Err(SigningError::Classification(format!(
                "{} is not handled by this signer",
                self.base
            )));
        }

        if fmt.starts_with("autograph_xpi") {
            return Ok(Strategy::Xpi);
        }

        if self.authenticode_variant().is_some() {
            return Ok(Strategy::Authenticode);
        }

        Ok(match fmt {
            "autograph_hash_only_mar384" | "autograph_stage_mar384" => Strategy::Mar,
            "autograph_gpg" | "gpg" => Strategy::Gpg,
            "autograph_widevine" | "widevine" => Strategy::Widevine,
            "autograph_omnija" => Strategy::Omnija,
            "autograph_langpack" | "privileged_webextension" | "system_addon" => Strategy::Xpi,
            "autograph_rsa" => Strategy::Detached,
            "macapp" => Strategy::MacApp,
            _ => Strategy::File,
        })
    }

    /// Whether this is an Android package format.
    pub fn is_apk(&self) -> bool {
        let fmt = self.unprefixed();
        fmt.starts_with("autograph_apk_") || fmt == "autograph_focus"
    }

    /// Whether this format produces add-on signatures.
    pub fn is_xpi(&self) -> bool {
        matches!(
            self.unprefixed(),
            "autograph_omnija" | "autograph_langpack" | "privileged_webextension" | "system_addon"
        ) || self.unprefixed().starts_with("autograph_xpi")
    }

    /// Whether this is a language pack format.
    pub fn is_langpack(&self) -> bool {
        self.unprefixed() == "autograph_langpack"
    }

    /// COSE algorithms and PKCS#7 digest requested for add-on signing.
    ///
    /// `autograph_xpi_<DIGEST>_<ALG>[_<ALG>...]` selects them explicitly;
    /// other add-on formats use `ES256` with `SHA256`.
    pub fn xpi_signing_options(&self) -> Result<(Vec<String>, String)> {
        let fmt = self.unprefixed();

        let rest = match fmt.strip_prefix("autograph_xpi_") {
            Some(rest) => rest,
            None => return Ok((vec!["ES256".to_string()], "SHA256".to_string())),
        };

        let mut parts = rest.split('_');
        let digest = parts.next().unwrap_or_default();
        if !matches!(digest, "SHA256" | "SHA1") {
            return Err(SigningError::Classification(format!(
                "unsupported PKCS#7 digest {} in {}",
                digest, self.base
            )));
        }

        let algorithms = parts.map(|s| s.to_string()).collect::<Vec<_>>();
        if algorithms.is_empty() {
            return Err(SigningError::Classification(format!(
                "no COSE algorithms in {}",
                self.base
            )));
        }
        if let Some(bad) = algorithms
            .iter()
            .find(|a| !matches!(a.as_str(), "PS256" | "ES256" | "ES384" | "ES512"))
        {
            return Err(SigningError::Classification(format!(
                "unsupported COSE algorithm {} in {}",
                bad, self.base
            )));
        }

        Ok((algorithms, digest.to_string()))
    }

    /// Authenticode variant details, if this is an Authenticode format.
    pub fn authenticode_variant(&self) -> Option<AuthenticodeVariant> {
        let fmt = self.unprefixed();

        if fmt == "autograph_authenticode" {
            return Some(AuthenticodeVariant {
                ev: false,
                stub: false,
                rfc3161: false,
                generation: None,
            });
        }

        let (ev, rest) = if let Some(rest) = fmt.strip_prefix("autograph_authenticode_sha2") {
            (false, rest)
        } else if let Some(rest) = fmt.strip_prefix("autograph_authenticode_ev") {
            (true, rest)
        } else if let Some(rest) = fmt.strip_prefix("autograph_authenticode") {
            (false, rest)
        } else {
            return None;
        };

        let (generation, rest) = if let Some(rest) = rest.strip_prefix("_202404") {
            (Some("202404"), rest)
        } else if let Some(rest) = rest.strip_prefix("_202412") {
            (Some("202412"), rest)
        } else {
            (None, rest)
        };

        let stub = match rest {
            "" => false,
            "_stub" | "_rfc3161_stub" => true,
            _ => return None,
        };

        // Only the sha2 family carries the bare and rfc3161 suffixes.
        if !ev && generation.is_none() && !fmt.starts_with("autograph_authenticode_sha2") {
            return None;
        }
        if rest == "_rfc3161_stub" && generation.is_some() {
            return None;
        }

        Some(AuthenticodeVariant {
            ev,
            stub,
            rfc3161: rest == "_rfc3161_stub",
            generation,
        })
    }
}

impl Display for SigningFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn strip_prefixes(fmt: &str) -> &str {
    let mut fmt = fmt;
    for prefix in FORMAT_PREFIXES {
        if let Some(rest) = fmt.strip_prefix(prefix) {
            fmt = rest;
        }
    }
    fmt
}

/// Order formats so that formats producing detached or container-level
/// signatures run after formats that rewrite the artifact.
///
/// The sort is stable. Widevine, omnija, macapp, rsa and gpg formats (with
/// any environment prefix) are moved to the end, in that order.
pub fn sort_formats<S: AsRef<str>>(formats: &[S]) -> Vec<String> {
    const TRAILING: &[&[&str]] = &[
        &["widevine", "autograph_widevine"],
        &["autograph_omnija"],
        &["macapp"],
        &["autograph_rsa"],
        &["autograph_gpg", "gpg"],
    ];

    let group = |fmt: &str| -> usize {
        let base = fmt.split_once(':').map(|(b, _)| b).unwrap_or(fmt);
        let base = strip_prefixes(base);
        TRAILING
            .iter()
            .position(|names| names.contains(&base))
            .map(|p| p + 1)
            .unwrap_or(0)
    };

    let mut formats = formats
        .iter()
        .map(|f| f.as_ref().to_string())
        .collect::<Vec<_>>();
    formats.sort_by_key(|f| group(f));
    formats
}
