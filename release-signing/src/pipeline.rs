// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing entry points.

[sign] handles a single artifact and format. [sign_with_formats] applies a
list of formats to one artifact in dependency order. [sign_file_list]
handles everything a signing task asks for and collects the results in
the artifact directory.
*/

use {
    crate::{
        context::SigningContext,
        error::{Result, SigningError},
        format::{sort_formats, SigningFormat, Strategy},
        io::copy_atomically,
        strategy,
    },
    log::{info, warn},
    std::path::{Path, PathBuf},
};

/// Location of the public GPG key in the artifact directory.
pub const GPG_KEY_ARTIFACT: &str = "public/build/KEY";

/// A request to sign one artifact with one format.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SigningRequest {
    pub source: PathBuf,
    /// Format string, optionally with a `:keyid` suffix.
    pub format: String,
    /// Where the signed artifact goes. Defaults to `source`.
    pub destination: Option<PathBuf>,
    /// Program name for installer signatures.
    pub comment: Option<String>,
}

impl SigningRequest {
    pub fn new(source: impl Into<PathBuf>, format: impl ToString) -> Self {
        Self {
            source: source.into(),
            format: format.to_string(),
            destination: None,
            comment: None,
        }
    }

    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl ToString) -> Self {
        self.comment = Some(comment.to_string());
        self
    }
}

async fn sign_request(context: &SigningContext, request: &SigningRequest) -> Result<Vec<PathBuf>> {
    let format = SigningFormat::parse(&request.format)?;
    let strategy = format.strategy()?;

    let destination = match &request.destination {
        Some(dest) if dest != &request.source => dest,
        _ => {
            return strategy::apply(
                context,
                strategy,
                &request.source,
                &format,
                request.comment.as_deref(),
            )
            .await
        }
    };

    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| SigningError::IoPath(parent.to_path_buf(), e))?;

    // A file already at the destination is set aside and restored if
    // signing fails.
    let backup = if destination.exists() {
        let backup = tempfile::Builder::new()
            .prefix(".backup-")
            .tempfile_in(parent)
            .map_err(|e| SigningError::IoPath(parent.to_path_buf(), e))?
            .into_temp_path();
        std::fs::rename(destination, &backup)
            .map_err(|e| SigningError::IoPath(destination.clone(), e))?;
        Some(backup)
    } else {
        None
    };

    let res = match copy_atomically(&request.source, destination) {
        Ok(()) => {
            strategy::apply(
                context,
                strategy,
                destination,
                &format,
                request.comment.as_deref(),
            )
            .await
        }
        Err(e) => Err(e),
    };

    if res.is_err() {
        if destination.exists() {
            warn!("removing unsigned copy {}", destination.display());
            if let Err(e) = std::fs::remove_file(destination) {
                warn!("unable to remove {}: {}", destination.display(), e);
            }
        }
        if let Some(backup) = &backup {
            info!("restoring previous {}", destination.display());
            if let Err(e) = std::fs::rename(backup, destination) {
                warn!("unable to restore {}: {}", destination.display(), e);
            }
        }
    }

    res
}

/// Sign an artifact.
///
/// Returns the produced files, primary output first. Errors carry the
/// artifact path and format.
pub async fn sign(context: &SigningContext, request: &SigningRequest) -> Result<Vec<PathBuf>> {
    info!("signing {} with {}", request.source.display(), request.format);

    sign_request(context, request)
        .await
        .map_err(|e| e.for_request(&request.source, &request.format))
}

/// Apply several formats to an artifact.
///
/// Formats run in the order given by [sort_formats]. When a format
/// replaces the artifact (such as a disk image becoming a tarball), later
/// formats apply to the replacement. Returns all produced files, primary
/// output first.
pub async fn sign_with_formats<S: AsRef<str>>(
    context: &SigningContext,
    source: &Path,
    formats: &[S],
    comment: Option<&str>,
) -> Result<Vec<PathBuf>> {
    let mut current = source.to_path_buf();
    let mut sidecars: Vec<PathBuf> = vec![];

    for format in sort_formats(formats) {
        let mut request = SigningRequest::new(&current, &format);
        request.comment = comment.map(|c| c.to_string());

        let mut produced = sign(context, &request).await?.into_iter();
        if let Some(primary) = produced.next() {
            current = primary;
        }
        for path in produced {
            if !sidecars.contains(&path) {
                sidecars.push(path);
            }
        }
    }

    let mut outputs = vec![current.clone()];
    outputs.extend(sidecars.into_iter().filter(|p| p != &current));

    Ok(outputs)
}

fn validate_comment<P: AsRef<Path>>(
    comment: Option<&str>,
    artifacts: &[(P, Vec<SigningFormat>)],
) -> Result<()> {
    if comment.is_none() {
        return Ok(());
    }

    let mut has_authenticode = false;
    for (_, formats) in artifacts {
        for format in formats {
            if format.strategy()? == Strategy::Authenticode {
                has_authenticode = true;
            }
        }
    }
    if !has_authenticode {
        return Err(SigningError::Classification(
            "a comment requires an authenticode format".into(),
        ));
    }

    if !artifacts
        .iter()
        .any(|(path, _)| crate::io::file_name_lower(path.as_ref()).ends_with(".msi"))
    {
        return Err(SigningError::Classification(
            "a comment can only be applied to .msi files".into(),
        ));
    }

    Ok(())
}

/// Sign every artifact of a task and copy the results to the artifact
/// directory.
///
/// `artifacts` pairs a path, relative to the work directory or absolute,
/// with its formats. Files keep their path relative to the work directory
/// in the artifact directory. The public GPG key is published when a GPG
/// format is used. Returns the paths written to the artifact directory.
pub async fn sign_file_list<P: AsRef<Path>, S: AsRef<str>>(
    context: &SigningContext,
    artifacts: &[(P, Vec<S>)],
    comment: Option<&str>,
) -> Result<Vec<PathBuf>> {
    let config = context.config();

    let parsed = artifacts
        .iter()
        .map(|(path, formats)| {
            let formats = formats
                .iter()
                .map(|f| SigningFormat::parse(f.as_ref()))
                .collect::<Result<Vec<_>>>()?;
            Ok((config.work_dir.join(path.as_ref()), formats))
        })
        .collect::<Result<Vec<_>>>()?;

    validate_comment(comment, &parsed)?;
    config.validate_for_formats(parsed.iter().flat_map(|(_, formats)| formats.iter()))?;

    let mut published = vec![];

    for (path, formats) in artifacts {
        let source = config.work_dir.join(path.as_ref());
        let outputs = sign_with_formats(context, &source, formats, comment).await?;

        for output in outputs {
            let rel = match output.strip_prefix(&config.work_dir) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => PathBuf::from(output.file_name().unwrap_or_default()),
            };
            let dest = config.artifact_dir.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SigningError::IoPath(parent.to_path_buf(), e))?;
            }

            info!("copying {} to {}", output.display(), dest.display());
            copy_atomically(&output, &dest)?;
            published.push(dest);
        }
    }

    let uses_gpg = parsed
        .iter()
        .flat_map(|(_, formats)| formats.iter())
        .any(|f| matches!(f.strategy(), Ok(Strategy::Gpg)));
    if uses_gpg {
        if let Some(key) = &config.gpg_pubkey {
            let dest = config.artifact_dir.join(GPG_KEY_ARTIFACT);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SigningError::IoPath(parent.to_path_buf(), e))?;
            }
            copy_atomically(key, &dest)?;
            published.push(dest);
        }
    }

    Ok(published)
}
