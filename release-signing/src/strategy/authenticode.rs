// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Authenticode signing of Windows binaries and zips of them. */

use {
    crate::{
        authenticode::{
            load_signer, pkcs7::SignerIdentity, timestamp::Timestamper, DigestAlgorithm,
            Envelope, PreparedSignature,
        },
        classify,
        container::{self, ArchiveKind, RebuildMode},
        context::SigningContext,
        error::{Result, SigningError},
        format::SigningFormat,
        strategy::join_fail_fast,
    },
    log::{info, warn},
    std::path::{Path, PathBuf},
};

/// Sign a single binary in place.
///
/// Returns `false` if the binary already carried a signature.
async fn sign_binary(
    context: &SigningContext,
    path: &Path,
    format: &SigningFormat,
    algorithm: DigestAlgorithm,
    signer: &SignerIdentity,
    timestamper: Option<&Timestamper>,
    comment: Option<&str>,
) -> Result<bool> {
    let envelope = Envelope::for_path(path)?;
    if envelope.is_signed(path)? {
        warn!("{} is already signed; skipping", path.display());
        return Ok(false);
    }

    let prepared = PreparedSignature::new(path, algorithm, comment)?;
    let signature = context
        .sign_hash(&prepared.signed_attributes_digest(), format)
        .await?;
    let countersignature = match timestamper {
        Some(timestamper) => Some(timestamper.countersign(&signature).await?),
        None => None,
    };
    let pkcs7 = prepared.finish(signer, &signature, countersignature.as_ref());
    envelope.embed(path, &pkcs7)?;
    info!("embedded {} byte signature in {}", pkcs7.len(), path.display());

    Ok(true)
}

fn timestamper_for(
    context: &SigningContext,
    format: &SigningFormat,
) -> Result<Option<Timestamper>> {
    let timestamper =
        Timestamper::for_format(context.config(), format, context.timestamp_transport())?;
    if timestamper.is_none() {
        info!("{} signatures are not timestamped", format);
    }

    Ok(timestamper)
}

/// Sign a Windows binary, or every Windows binary in a zip archive.
///
/// It is an error if nothing qualifies for signing.
pub async fn sign(
    context: &SigningContext,
    path: &Path,
    format: &SigningFormat,
    comment: Option<&str>,
) -> Result<Vec<PathBuf>> {
    let algorithm = DigestAlgorithm::for_format(format)?;

    if ArchiveKind::from_path(path) != Some(ArchiveKind::Zip) {
        let name = crate::io::file_name_lower(path);
        if !classify::needs_windows_signing(&name) {
            return Err(SigningError::Classification(format!(
                "{} is not a Windows binary to sign",
                path.display()
            )));
        }

        let signer = load_signer(context.config(), format)?;
        let timestamper = timestamper_for(context, format)?;
        sign_binary(
            context,
            path,
            format,
            algorithm,
            &signer,
            timestamper.as_ref(),
            comment,
        )
        .await?;

        return Ok(vec![path.to_path_buf()]);
    }

    let limits = context.config().limits;
    let manifest = container::list_members(path, &limits)?;
    let targets = manifest
        .file_names()
        .filter(|name| classify::needs_windows_signing(name))
        .map(|name| name.to_string())
        .collect::<Vec<_>>();
    if targets.is_empty() {
        return Err(SigningError::Classification(format!(
            "no Windows binaries to sign in {}",
            path.display()
        )));
    }
    info!("signing {} files in {}", targets.len(), path.display());

    let signer = load_signer(context.config(), format)?;
    let timestamper = timestamper_for(context, format)?;
    let scratch = context.scratch_dir("authenticode-")?;
    let members = container::extract(path, scratch.path(), None, &limits)?;

    let signed = join_fail_fast(
        targets,
        context.config().oracle.max_concurrent_signings,
        |name| {
            let root = scratch.path();
            let signer = &signer;
            let timestamper = timestamper.as_ref();
            async move {
                let member = container::ArchiveMember::new(root, &name, true)?;
                sign_binary(
                    context,
                    &member.path,
                    format,
                    algorithm,
                    signer,
                    timestamper,
                    comment,
                )
                .await
            }
        },
    )
    .await?;

    if signed.iter().any(|s| *s) {
        container::rebuild(path, &members, RebuildMode::Overwrite)?;
    } else {
        info!("everything in {} was already signed", path.display());
    }

    Ok(vec![path.to_path_buf()])
}
