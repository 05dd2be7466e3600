// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `omni.ja` resource archive signing.

Resource archives are signed like add-ons. The signed copy returned by the
signing service is not used directly. Only its `META-INF` entries are merged
into the original archive so the original entry layout and preload list
survive.
*/

use {
    crate::{
        classify,
        container::{self, jar, ArchiveMember, RebuildMode},
        context::SigningContext,
        error::{Result, SigningError},
        format::{SigningFormat, OMNIJA_EXTENSION_ID},
        strategy::join_fail_fast,
    },
    log::info,
    std::path::{Path, PathBuf},
};

/// Sign a resource archive file in place.
async fn sign_resource_archive(
    context: &SigningContext,
    path: &Path,
    format: &SigningFormat,
) -> Result<()> {
    let work_dir = &context.config().work_dir;
    let signed = tempfile::Builder::new()
        .prefix("omni-signed-")
        .suffix(".ja")
        .tempfile_in(work_dir)
        .map_err(|e| SigningError::IoPath(work_dir.clone(), e))?;

    info!("signing resource archive {}", path.display());
    context
        .sign_file(path, format, Some(OMNIJA_EXTENSION_ID), signed.path())
        .await?;

    jar::merge_signature(path, signed.path(), path)
}

/// Sign the `omni.ja` members of the archive at `path`.
///
/// A bare `omni.ja` is signed directly. Disk images are converted first.
pub async fn sign(
    context: &SigningContext,
    path: &Path,
    format: &SigningFormat,
) -> Result<Vec<PathBuf>> {
    let path = context.convert_disk_image_if_needed(path).await?;

    if path
        .file_name()
        .and_then(|n| n.to_str())
        .map(classify::is_resource_archive_member)
        .unwrap_or_default()
    {
        sign_resource_archive(context, &path, format).await?;
        return Ok(vec![path]);
    }

    let limits = context.config().limits;
    let manifest = container::list_members(&path, &limits)?;
    let targets = manifest
        .file_names()
        .filter(|name| classify::is_resource_archive_member(name))
        .map(|name| name.to_string())
        .collect::<Vec<_>>();

    if targets.is_empty() {
        info!("no omni.ja in {}; leaving it unchanged", path.display());
        return Ok(vec![path]);
    }

    let scratch = context.scratch_dir("omnija-")?;
    let members = container::extract(&path, scratch.path(), None, &limits)?;

    join_fail_fast(
        targets,
        context.config().oracle.max_concurrent_signings,
        |name| {
            let root = scratch.path();
            async move {
                let member = ArchiveMember::new(root, &name, true)?;
                sign_resource_archive(context, &member.path, format).await
            }
        },
    )
    .await?;

    container::rebuild(&path, &members, RebuildMode::Overwrite)?;

    Ok(vec![path])
}
