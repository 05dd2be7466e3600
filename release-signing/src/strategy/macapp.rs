// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! macOS application signing.

use {
    crate::{context::SigningContext, error::Result, format::SigningFormat},
    log::info,
    std::path::{Path, PathBuf},
};

/// Sign a tarball of an application bundle.
///
/// Disk images are converted to a tarball first and the tarball is what
/// gets signed and returned.
pub async fn sign(
    context: &SigningContext,
    path: &Path,
    format: &SigningFormat,
) -> Result<Vec<PathBuf>> {
    let path = context.convert_disk_image_if_needed(path).await?;

    info!("signing application {}", path.display());
    context.sign_file(&path, format, None, &path).await?;

    Ok(vec![path])
}
