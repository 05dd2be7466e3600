// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Whole file signing.

use {
    crate::{context::SigningContext, error::Result, format::SigningFormat},
    log::info,
    std::path::{Path, PathBuf},
};

/// Replace `path` with the signed file returned by the signing service.
pub async fn sign(
    context: &SigningContext,
    path: &Path,
    format: &SigningFormat,
) -> Result<Vec<PathBuf>> {
    info!("signing {} as {}", path.display(), format);
    context.sign_file(path, format, None, path).await?;

    Ok(vec![path.to_path_buf()])
}
