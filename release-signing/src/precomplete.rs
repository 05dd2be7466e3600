// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `precomplete` update manifests.

Complete updates remove every file of the previous installation before
applying new content. The list of files and directories to remove lives in a
`precomplete` file at the root of the installation (or in
`Contents/Resources` of a macOS bundle). Adding signature files to an
archive means the manifest has to be regenerated.
*/

use {
    crate::error::{Result, SigningError},
    difference::{Changeset, Difference},
    log::{info, warn},
    std::{
        collections::BTreeSet,
        path::{Path, PathBuf},
    },
};

pub const PRECOMPLETE: &str = "precomplete";

/// Location of the diff log under the artifact directory.
pub const DIFF_ARTIFACT: &str = "public/logs/precomplete.diff";

fn is_excluded(rel: &str) -> bool {
    rel.ends_with("channel-prefs.js")
        || rel.ends_with("update-settings.ini")
        || rel.contains("distribution/")
}

/// Render the manifest for the installation at `root`.
///
/// `manifest_rel` is the location of the manifest itself, which is listed
/// even if it does not exist yet.
pub fn render(root: &Path, manifest_rel: &str) -> Result<String> {
    let mut files = BTreeSet::new();
    let mut dirs = BTreeSet::new();

    if !is_excluded(manifest_rel) {
        files.insert(manifest_rel.to_string());
    }

    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| SigningError::container(root, e))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| SigningError::container(root, e))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            let rel = format!("{}/", rel);
            if !is_excluded(&rel) {
                dirs.insert(rel);
            }
        } else if !is_excluded(&rel) {
            files.insert(rel);
        }
    }

    let mut out = String::new();
    for file in files.iter().rev() {
        out.push_str(&format!("remove \"{}\"\n", file));
    }
    for dir in dirs.iter().rev() {
        out.push_str(&format!("rmdir \"{}\"\n", dir));
    }

    Ok(out)
}

/// Regenerate the manifest for the directory holding it.
///
/// A manifest in a bundle's `Contents/Resources` describes the whole
/// bundle. Returns the manifest path.
pub fn generate(manifest_dir: &Path) -> Result<PathBuf> {
    let (root, manifest_rel) = if manifest_dir.file_name().map(|n| n == "Resources") == Some(true)
    {
        let root = manifest_dir
            .parent()
            .and_then(|p| p.parent())
            .ok_or_else(|| SigningError::container(manifest_dir, "bundle has no root"))?;
        (root.to_path_buf(), format!("Contents/Resources/{}", PRECOMPLETE))
    } else {
        (manifest_dir.to_path_buf(), PRECOMPLETE.to_string())
    };

    let content = render(&root, &manifest_rel)?;
    let path = root.join(&manifest_rel);
    crate::io::write_bytes_atomically(&path, content.as_bytes())?;

    Ok(path)
}

/// Find the single manifest under `root`.
pub fn find(root: &Path) -> Result<Option<PathBuf>> {
    let mut found = vec![];

    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| SigningError::container(root, e))?;
        if entry.file_type().is_file() && entry.file_name() == PRECOMPLETE {
            found.push(entry.into_path());
        }
    }

    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        _ => Err(SigningError::container(
            root,
            format!("more than one {} file: {:?}", PRECOMPLETE, found),
        )),
    }
}

/// Produce a line oriented diff in `ndiff` style.
///
/// Unchanged lines are prefixed with two spaces, removed lines with `- `
/// and added lines with `+ `.
pub fn ndiff(before: &str, after: &str) -> String {
    let changeset = Changeset::new(before.trim_end_matches('\n'), after.trim_end_matches('\n'), "\n");

    let mut out = String::new();
    for diff in &changeset.diffs {
        let (prefix, text) = match diff {
            Difference::Same(s) => ("  ", s),
            Difference::Rem(s) => ("- ", s),
            Difference::Add(s) => ("+ ", s),
        };
        for line in text.split('\n') {
            out.push_str(prefix);
            out.push_str(line);
            out.push('\n');
        }
    }

    out
}

/// Regenerate the manifest under an extracted archive and record the diff
/// under `artifact_dir`.
///
/// Returns the diff path, or `None` when the archive has no manifest.
pub fn regenerate(root: &Path, artifact_dir: &Path) -> Result<Option<PathBuf>> {
    let path = match find(root)? {
        Some(path) => path,
        None => {
            warn!("no {} file under {}; not regenerating", PRECOMPLETE, root.display());
            return Ok(None);
        }
    };

    info!("regenerating {}", path.display());
    let before =
        std::fs::read_to_string(&path).map_err(|e| SigningError::IoPath(path.clone(), e))?;

    let manifest_dir = path
        .parent()
        .ok_or_else(|| SigningError::container(&path, "manifest has no parent"))?;
    let path = generate(manifest_dir)?;
    let after =
        std::fs::read_to_string(&path).map_err(|e| SigningError::IoPath(path.clone(), e))?;

    let diff_path = artifact_dir.join(DIFF_ARTIFACT);
    if let Some(parent) = diff_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| SigningError::IoPath(parent.to_path_buf(), e))?;
    }
    crate::io::write_bytes_atomically(&diff_path, ndiff(&before, &after).as_bytes())?;

    Ok(Some(diff_path))
}
