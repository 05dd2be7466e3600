// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Archive extraction and reassembly.

Container strategies list an archive, extract it into a scratch directory,
modify or add files there and then rebuild the archive from the extracted
members. Members are identified by their `/` separated relative name.

Archives are checked against [ArchiveLimits] before anything is extracted
and member names that could escape the scratch directory are refused.
*/

pub mod jar;
pub mod tarball;
pub mod zipfile;

use {
    crate::{
        config::ArchiveLimits,
        error::{Result, SigningError},
    },
    log::warn,
    std::{
        collections::BTreeSet,
        path::{Component, Path, PathBuf},
    },
};

/// Members smaller than this are exempt from the compression ratio check.
const RATIO_CHECK_MIN_SIZE: u64 = 1024 * 1024;

/// Compression of a tar archive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TarCompression {
    Gzip,
    Bzip2,
    Xz,
}

/// Archive flavors containers can be.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArchiveKind {
    Zip,
    Tar(TarCompression),
}

impl ArchiveKind {
    /// Resolve the archive flavor from a file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = crate::io::file_name_lower(path);

        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::Tar(TarCompression::Gzip))
        } else if name.ends_with(".tar.bz2") {
            Some(Self::Tar(TarCompression::Bzip2))
        } else if name.ends_with(".tar.xz") {
            Some(Self::Tar(TarCompression::Xz))
        } else {
            None
        }
    }

    /// Like [Self::from_path] but an unsupported name is an error.
    pub fn require(path: &Path) -> Result<Self> {
        Self::from_path(path)
            .ok_or_else(|| SigningError::container(path, "unsupported archive type"))
    }
}

/// Size information of an archive member.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManifestEntry {
    pub name: String,
    pub compressed_size: u64,
    pub size: u64,
    pub is_dir: bool,
}

/// Listing of an archive.
#[derive(Clone, Debug, Default)]
pub struct ContainerManifest {
    pub archive_size: u64,
    pub entries: Vec<ManifestEntry>,
}

impl ContainerManifest {
    /// Names of members that are not directories.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.name.as_str())
    }

    /// Reject archives that look like decompression bombs.
    pub fn check_limits(&self, path: &Path, limits: &ArchiveLimits) -> Result<()> {
        if self.archive_size > limits.max_archive_size {
            return Err(SigningError::container(
                path,
                format!(
                    "archive is {} bytes; limit is {}",
                    self.archive_size, limits.max_archive_size
                ),
            ));
        }

        for entry in &self.entries {
            if entry.compressed_size > limits.max_member_size {
                return Err(SigningError::container(
                    path,
                    format!(
                        "member {} is {} bytes; limit is {}",
                        entry.name, entry.compressed_size, limits.max_member_size
                    ),
                ));
            }

            if entry.size >= RATIO_CHECK_MIN_SIZE {
                let ratio = if entry.compressed_size == 0 {
                    f64::INFINITY
                } else {
                    entry.size as f64 / entry.compressed_size as f64
                };
                if ratio > limits.max_compression_ratio {
                    return Err(SigningError::container(
                        path,
                        format!(
                            "member {} has compression ratio {:.1}; limit is {}",
                            entry.name, ratio, limits.max_compression_ratio
                        ),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// A member extracted into a scratch directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchiveMember {
    /// `/` separated name in the archive.
    pub name: String,
    /// Location of the extracted content.
    pub path: PathBuf,
    /// Whether the member was stored compressed.
    pub compressed: bool,
}

impl ArchiveMember {
    /// A member for `name` under the scratch directory `root`.
    pub fn new(root: &Path, name: &str, compressed: bool) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            path: root.join(safe_relative_path(name)?),
            compressed,
        })
    }
}

/// How [rebuild] treats the existing archive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RebuildMode {
    /// Replace the archive with one holding exactly the given members.
    Overwrite,
    /// Add the given members to the existing archive. Zip only.
    Append,
}

/// Validate a member name and convert it to a relative path.
///
/// Absolute names, parent directory segments and names that are not in
/// normal form (`a//b`, `a/./b`) are refused.
pub fn safe_relative_path(name: &str) -> Result<PathBuf> {
    let invalid = |why: &str| {
        SigningError::container(PathBuf::from(name), format!("unsafe member name: {}", why))
    };

    let trimmed = name.strip_suffix('/').unwrap_or(name);
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }
    if trimmed.starts_with('/') || trimmed.contains('\\') || trimmed.contains('\0') {
        return Err(invalid("absolute or non-portable"));
    }

    let path = PathBuf::from(trimmed);
    let mut normalized = vec![];
    for component in path.components() {
        match component {
            Component::Normal(c) => normalized.push(c.to_string_lossy().to_string()),
            Component::ParentDir => return Err(invalid("parent directory reference")),
            _ => return Err(invalid("not a relative path")),
        }
    }

    if normalized.join("/") != trimmed {
        return Err(invalid("not normalized"));
    }

    Ok(path)
}

/// List an archive, enforcing size limits.
pub fn list_members(path: &Path, limits: &ArchiveLimits) -> Result<ContainerManifest> {
    let manifest = match ArchiveKind::require(path)? {
        ArchiveKind::Zip => zipfile::read_manifest(path)?,
        ArchiveKind::Tar(compression) => tarball::read_manifest(path, compression)?,
    };

    manifest.check_limits(path, limits)?;

    Ok(manifest)
}

/// Extract an archive into `root`.
///
/// All members are extracted when `members` is `None`. Directories are not
/// reported. Limits are checked before anything is written.
pub fn extract(
    path: &Path,
    root: &Path,
    members: Option<&[&str]>,
    limits: &ArchiveLimits,
) -> Result<Vec<ArchiveMember>> {
    list_members(path, limits)?;

    let wanted = members.map(|m| m.iter().copied().collect::<BTreeSet<_>>());

    match ArchiveKind::require(path)? {
        ArchiveKind::Zip => zipfile::extract(path, root, wanted.as_ref()),
        ArchiveKind::Tar(compression) => {
            tarball::extract(path, compression, root, wanted.as_ref())
        }
    }
}

/// Write `members` to the archive at `path`.
///
/// The archive is replaced atomically.
pub fn rebuild(path: &Path, members: &[ArchiveMember], mode: RebuildMode) -> Result<()> {
    match (ArchiveKind::require(path)?, mode) {
        (ArchiveKind::Zip, mode) => zipfile::write(path, members, mode),
        (ArchiveKind::Tar(compression), RebuildMode::Overwrite) => {
            tarball::write(path, compression, members)
        }
        (ArchiveKind::Tar(_), RebuildMode::Append) => Err(SigningError::container(
            path,
            "appending to tar archives is not supported",
        )),
    }
}

/// Collect files and symlinks under `root` as members, in name order.
pub fn collect_members(root: &Path) -> Result<Vec<ArchiveMember>> {
    let mut members = vec![];

    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| SigningError::container(root, e))?;
        if entry.file_type().is_dir() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| SigningError::container(root, e))?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        members.push(ArchiveMember {
            name,
            path: entry.path().to_path_buf(),
            compressed: true,
        });
    }

    Ok(members)
}

/// Delete files under `root` that are not one of `members`.
///
/// Returns the removed paths.
pub fn remove_extra_files(root: &Path, members: &[ArchiveMember]) -> Result<Vec<PathBuf>> {
    let keep = members
        .iter()
        .map(|m| m.path.clone())
        .collect::<BTreeSet<_>>();

    let mut removed = vec![];
    for member in collect_members(root)? {
        if !keep.contains(&member.path) {
            warn!("removing unexpected file {}", member.path.display());
            std::fs::remove_file(&member.path)
                .map_err(|e| SigningError::IoPath(member.path.clone(), e))?;
            removed.push(member.path);
        }
    }

    Ok(removed)
}
