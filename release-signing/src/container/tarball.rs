// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Compressed tar archive support. */

use {
    super::{safe_relative_path, ArchiveMember, ContainerManifest, ManifestEntry, TarCompression},
    crate::error::{Result, SigningError},
    std::{
        collections::BTreeSet,
        fs::File,
        io::{BufReader, ErrorKind, Read, Write},
        path::{Component, Path},
    },
    tar::{EntryType, HeaderMode},
};

fn decoder(path: &Path, compression: TarCompression) -> Result<Box<dyn Read>> {
    let fh = BufReader::new(
        File::open(path).map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?,
    );

    Ok(match compression {
        TarCompression::Gzip => Box::new(flate2::read::GzDecoder::new(fh)),
        TarCompression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(fh)),
        TarCompression::Xz => Box::new(xz2::read::XzDecoder::new(fh)),
    })
}

/// Normalize an entry path to a member name.
///
/// `tar czf x.tar.gz .` produces names with a leading `./`, which is
/// dropped.
fn entry_name(path: &Path) -> String {
    let name = path.to_string_lossy().replace('\\', "/");
    let mut name = name.as_str();
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    name.to_string()
}

/// Whether a symlink target stays within the directory holding the link.
fn link_target_is_contained(name: &str, target: &Path) -> bool {
    let mut depth = name.split('/').count() as i64 - 1;

    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => return false,
        }
    }

    true
}

/// Read names and sizes of tar members.
///
/// Tar members have no individual compressed size. The archive as a whole
/// is described by a single synthetic ratio on each member.
pub fn read_manifest(path: &Path, compression: TarCompression) -> Result<ContainerManifest> {
    let archive_size = std::fs::metadata(path)
        .map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?
        .len();

    let mut archive = tar::Archive::new(decoder(path, compression)?);
    let mut entries = vec![];
    let mut total = 0u64;

    for entry in archive
        .entries()
        .map_err(|e| SigningError::container(path, e))?
    {
        let entry = entry.map_err(|e| SigningError::container(path, e))?;
        let name = entry_name(&entry.path().map_err(|e| SigningError::container(path, e))?);
        if name.is_empty() || name == "." {
            continue;
        }

        let size = entry.size();
        total += size;
        entries.push(ManifestEntry {
            name,
            compressed_size: size,
            size,
            is_dir: entry.header().entry_type().is_dir(),
        });
    }

    // Attribute the archive's overall compression to each member so the
    // ratio check applies.
    if archive_size > 0 && total > 0 {
        for entry in entries.iter_mut() {
            entry.compressed_size =
                ((entry.size as u128 * archive_size as u128) / total as u128) as u64;
        }
    }

    Ok(ContainerManifest {
        archive_size,
        entries,
    })
}

/// Whether a directory between `root` and the member at `rel` is a symlink.
fn has_symlink_parent(root: &Path, rel: &Path) -> bool {
    let mut current = root.to_path_buf();
    let mut components = rel.components().peekable();

    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        if let Ok(metadata) = std::fs::symlink_metadata(&current) {
            if metadata.file_type().is_symlink() {
                return true;
            }
        }
    }

    false
}

/// Whether an extracted symlink resolves to a location under `root`.
///
/// `root` must be canonical. Dangling links resolve nowhere and are
/// accepted.
fn link_resolves_inside(root: &Path, link: &Path) -> Result<bool> {
    match std::fs::canonicalize(link) {
        Ok(resolved) => Ok(resolved.starts_with(root)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(SigningError::IoPath(link.to_path_buf(), e)),
    }
}

/// Extract members of a tar archive into `root`.
///
/// Members are unpacked through [tar::Entry::unpack_in], which refuses to
/// write through a parent that resolves outside `root`. In addition, no
/// member may live below an extracted symlink and every extracted symlink
/// must resolve inside `root`.
pub fn extract(
    path: &Path,
    compression: TarCompression,
    root: &Path,
    wanted: Option<&BTreeSet<&str>>,
) -> Result<Vec<ArchiveMember>> {
    // Validate all names before writing anything.
    for entry in read_manifest(path, compression)?.entries {
        safe_relative_path(&entry.name)?;
    }

    std::fs::create_dir_all(root)?;
    let canonical_root =
        std::fs::canonicalize(root).map_err(|e| SigningError::IoPath(root.to_path_buf(), e))?;

    let mut archive = tar::Archive::new(decoder(path, compression)?);
    archive.set_preserve_permissions(true);
    let mut members = vec![];

    for entry in archive
        .entries()
        .map_err(|e| SigningError::container(path, e))?
    {
        let mut entry = entry.map_err(|e| SigningError::container(path, e))?;
        let name = entry_name(&entry.path().map_err(|e| SigningError::container(path, e))?);
        if name.is_empty() || name == "." {
            continue;
        }
        let rel = safe_relative_path(&name)?;
        let dest = root.join(&rel);

        if has_symlink_parent(root, &rel) {
            return Err(SigningError::container(
                path,
                format!("member {} lies below a symlink", name),
            ));
        }

        let entry_type = entry.header().entry_type();
        match entry_type {
            EntryType::Directory => {
                std::fs::create_dir_all(&dest)?;
                continue;
            }
            EntryType::Regular | EntryType::Continuous => {}
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| SigningError::container(path, e))?
                    .ok_or_else(|| SigningError::container(path, "symlink without target"))?;
                if !link_target_is_contained(&name, &target) {
                    return Err(SigningError::container(
                        path,
                        format!("symlink {} points outside the archive", name),
                    ));
                }
            }
            other => {
                return Err(SigningError::container(
                    path,
                    format!("member {} has unsupported type {:?}", name, other),
                ));
            }
        }

        if let Some(wanted) = wanted {
            if !wanted.contains(name.as_str()) {
                continue;
            }
        }

        let unpacked = entry
            .unpack_in(root)
            .map_err(|e| SigningError::container(path, e))?;
        if !unpacked {
            return Err(SigningError::container(
                path,
                format!("refusing to unpack {}", name),
            ));
        }

        if entry_type == EntryType::Symlink && !link_resolves_inside(&canonical_root, &dest)? {
            std::fs::remove_file(&dest).map_err(|e| SigningError::IoPath(dest.clone(), e))?;
            return Err(SigningError::container(
                path,
                format!("symlink {} resolves outside the archive", name),
            ));
        }

        members.push(ArchiveMember {
            name,
            path: dest,
            compressed: true,
        });
    }

    // Links extracted early may only escape once later members exist.
    for member in &members {
        let is_link = std::fs::symlink_metadata(&member.path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link && !link_resolves_inside(&canonical_root, &member.path)? {
            return Err(SigningError::container(
                path,
                format!("symlink {} resolves outside the archive", member.name),
            ));
        }
    }

    Ok(members)
}

fn append_members<W: Write>(builder: &mut tar::Builder<W>, members: &[ArchiveMember]) -> Result<()> {
    for member in members {
        let metadata = std::fs::symlink_metadata(&member.path)
            .map_err(|e| SigningError::IoPath(member.path.clone(), e))?;

        let mut header = tar::Header::new_gnu();
        header.set_metadata_in_mode(&metadata, HeaderMode::Complete);
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("")?;
        header.set_groupname("")?;

        if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(&member.path)?;
            header.set_size(0);
            builder.append_link(&mut header, &member.name, &target)?;
        } else {
            let fh = File::open(&member.path)
                .map_err(|e| SigningError::IoPath(member.path.clone(), e))?;
            builder.append_data(&mut header, &member.name, fh)?;
        }
    }

    Ok(())
}

fn write_to<W: Write>(writer: W, compression: TarCompression, members: &[ArchiveMember]) -> Result<()> {
    match compression {
        TarCompression::Gzip => {
            let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
                writer,
                flate2::Compression::default(),
            ));
            append_members(&mut builder, members)?;
            builder.into_inner()?.finish()?;
        }
        TarCompression::Bzip2 => {
            let mut builder = tar::Builder::new(bzip2::write::BzEncoder::new(
                writer,
                bzip2::Compression::best(),
            ));
            append_members(&mut builder, members)?;
            builder.into_inner()?.finish()?;
        }
        TarCompression::Xz => {
            let mut builder = tar::Builder::new(xz2::write::XzEncoder::new(writer, 9));
            append_members(&mut builder, members)?;
            builder.into_inner()?.finish()?;
        }
    }

    Ok(())
}

/// Write members to a compressed tar archive.
///
/// Ownership is normalized to uid/gid 0 without user or group names.
pub fn write(path: &Path, compression: TarCompression, members: &[ArchiveMember]) -> Result<()> {
    crate::io::write_atomically(path, |temp| write_to(temp.as_file_mut(), compression, members))
}
