// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Zip archive support. */

use {
    super::{safe_relative_path, ArchiveMember, ContainerManifest, ManifestEntry, RebuildMode},
    crate::error::{Result, SigningError},
    std::{
        collections::BTreeSet,
        fs::File,
        io::{BufReader, Read},
        path::Path,
    },
    zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter},
};

fn open(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let fh = File::open(path).map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?;
    ZipArchive::new(BufReader::new(fh)).map_err(|e| SigningError::container(path, e))
}

/// Read the names and sizes of all zip members.
pub fn read_manifest(path: &Path) -> Result<ContainerManifest> {
    let archive_size = std::fs::metadata(path)
        .map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?
        .len();
    let mut archive = open(path)?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let file = archive
            .by_index_raw(i)
            .map_err(|e| SigningError::container(path, e))?;

        entries.push(ManifestEntry {
            name: file.name().to_string(),
            compressed_size: file.compressed_size(),
            size: file.size(),
            is_dir: file.is_dir(),
        });
    }

    Ok(ContainerManifest {
        archive_size,
        entries,
    })
}

/// Extract members of a zip archive into `root`.
pub fn extract(
    path: &Path,
    root: &Path,
    wanted: Option<&BTreeSet<&str>>,
) -> Result<Vec<ArchiveMember>> {
    let mut archive = open(path)?;
    let mut members = vec![];

    // Validate every name before writing anything.
    for name in archive.file_names() {
        safe_relative_path(name)?;
    }

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| SigningError::container(path, e))?;

        let name = file.name().to_string();
        if file.is_dir() {
            continue;
        }
        if let Some(wanted) = wanted {
            if !wanted.contains(name.as_str()) {
                continue;
            }
        }

        let dest = root.join(safe_relative_path(&name)?);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Never inflate more than the size the archive declared, which is
        // what the limits were checked against.
        let declared = file.size();
        let mut fh = File::create(&dest).map_err(|e| SigningError::IoPath(dest.clone(), e))?;
        let written = std::io::copy(&mut (&mut file).take(declared + 1), &mut fh)
            .map_err(|e| SigningError::container(path, e))?;
        if written > declared {
            return Err(SigningError::container(
                path,
                format!("member {} is larger than its declared {} bytes", name, declared),
            ));
        }

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode & 0o7777))?;
        }

        members.push(ArchiveMember {
            name,
            path: dest,
            compressed: file.compression() != CompressionMethod::Stored,
        });
    }

    Ok(members)
}

fn member_options(member: &ArchiveMember) -> Result<FileOptions> {
    let method = if member.compressed {
        CompressionMethod::Deflated
    } else {
        CompressionMethod::Stored
    };
    let mut options = FileOptions::default().compression_method(method);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&member.path)
            .map_err(|e| SigningError::IoPath(member.path.clone(), e))?
            .permissions()
            .mode();
        options = options.unix_permissions(mode & 0o777);
    }

    let size = std::fs::metadata(&member.path)?.len();
    Ok(options.large_file(size >= u32::MAX as u64))
}

fn write_members<W: std::io::Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    members: &[ArchiveMember],
) -> Result<()> {
    for member in members {
        zip.start_file(member.name.as_str(), member_options(member)?)?;
        let mut fh =
            File::open(&member.path).map_err(|e| SigningError::IoPath(member.path.clone(), e))?;
        std::io::copy(&mut fh, zip)?;
    }

    Ok(())
}

/// Write members to a zip archive.
pub fn write(path: &Path, members: &[ArchiveMember], mode: RebuildMode) -> Result<()> {
    crate::io::write_atomically(path, |temp| {
        match mode {
            RebuildMode::Overwrite => {
                let mut zip = ZipWriter::new(temp.as_file_mut());
                write_members(&mut zip, members)?;
                zip.finish()?;
            }
            RebuildMode::Append => {
                let mut fh =
                    File::open(path).map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?;
                std::io::copy(&mut fh, temp.as_file_mut())?;

                let mut zip = ZipWriter::new_append(temp.as_file_mut())
                    .map_err(|e| SigningError::container(path, e))?;
                write_members(&mut zip, members)?;
                zip.finish()?;
            }
        }

        Ok(())
    })
    .map_err(|e| match e {
        SigningError::Zip(e) => SigningError::container(path, e),
        e => e,
    })
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::{read_zip, write_zip},
    };

    #[test]
    fn round_trip() -> Result<()> {
        let td = tempfile::tempdir()?;
        let archive = td.path().join("target.zip");
        write_zip(
            &archive,
            &[
                ("firefox/firefox", b"binary".as_ref()),
                ("firefox/omni.ja", b"stored"),
                ("firefox/defaults/pref/channel-prefs.js", b"pref"),
            ],
        )?;

        let root = td.path().join("scratch");
        let members = extract(&archive, &root, None)?;
        assert_eq!(members.len(), 3);
        write(&archive, &members, RebuildMode::Overwrite)?;

        assert_eq!(
            read_zip(&archive)?,
            vec![
                ("firefox/firefox".to_string(), b"binary".to_vec()),
                ("firefox/omni.ja".to_string(), b"stored".to_vec()),
                (
                    "firefox/defaults/pref/channel-prefs.js".to_string(),
                    b"pref".to_vec()
                ),
            ]
        );

        Ok(())
    }

    #[test]
    fn append_adds_members() -> Result<()> {
        let td = tempfile::tempdir()?;
        let archive = td.path().join("target.zip");
        write_zip(&archive, &[("a", b"a".as_ref())])?;

        let extra = ArchiveMember::new(td.path(), "b.sig", true)?;
        std::fs::write(&extra.path, b"sig")?;
        write(&archive, &[extra], RebuildMode::Append)?;

        assert_eq!(
            read_zip(&archive)?,
            vec![
                ("a".to_string(), b"a".to_vec()),
                ("b.sig".to_string(), b"sig".to_vec()),
            ]
        );

        Ok(())
    }

    #[test]
    fn inflation_is_capped_at_declared_size() -> Result<()> {
        let td = tempfile::tempdir()?;
        let archive = td.path().join("lying.zip");

        let mut zf = ZipWriter::new(File::create(&archive)?);
        zf.start_file(
            "payload",
            FileOptions::default().compression_method(CompressionMethod::Stored),
        )?;
        std::io::Write::write_all(&mut zf, b"hello world")?;
        zf.finish()?;

        // Declare 5 bytes in both the local and the central header.
        let mut data = std::fs::read(&archive)?;
        data[22..26].copy_from_slice(&5u32.to_le_bytes());
        let central = data
            .windows(4)
            .position(|w| w == [0x50, 0x4b, 0x01, 0x02])
            .unwrap();
        data[central + 24..central + 28].copy_from_slice(&5u32.to_le_bytes());
        std::fs::write(&archive, &data)?;

        assert_eq!(read_manifest(&archive)?.entries[0].size, 5);

        let root = td.path().join("scratch");
        assert!(matches!(
            extract(&archive, &root, None),
            Err(SigningError::Container { .. })
        ));

        Ok(())
    }

    #[test]
    fn traversal_is_refused_before_extraction() -> Result<()> {
        let td = tempfile::tempdir()?;
        let archive = td.path().join("evil.zip");
        write_zip(&archive, &[("good", b"x".as_ref()), ("../evil", b"x")])?;

        let root = td.path().join("scratch");
        std::fs::create_dir(&root)?;
        assert!(matches!(
            extract(&archive, &root, None),
            Err(SigningError::Container { .. })
        ));
        assert!(!root.join("good").exists());
        assert!(!td.path().join("evil").exists());

        Ok(())
    }
}
