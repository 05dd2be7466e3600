// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Filesystem helpers. */

use {
    crate::error::{Result, SigningError},
    std::{
        io::Write,
        path::{Path, PathBuf},
    },
    tempfile::NamedTempFile,
};

/// Write a file by filling a sibling temporary file and renaming it over
/// the destination.
///
/// The destination is untouched if `f` fails.
pub fn write_atomically<T>(
    dest: &Path,
    f: impl FnOnce(&mut NamedTempFile) -> Result<T>,
) -> Result<T> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = NamedTempFile::new_in(parent)
        .map_err(|e| SigningError::IoPath(parent.to_path_buf(), e))?;

    let value = f(&mut temp)?;
    temp.as_file_mut().flush()?;

    // Keep permissions of a file being replaced.
    if let Ok(metadata) = std::fs::metadata(dest) {
        std::fs::set_permissions(temp.path(), metadata.permissions())?;
    }

    temp.persist(dest)
        .map_err(|e| SigningError::IoPath(dest.to_path_buf(), e.error))?;

    Ok(value)
}

/// Atomically replace a file with the given content.
pub fn write_bytes_atomically(dest: &Path, data: &[u8]) -> Result<()> {
    write_atomically(dest, |file| {
        file.write_all(data)?;
        Ok(())
    })
}

/// Atomically replace `dest` with a copy of `source`.
pub fn copy_atomically(source: &Path, dest: &Path) -> Result<()> {
    write_atomically(dest, |file| {
        let mut fh =
            std::fs::File::open(source).map_err(|e| SigningError::IoPath(source.to_path_buf(), e))?;
        std::io::copy(&mut fh, file)?;
        Ok(())
    })
}

/// Append a suffix to the file name of a path.
pub fn with_appended_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Lower-cased file name of a path.
pub fn file_name_lower(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_write_leaves_destination() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dest = td.path().join("file");
        std::fs::write(&dest, b"original")?;

        let res: Result<()> = write_atomically(&dest, |file| {
            file.write_all(b"partial")?;
            Err(SigningError::Oracle("boom".into()))
        });
        assert!(res.is_err());
        assert_eq!(std::fs::read(&dest)?, b"original");
        assert_eq!(std::fs::read_dir(td.path())?.count(), 1);

        write_bytes_atomically(&dest, b"replaced")?;
        assert_eq!(std::fs::read(&dest)?, b"replaced");

        Ok(())
    }

    #[test]
    fn suffixes() {
        assert_eq!(
            with_appended_suffix(Path::new("/a/b.tar.gz"), ".asc"),
            PathBuf::from("/a/b.tar.gz.asc")
        );
        assert_eq!(file_name_lower(Path::new("/a/Setup.MSI")), "setup.msi");
    }
}
