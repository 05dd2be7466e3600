// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Disk image conversion.

macOS artifacts arrive as `.dmg` disk images. Strategies that modify
bundle content work on a `.tar.gz` of the image's filesystem instead. The
conversion uses the external `dmg` and `hfsplus` tools.
*/

use {
    crate::{
        container::{self, tarball, TarCompression},
        error::{Result, SigningError},
    },
    async_trait::async_trait,
    log::{debug, info},
    std::{
        ffi::OsString,
        io::{BufRead, BufReader},
        path::{Path, PathBuf},
    },
};

/// Whether a path names a disk image.
pub fn is_disk_image(path: &Path) -> bool {
    crate::io::file_name_lower(path).ends_with(".dmg")
}

/// The tarball a disk image converts to: `.dmg` replaced with `.tar.gz`.
pub fn tarball_path(source: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let stem = if name.to_lowercase().ends_with(".dmg") {
        &name[0..name.len() - 4]
    } else {
        name.as_str()
    };

    source.with_file_name(format!("{}.tar.gz", stem))
}

/// Converts disk images into gzip compressed tarballs.
#[async_trait]
pub trait DiskImageConverter: Send + Sync {
    /// Convert `source` to the tarball named by [tarball_path].
    ///
    /// `scratch_dir` holds intermediate files. Returns the tarball path.
    async fn convert(&self, source: &Path, scratch_dir: &Path) -> Result<PathBuf>;
}

/// Converter invoking the `dmg` and `hfsplus` executables.
#[derive(Clone, Debug)]
pub struct ExternalDiskImageConverter {
    dmg: PathBuf,
    hfsplus: PathBuf,
}

impl ExternalDiskImageConverter {
    pub fn new(dmg: impl Into<PathBuf>, hfsplus: impl Into<PathBuf>) -> Self {
        Self {
            dmg: dmg.into(),
            hfsplus: hfsplus.into(),
        }
    }

    fn convert_blocking(&self, source: &Path, scratch_dir: &Path) -> Result<PathBuf> {
        let temp_dir = tempfile::Builder::new()
            .prefix("dmg-")
            .tempdir_in(scratch_dir)
            .map_err(|e| SigningError::IoPath(scratch_dir.to_path_buf(), e))?;
        let app_dir = temp_dir.path().join("app");
        std::fs::create_dir(&app_dir).map_err(|e| SigningError::IoPath(app_dir.clone(), e))?;

        run_tool(
            source,
            &self.dmg,
            vec!["extract".into(), source.into(), "tmp.hfs".into()],
            temp_dir.path(),
        )?;
        run_tool(
            source,
            &self.hfsplus,
            vec![
                "tmp.hfs".into(),
                "extractall".into(),
                "/".into(),
                app_dir.clone().into(),
            ],
            temp_dir.path(),
        )?;

        let dest = tarball_path(source);
        let members = container::collect_members(&app_dir)?;
        info!(
            "writing {} members of {} to {}",
            members.len(),
            source.display(),
            dest.display()
        );
        tarball::write(&dest, TarCompression::Gzip, &members)?;

        Ok(dest)
    }
}

fn run_tool(source: &Path, exe: &Path, args: Vec<OsString>, cwd: &Path) -> Result<()> {
    debug!("running {} {:?}", exe.display(), args);

    let command = duct::cmd(exe, args)
        .dir(cwd)
        .stderr_to_stdout()
        .reader()
        .map_err(|e| SigningError::container(source, format!("running {}: {}", exe.display(), e)))?;
    {
        let reader = BufReader::new(&command);
        for line in reader.lines() {
            let line = line.map_err(|e| {
                SigningError::container(source, format!("{} failed: {}", exe.display(), e))
            })?;
            debug!("{}> {}", exe.display(), line);
        }
    }

    match command.try_wait()? {
        Some(output) if output.status.success() => Ok(()),
        _ => Err(SigningError::container(
            source,
            format!("{} did not exit successfully", exe.display()),
        )),
    }
}

#[async_trait]
impl DiskImageConverter for ExternalDiskImageConverter {
    async fn convert(&self, source: &Path, scratch_dir: &Path) -> Result<PathBuf> {
        let converter = self.clone();
        let source = source.to_path_buf();
        let scratch_dir = scratch_dir.to_path_buf();

        tokio::task::spawn_blocking(move || converter.convert_blocking(&source, &scratch_dir))
            .await
            .map_err(|e| SigningError::Oracle(format!("disk image conversion panicked: {}", e)))?
    }
}
