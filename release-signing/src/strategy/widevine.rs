// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Protected binary signatures inside archives.

Archives are searched for protected binaries lacking a signature file. If
there are none the archive is left untouched. Otherwise each binary is
signed and its signature file added, the `precomplete` manifest is
regenerated and the archive rebuilt.
*/

use {
    crate::{
        classify::{self, Tier},
        container::{self, ArchiveMember, RebuildMode},
        context::SigningContext,
        error::{Result, SigningError},
        format::SigningFormat,
        io::write_bytes_atomically,
        precomplete,
        strategy::join_fail_fast,
        widevine,
    },
    log::info,
    std::path::{Path, PathBuf},
};

async fn sign_protected_binary(
    context: &SigningContext,
    root: &Path,
    name: &str,
    tier: Tier,
    certificate: &[u8],
    format: &SigningFormat,
) -> Result<ArchiveMember> {
    let binary = ArchiveMember::new(root, name, true)?;
    let flags = widevine::flags(tier.is_blessed());
    let codec = context.protected_binary_codec();

    info!("signing protected binary {} ({:?})", name, tier);
    let digest = codec.digest(&binary.path, flags)?;
    let signature = context.sign_hash(&digest, format).await?;
    let content = codec.signature_file(&signature, certificate, flags)?;

    let sig = ArchiveMember::new(root, &classify::signature_path(name), true)?;
    if let Some(parent) = sig.path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| SigningError::IoPath(parent.to_path_buf(), e))?;
    }
    write_bytes_atomically(&sig.path, &content)?;

    Ok(sig)
}

/// Add protected binary signatures to the archive at `path`.
///
/// Disk images are converted first. Returns the archive path.
pub async fn sign(
    context: &SigningContext,
    path: &Path,
    format: &SigningFormat,
) -> Result<Vec<PathBuf>> {
    let path = context.convert_disk_image_if_needed(path).await?;
    let limits = context.config().limits;

    let manifest = container::list_members(&path, &limits)?;
    let targets = classify::protected_binaries(manifest.file_names());
    if targets.is_empty() {
        info!(
            "no protected binaries need signing in {}; leaving it unchanged",
            path.display()
        );
        return Ok(vec![path]);
    }

    let certificate = context.widevine_certificate()?;
    let scratch = context.scratch_dir("widevine-")?;
    let mut members = container::extract(&path, scratch.path(), None, &limits)?;

    let signatures = join_fail_fast(
        targets.into_iter().collect(),
        context.config().oracle.max_concurrent_signings,
        |(name, tier)| {
            let root = scratch.path();
            let certificate = certificate.as_slice();
            async move {
                sign_protected_binary(context, root, &name, tier, certificate, format).await
            }
        },
    )
    .await?;

    members.extend(signatures);

    container::remove_extra_files(scratch.path(), &members)?;
    precomplete::regenerate(scratch.path(), &context.config().artifact_dir)?;
    container::rebuild(&path, &members, RebuildMode::Overwrite)?;

    Ok(vec![path])
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::SigningConfig,
            container::ArchiveKind,
            testutil::{
                read_zip, test_config, test_context_with_config, write_file, write_tar,
                write_zip, FakeDiskImages, FakeOracle,
            },
            widevine::{ProtectedBinaryCodec, WidevineCodec},
        },
        std::sync::Arc,
    };

    fn widevine_config(dir: &Path) -> Result<SigningConfig> {
        let mut config = test_config(dir);
        let cert = dir.join("widevine.crt");
        write_file(&cert, b"widevine certificate")?;
        config.widevine_cert = Some(cert);
        Ok(config)
    }

    #[tokio::test]
    async fn zip_gains_one_signature() -> Result<()> {
        let td = tempfile::tempdir()?;
        let oracle = Arc::new(FakeOracle::default());
        let context = test_context_with_config(widevine_config(td.path())?, oracle.clone());
        let format = SigningFormat::parse("autograph_widevine")?;

        let path = td.path().join("work/target.zip");
        write_zip(
            &path,
            &[
                ("plugin-container", b"binary".as_ref()),
                ("z/blah", b"blah"),
                ("ignore", b"ignore"),
            ],
        )?;

        assert_eq!(sign(&context, &path, &format).await?, vec![path.clone()]);

        let members = read_zip(&path)?;
        assert_eq!(members.len(), 4);
        let (_, sig) = members
            .iter()
            .find(|(name, _)| name == "plugin-container.sig")
            .unwrap();

        let td2 = tempfile::tempdir()?;
        let binary = td2.path().join("plugin-container");
        std::fs::write(&binary, b"binary")?;
        let expected = WidevineCodec.signature_file(
            &[0x5a; 512],
            b"widevine certificate",
            widevine::FLAG_BLESSED,
        )?;
        assert_eq!(sig, &expected);
        assert_eq!(
            base64::decode(oracle.requests()[0].body[0]["input"].as_str().unwrap())?,
            WidevineCodec.digest(&binary, widevine::FLAG_BLESSED)?
        );

        // A second pass finds nothing left to sign.
        let before = std::fs::read(&path)?;
        sign(&context, &path, &format).await?;
        assert_eq!(std::fs::read(&path)?, before);
        assert_eq!(oracle.requests().len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn nothing_to_sign_passes_through() -> Result<()> {
        let td = tempfile::tempdir()?;
        let oracle = Arc::new(FakeOracle::default());
        let context = test_context_with_config(test_config(td.path()), oracle.clone());

        let path = td.path().join("work/target.zip");
        write_zip(&path, &[("readme.txt", b"hello".as_ref())])?;
        let before = std::fs::read(&path)?;

        sign(&context, &path, &SigningFormat::parse("widevine")?).await?;
        assert_eq!(std::fs::read(&path)?, before);
        assert!(oracle.requests().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn disk_image_bundle() -> Result<()> {
        let td = tempfile::tempdir()?;
        let oracle = Arc::new(FakeOracle::default());
        let images = Arc::new(FakeDiskImages::new(&[
            ("Firefox.app/Contents/MacOS/firefox", b"firefox".as_ref()),
            (
                "Firefox.app/Contents/MacOS/plugin-container.app/Contents/MacOS/plugin-container",
                b"pc",
            ),
            (
                "Firefox.app/Contents/Resources/precomplete",
                b"remove \"Contents/Resources/precomplete\"\n",
            ),
        ]));
        let context = test_context_with_config(widevine_config(td.path())?, oracle.clone())
            .with_disk_image_converter(images.clone());

        let path = td.path().join("work/target.dmg");
        std::fs::write(&path, b"image")?;

        let res = sign(&context, &path, &SigningFormat::parse("stage_autograph_widevine")?).await?;
        let tarball = td.path().join("work/target.tar.gz");
        assert_eq!(res, vec![tarball.clone()]);
        assert_eq!(images.conversions(), 1);
        assert_eq!(oracle.requests().len(), 2);

        let manifest = container::list_members(&tarball, &context.config().limits)?;
        let names = manifest.file_names().collect::<Vec<_>>();
        assert!(names.contains(&"Firefox.app/Contents/Resources/firefox.sig"));
        assert!(names.contains(
            &"Firefox.app/Contents/MacOS/plugin-container.app/Contents/Resources/plugin-container.sig"
        ));

        let diff = std::fs::read_to_string(
            td.path().join("artifacts").join(precomplete::DIFF_ARTIFACT),
        )?;
        assert!(diff.contains("+ remove \"Contents/Resources/firefox.sig\""));

        Ok(())
    }

    #[tokio::test]
    async fn tarball_members_are_signed() -> Result<()> {
        let td = tempfile::tempdir()?;
        let oracle = Arc::new(FakeOracle::default());
        let context = test_context_with_config(widevine_config(td.path())?, oracle.clone());

        let path = td.path().join("work/target.tar.xz");
        write_tar(
            &path,
            &[
                ("firefox/firefox", b"firefox".as_ref()),
                ("firefox/libxul.so", b"xul"),
                ("firefox/libxul.so.sig", b"existing"),
            ],
        )?;
        assert_eq!(
            ArchiveKind::from_path(&path),
            Some(ArchiveKind::Tar(container::TarCompression::Xz))
        );

        sign(&context, &path, &SigningFormat::parse("autograph_widevine")?).await?;
        assert_eq!(oracle.requests().len(), 1);

        let manifest = container::list_members(&path, &context.config().limits)?;
        let names = manifest.file_names().collect::<Vec<_>>();
        assert_eq!(names.len(), 4);
        assert!(names.contains(&"firefox/firefox.sig"));

        Ok(())
    }

    #[tokio::test]
    async fn missing_certificate_is_config_error() -> Result<()> {
        let td = tempfile::tempdir()?;
        let context =
            test_context_with_config(test_config(td.path()), Arc::new(FakeOracle::default()));

        let path = td.path().join("work/target.zip");
        write_zip(&path, &[("firefox.exe", b"binary".as_ref())])?;

        let res = sign(&context, &path, &SigningFormat::parse("autograph_widevine")?).await;
        assert!(matches!(res, Err(SigningError::Config(_))));

        Ok(())
    }
}
