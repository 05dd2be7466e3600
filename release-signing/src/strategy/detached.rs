// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Detached signatures.

The artifact itself is left alone. RSA signatures of the file's SHA-256
digest go to `<file>.sig` and ASCII armored GPG signatures to `<file>.asc`.
*/

use {
    crate::{
        context::SigningContext,
        error::{Result, SigningError},
        format::SigningFormat,
        io::{with_appended_suffix, write_bytes_atomically},
    },
    log::info,
    sha2::{Digest, Sha256},
    std::{
        fs::File,
        path::{Path, PathBuf},
    },
};

fn sha256_file(path: &Path) -> Result<Vec<u8>> {
    let mut fh = File::open(path).map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut fh, &mut hasher)?;

    Ok(hasher.finalize().to_vec())
}

/// Write an RSA signature of the file digest to `<path>.sig`.
pub async fn sign_rsa(
    context: &SigningContext,
    path: &Path,
    format: &SigningFormat,
) -> Result<Vec<PathBuf>> {
    let digest = sha256_file(path)?;
    let signature = context.sign_hash(&digest, format).await?;

    let sig_path = with_appended_suffix(path, ".sig");
    info!("writing {}", sig_path.display());
    write_bytes_atomically(&sig_path, &signature)?;

    Ok(vec![path.to_path_buf(), sig_path])
}

/// Write an armored GPG signature of the file to `<path>.asc`.
pub async fn sign_gpg(
    context: &SigningContext,
    path: &Path,
    format: &SigningFormat,
) -> Result<Vec<PathBuf>> {
    let signature = context.sign_data(path, format).await?;

    let asc_path = with_appended_suffix(path, ".asc");
    info!("writing {}", asc_path.display());
    write_bytes_atomically(&asc_path, signature.as_bytes())?;

    Ok(vec![path.to_path_buf(), asc_path])
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::{test_context, FakeOracle, ARMORED_SIGNATURE},
        std::sync::Arc,
    };

    #[tokio::test]
    async fn rsa_signature_of_digest() -> Result<()> {
        let td = tempfile::tempdir()?;
        let oracle = Arc::new(FakeOracle::default());
        let context = test_context(td.path(), oracle.clone());

        let path = td.path().join("work/target.tar.bz2");
        std::fs::write(&path, b"release")?;

        let res = sign_rsa(&context, &path, &SigningFormat::parse("autograph_rsa")?).await?;
        assert_eq!(
            res,
            vec![path.clone(), td.path().join("work/target.tar.bz2.sig")]
        );
        assert_eq!(std::fs::read(&path)?, b"release");
        assert_eq!(std::fs::read(&res[1])?, vec![0x5au8; 512]);

        let requests = oracle.requests();
        assert!(requests[0].url.ends_with("/sign/hash"));
        assert_eq!(
            base64::decode(requests[0].body[0]["input"].as_str().unwrap())?,
            Sha256::digest(b"release").to_vec()
        );

        Ok(())
    }

    #[tokio::test]
    async fn gpg_signature_is_armored() -> Result<()> {
        let td = tempfile::tempdir()?;
        let oracle = Arc::new(FakeOracle::default());
        let context = test_context(td.path(), oracle.clone());

        let path = td.path().join("work/target.zip");
        std::fs::write(&path, b"release")?;

        let res = sign_gpg(&context, &path, &SigningFormat::parse("autograph_gpg")?).await?;
        assert_eq!(res[1], td.path().join("work/target.zip.asc"));
        assert_eq!(std::fs::read_to_string(&res[1])?, ARMORED_SIGNATURE);
        assert!(oracle.requests()[0].url.ends_with("/sign/data"));

        Ok(())
    }
}
