// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Update package hash signing.

The package is rewritten with a zeroed SHA-384 signature block, the digest
of that copy is signed, and the signature is spliced into a fresh copy.
Nothing is written until the signature has the expected length and, when
configured, verifies against the published key.
*/

use {
    crate::{
        context::SigningContext,
        error::{Result, SigningError},
        format::SigningFormat,
        mar::{self, SignatureAlgorithm},
    },
    log::info,
    std::path::{Path, PathBuf},
};

pub async fn sign(
    context: &SigningContext,
    path: &Path,
    format: &SigningFormat,
) -> Result<Vec<PathBuf>> {
    let algorithm = SignatureAlgorithm::Sha384;

    // Fail on a missing endpoint before doing any work.
    context.endpoint(format)?;

    // Structural problems with the package are container errors.
    let malformed = |e: SigningError| match e {
        SigningError::Envelope(cause) => SigningError::container(path, cause),
        e => e,
    };

    let data = std::fs::read(path).map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?;
    let placeholder = mar::add_signature_block(&data, algorithm, None).map_err(&malformed)?;
    let digest = mar::signature_digest(&placeholder).map_err(&malformed)?;

    let signature = context.sign_hash(&digest, format).await?;
    if signature.len() != algorithm.signature_length() {
        return Err(SigningError::SignatureLength {
            expected: algorithm.signature_length(),
            actual: signature.len(),
        });
    }

    let signed =
        mar::add_signature_block(&data, algorithm, Some(&signature)).map_err(&malformed)?;

    if let Some(verification) = &context.config().mar_verification {
        let key_path = verification.key_path(context.cert_type(), format)?;
        info!("verifying {} with {}", path.display(), key_path.display());
        let key = std::fs::read_to_string(&key_path)
            .map_err(|e| SigningError::IoPath(key_path.clone(), e))?;
        mar::verify_signature(&signed, &key)?;
    }

    crate::io::write_bytes_atomically(path, &signed)?;
    info!("signed {}", path.display());

    Ok(vec![path.to_path_buf()])
}
