// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Sign release artifacts through a remote signing service.

This crate implements the artifact signing stage of a browser release
pipeline. Given a file and a signing format, it picks a [Strategy],
extracts whatever needs signing from container archives, has a remote
signing service (speaking the Autograph HTTP protocol with Hawk
authentication) sign it, and embeds or writes the resulting signatures.

Supported signatures include:

* Whole file signatures (APKs, add-ons, macOS application tarballs).
* Detached RSA (`.sig`) and GPG (`.asc`) signatures.
* Protected binary signature files inside zips, tarballs and disk images.
* `omni.ja` resource archive signatures.
* Update package (MAR) signature blocks.
* Authenticode signatures embedded in PE images and MSI packages.

# Getting started

Build a [SigningContext] from a [SigningConfig] and an [OracleRegistry]
and pass it to [sign] or [sign_file_list]:

```no_run
use release_signing::{sign, OracleRegistry, SigningConfig, SigningContext, SigningRequest};

# async fn run() -> release_signing::Result<()> {
let config = SigningConfig::from_path("signing.json")?;
let registry = OracleRegistry::from_path("passwords.json")?;
let context = SigningContext::new(
    config,
    registry,
    "project:releng:signing:cert:dep-signing",
)?;

let outputs = sign(
    &context,
    &SigningRequest::new("work/target.tar.gz", "autograph_gpg"),
)
.await?;
# Ok(())
# }
```

The crate logs through the `log` facade and never installs a logger.
*/

pub mod authenticode;
pub mod classify;
pub mod config;
pub mod container;
pub mod context;
pub mod dmg;
pub mod error;
pub mod format;
pub mod io;
pub mod mar;
pub mod oracle;
pub mod pipeline;
pub mod precomplete;
pub mod strategy;
#[cfg(test)]
pub(crate) mod testutil;
pub mod widevine;

pub use {
    config::{
        ArchiveLimits, MarVerification, OracleEndpoint, OracleRegistry, OracleSettings,
        SigningConfig, TimestampStyle,
    },
    context::SigningContext,
    error::{Result, SigningError},
    format::{SigningFormat, Strategy},
    pipeline::{sign, sign_file_list, sign_with_formats, SigningRequest},
};
