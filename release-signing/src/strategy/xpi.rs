// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Add-on and language pack signing.

The signing service needs the add-on id, which is read from the
`manifest.json` inside the package.
*/

use {
    crate::{
        container,
        context::SigningContext,
        error::{Result, SigningError},
        format::SigningFormat,
    },
    log::info,
    once_cell::sync::Lazy,
    regex::Regex,
    serde_json::Value,
    std::{
        io::Read,
        path::{Path, PathBuf},
    },
};

const MANIFEST_NAMES: &[&str] = &["manifest.json", "webextension/manifest.json"];

static LANGPACK_ID: Lazy<std::result::Result<Regex, regex::Error>> = Lazy::new(|| {
    Regex::new(r"^langpack-[a-zA-Z]+(?:-[a-zA-Z]+){0,2}@(?:firefox|devedition)\.mozilla\.org$")
});

fn is_langpack_id(id: &str) -> Result<bool> {
    let pattern = LANGPACK_ID
        .as_ref()
        .map_err(|e| SigningError::Config(format!("langpack id pattern: {}", e)))?;
    Ok(pattern.is_match(id))
}

/// Read the add-on manifest of a package.
pub fn read_manifest(path: &Path, limits: &crate::config::ArchiveLimits) -> Result<Value> {
    container::list_members(path, limits)?;

    let fh = std::fs::File::open(path).map_err(|e| SigningError::IoPath(path.to_path_buf(), e))?;
    let mut archive = zip::ZipArchive::new(fh).map_err(|e| SigningError::container(path, e))?;

    for name in MANIFEST_NAMES {
        let mut data = vec![];
        match archive.by_name(name) {
            Ok(mut file) => {
                file.read_to_end(&mut data)?;
            }
            Err(zip::result::ZipError::FileNotFound) => continue,
            Err(e) => return Err(SigningError::container(path, e)),
        }

        return serde_json::from_slice(&data).map_err(|e| {
            SigningError::container(path, format!("invalid {}: {}", name, e))
        });
    }

    Err(SigningError::container(path, "no manifest.json"))
}

/// Resolve the add-on id declared by a manifest.
///
/// `browser_specific_settings` takes precedence over the legacy
/// `applications` key.
pub fn extension_id(manifest: &Value) -> Result<String> {
    manifest
        .get("browser_specific_settings")
        .or_else(|| manifest.get("applications"))
        .and_then(|settings| settings.pointer("/gecko/id"))
        .and_then(|id| id.as_str())
        .map(|id| id.to_string())
        .ok_or_else(|| SigningError::Classification("manifest declares no gecko id".into()))
}

fn validate_langpack(path: &Path, manifest: &Value, id: &str) -> Result<()> {
    let invalid = |why: String| {
        SigningError::Classification(format!("{} is not a valid langpack: {}", path.display(), why))
    };

    if !crate::io::file_name_lower(path).ends_with(".xpi") {
        return Err(invalid("file name must end in .xpi".into()));
    }
    for key in ["languages", "langpack_id"] {
        if manifest.get(key).is_none() {
            return Err(invalid(format!("manifest has no {}", key)));
        }
    }
    if !is_langpack_id(id)? {
        return Err(invalid(format!("unexpected id {}", id)));
    }

    Ok(())
}

/// Sign an add-on package in place.
pub async fn sign(
    context: &SigningContext,
    path: &Path,
    format: &SigningFormat,
) -> Result<Vec<PathBuf>> {
    let name = crate::io::file_name_lower(path);
    if !(name.ends_with(".xpi") || name.ends_with(".zip")) {
        return Err(SigningError::Classification(format!(
            "{} is not an add-on package",
            path.display()
        )));
    }

    let manifest = read_manifest(path, &context.config().limits)?;
    let id = extension_id(&manifest)?;
    if format.is_langpack() {
        validate_langpack(path, &manifest, &id)?;
    }

    info!("signing add-on {} ({})", path.display(), id);
    context.sign_file(path, format, Some(&id), path).await?;

    Ok(vec![path.to_path_buf()])
}
