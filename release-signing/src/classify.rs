// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Decide which archive members need signing.

Everything here works on archive member names (`/` separated relative
paths) and never touches the filesystem.
*/

use {
    glob::{MatchOptions, Pattern},
    once_cell::sync::Lazy,
    std::collections::{BTreeMap, BTreeSet},
};

/// Binaries whose signature marks them as trusted to host protected media.
const BLESSED_BINARIES: &[&str] = &[
    "Firefox Media Plugin Helper",
    "Firefox Developer Edition Media Plugin Helper",
    "Firefox Nightly Media Plugin Helper",
    "Nightly Media Plugin Helper",
    "plugin-container",
    "plugin-container.exe",
];

const UNBLESSED_BINARIES: &[&str] = &[
    "firefox",
    "firefox-bin",
    "firefox.exe",
    "libxul.so",
    "XUL",
    "xul.dll",
    "clearkey.dll",
    "libclearkey.dylib",
    "libclearkey.so",
];

const WINDOWS_EXTENSIONS: &[&str] = &["dll", "exe", "msi", "msix", "bin"];

/// Third party Windows libraries that are shipped already signed.
static WINDOWS_DENYLIST: Lazy<Vec<Pattern>> = Lazy::new(|| {
    [
        "D3DCompiler_42.dll",
        "d3dx9_42.dll",
        "D3DCompiler_43.dll",
        "d3dx9_43.dll",
        "msvc*.dll",
    ]
    .iter()
    .filter_map(|p| Pattern::new(p).ok())
    .collect()
});

/// Trust tier of a protected binary signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Tier {
    Blessed,
    Unblessed,
}

impl Tier {
    pub fn is_blessed(&self) -> bool {
        matches!(self, Self::Blessed)
    }
}

fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Resolve the protected binary tier of a member, if it is one.
pub fn protected_binary_tier(name: &str) -> Option<Tier> {
    let base = basename(name);

    if BLESSED_BINARIES.contains(&base) {
        Some(Tier::Blessed)
    } else if UNBLESSED_BINARIES.contains(&base) {
        Some(Tier::Unblessed)
    } else {
        None
    }
}

/// Path of the signature file for a protected binary.
///
/// Bundles keep signatures for `Contents/MacOS` executables in
/// `Contents/Resources`. Once a path is inside a bundle's `Contents/MacOS`,
/// its last `MacOS` component is the one replaced. Everything else gets a
/// `.sig` sibling.
pub fn signature_path(name: &str) -> String {
    let mut components = name.split('/').collect::<Vec<_>>();

    let in_bundle = components
        .windows(2)
        .any(|w| w[0] == "Contents" && w[1] == "MacOS");
    if in_bundle {
        if let Some(pos) = components.iter().rposition(|c| *c == "MacOS") {
            components[pos] = "Resources";
        }
    }

    format!("{}.sig", components.join("/"))
}

/// Select the protected binaries of an archive that still need signatures.
///
/// A binary is skipped when its signature file is already a member.
pub fn protected_binaries<'a>(
    names: impl IntoIterator<Item = &'a str>,
) -> BTreeMap<String, Tier> {
    let names = names.into_iter().collect::<BTreeSet<_>>();

    names
        .iter()
        .filter_map(|name| protected_binary_tier(name).map(|tier| (*name, tier)))
        .filter(|(name, _)| !names.contains(signature_path(name).as_str()))
        .map(|(name, tier)| (name.to_string(), tier))
        .collect()
}

/// Whether a member is an `omni.ja` resource archive.
pub fn is_resource_archive_member(name: &str) -> bool {
    basename(name) == "omni.ja"
}

/// Whether a member is a Windows binary that should receive Authenticode.
pub fn needs_windows_signing(name: &str) -> bool {
    let base = basename(name);

    let extension = match base.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return false,
    };
    if !WINDOWS_EXTENSIONS.contains(&extension.as_str()) {
        return false;
    }

    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    !WINDOWS_DENYLIST
        .iter()
        .any(|pattern| pattern.matches_with(base, options))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers() {
        assert_eq!(
            protected_binary_tier("firefox/plugin-container"),
            Some(Tier::Blessed)
        );
        assert_eq!(
            protected_binary_tier(
                "Firefox.app/Contents/MacOS/plugin-container.app/Contents/MacOS/Firefox Media Plugin Helper"
            ),
            Some(Tier::Blessed)
        );
        assert_eq!(
            protected_binary_tier("firefox/libxul.so"),
            Some(Tier::Unblessed)
        );
        assert_eq!(protected_binary_tier("firefox/libxul.so.sig"), None);
        assert_eq!(protected_binary_tier("firefox/XUL.dll"), None);
    }

    #[test]
    fn signature_paths() {
        assert_eq!(signature_path("firefox/libxul.so"), "firefox/libxul.so.sig");
        assert_eq!(
            signature_path("Firefox.app/Contents/MacOS/XUL"),
            "Firefox.app/Contents/Resources/XUL.sig"
        );
        assert_eq!(
            signature_path(
                "Firefox.app/Contents/MacOS/plugin-container.app/Contents/MacOS/plugin-container"
            ),
            "Firefox.app/Contents/MacOS/plugin-container.app/Contents/Resources/plugin-container.sig"
        );
        assert_eq!(signature_path("MacOS/firefox"), "MacOS/firefox.sig");
        assert_eq!(
            signature_path("Firefox.app/Contents/MacOS/helpers/MacOS/gmp-clearkey"),
            "Firefox.app/Contents/MacOS/helpers/Resources/gmp-clearkey.sig"
        );
        assert_eq!(
            signature_path("Firefox.app/Contents/Frameworks/MacOS/XUL"),
            "Firefox.app/Contents/Frameworks/MacOS/XUL.sig"
        );
    }

    #[test]
    fn already_signed_binaries_are_skipped() {
        let selected = protected_binaries([
            "firefox/firefox",
            "firefox/firefox.sig",
            "firefox/plugin-container",
            "firefox/libxul.so",
            "firefox/omni.ja",
        ]);

        assert_eq!(
            selected.into_iter().collect::<Vec<_>>(),
            vec![
                ("firefox/libxul.so".to_string(), Tier::Unblessed),
                ("firefox/plugin-container".to_string(), Tier::Blessed),
            ]
        );
    }

    #[test]
    fn windows_selection() {
        for name in [
            "firefox/firefox.exe",
            "firefox/xul.dll",
            "setup.msi",
            "app.MSIX",
            "firefox/updater.bin",
        ] {
            assert!(needs_windows_signing(name), "{}", name);
        }

        for name in [
            "firefox/d3dx9_43.dll",
            "firefox/D3DCOMPILER_42.DLL",
            "firefox/msvcp140.dll",
            "firefox/MSVCR120.dll",
            "firefox/omni.ja",
            "firefox/README",
            "firefox/precomplete",
        ] {
            assert!(!needs_windows_signing(name), "{}", name);
        }
    }

    #[test]
    fn resource_archives() {
        assert!(is_resource_archive_member("firefox/omni.ja"));
        assert!(is_resource_archive_member("firefox/browser/omni.ja"));
        assert!(!is_resource_archive_member("firefox/omni.jar"));
    }
}
