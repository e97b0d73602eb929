// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Distribution detection.
//!
//! Hostprep only needs to know which __distro family__ it is running on. A
//! family is the group of distributions that share a package manager and
//! package naming, e.g., Debian, Ubuntu, and Pop!_OS all belong to the Debian
//! family. The family is read from an OS-release file, normally located at
//! `/etc/os-release`.
//!
//! # Detection Rules
//!
//! The `ID_LIKE` field is preferred over `ID`, because derivatives list their
//! parent distribution there. Values are matched by lowercase substring
//! containment rather than equality, so compound values like
//! `ID_LIKE="ubuntu debian"` resolve without special casing. When `ID_LIKE`
//! is missing or names nothing known, `ID` is used instead.
//!
//! # See Also
//!
//! - [os-release(5)](https://www.freedesktop.org/software/systemd/man/latest/os-release.html)

use crate::envfile;

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument};

/// Default location of the OS-release file.
pub const DEFAULT_OS_RELEASE: &str = "/etc/os-release";

/// Parsed OS-release file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OsRelease {
    fields: BTreeMap<String, String>,
}

impl OsRelease {
    /// Parse OS-release contents.
    pub fn parse(contents: &str) -> Self {
        Self {
            fields: envfile::parse(contents),
        }
    }

    /// Read and parse OS-release file at target path.
    ///
    /// # Errors
    ///
    /// - Return [`DistroError::ReadOsRelease`] if file cannot be read.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let contents = read_to_string(path.as_ref()).map_err(|err| DistroError::ReadOsRelease {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;

        Ok(Self::parse(&contents))
    }

    /// Get value of target field.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        self.fields.get(key.as_ref()).map(String::as_str)
    }

    /// The `ID` field.
    pub fn id(&self) -> Option<&str> {
        self.get("ID")
    }

    /// The `ID_LIKE` field.
    pub fn id_like(&self) -> Option<&str> {
        self.get("ID_LIKE")
    }

    /// Human readable name through `PRETTY_NAME`, falling back to `NAME`.
    pub fn pretty_name(&self) -> Option<&str> {
        self.get("PRETTY_NAME").or_else(|| self.get("NAME"))
    }
}

impl FromStr for OsRelease {
    type Err = DistroError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(data))
    }
}

/// Supported distribution families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DistroFamily {
    /// Arch Linux and derivatives.
    Arch,

    /// Debian, Ubuntu, and derivatives.
    Debian,

    /// Fedora and derivatives.
    Fedora,

    /// Alpine Linux.
    Alpine,
}

// INVARIANT: Order matters, first substring match wins.
const FAMILY_NEEDLES: [(&str, DistroFamily); 5] = [
    ("arch", DistroFamily::Arch),
    ("debian", DistroFamily::Debian),
    ("ubuntu", DistroFamily::Debian),
    ("fedora", DistroFamily::Fedora),
    ("alpine", DistroFamily::Alpine),
];

impl DistroFamily {
    /// All supported families.
    pub const ALL: [DistroFamily; 4] = [Self::Arch, Self::Debian, Self::Fedora, Self::Alpine];

    /// Match identifier against known families through substring containment.
    pub fn from_identifier(identifier: impl AsRef<str>) -> Option<Self> {
        let identifier = identifier.as_ref().to_lowercase();
        FAMILY_NEEDLES
            .iter()
            .find(|(needle, _)| identifier.contains(needle))
            .map(|(_, family)| *family)
    }

    /// Detect family from parsed OS-release file.
    ///
    /// # Errors
    ///
    /// - Return [`DistroError::UnsupportedDistro`] if neither `ID_LIKE` nor
    ///   `ID` names a known family.
    #[instrument(skip(os_release), level = "debug")]
    pub fn detect(os_release: &OsRelease) -> Result<Self> {
        let id_like = os_release.id_like().unwrap_or_default();
        let id = os_release.id().unwrap_or_default();
        debug!("detect distro family from ID={id:?} ID_LIKE={id_like:?}");

        Self::from_identifier(id_like)
            .or_else(|| Self::from_identifier(id))
            .ok_or_else(|| DistroError::UnsupportedDistro {
                id: id.to_string(),
                id_like: id_like.to_string(),
            })
    }

    /// Normalized identifier of family.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arch => "arch",
            Self::Debian => "debian",
            Self::Fedora => "fedora",
            Self::Alpine => "alpine",
        }
    }
}

impl Display for DistroFamily {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Read OS-release file at target path and detect its family.
///
/// # Errors
///
/// - Return [`DistroError::ReadOsRelease`] if file cannot be read.
/// - Return [`DistroError::UnsupportedDistro`] if no family matches.
pub fn detect_from_path(path: impl AsRef<Path>) -> Result<(OsRelease, DistroFamily)> {
    let os_release = OsRelease::read(path)?;
    let family = DistroFamily::detect(&os_release)?;
    Ok((os_release, family))
}

/// Distro detection error types.
#[derive(Debug, thiserror::Error)]
pub enum DistroError {
    /// OS-release file could not be read.
    #[error("failed to read os-release file at {:?}", path.display())]
    ReadOsRelease {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// No supported family matched.
    #[error("unsupported distro (ID={id:?}, ID_LIKE={id_like:?})")]
    UnsupportedDistro { id: String, id_like: String },
}

/// Friendly result alias :3
pub type Result<T, E = DistroError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use simple_test_case::test_case;

    #[test_case("ID=arch", DistroFamily::Arch; "arch by id")]
    #[test_case("ID=manjaro\nID_LIKE=arch", DistroFamily::Arch; "manjaro by id_like")]
    #[test_case("ID=debian", DistroFamily::Debian; "debian by id")]
    #[test_case("ID=ubuntu", DistroFamily::Debian; "ubuntu by id")]
    #[test_case("ID=pop\nID_LIKE=\"ubuntu debian\"", DistroFamily::Debian; "compound id_like")]
    #[test_case("ID=fedora", DistroFamily::Fedora; "fedora by id")]
    #[test_case("ID=nobara\nID_LIKE=\"fedora\"", DistroFamily::Fedora; "fedora by id_like")]
    #[test_case("ID=alpine", DistroFamily::Alpine; "alpine by id")]
    #[test_case("ID=\"fedora\"\nID_LIKE=\"rhel centos\"", DistroFamily::Fedora; "id fallback")]
    #[test]
    fn detect_known_families(contents: &str, expect: DistroFamily) {
        let os_release = OsRelease::parse(contents);
        assert_eq!(DistroFamily::detect(&os_release).unwrap(), expect);
    }

    #[test]
    fn detect_prefers_id_like() {
        let os_release = OsRelease::parse(indoc! {r#"
            NAME="Ubuntu"
            ID=ubuntu
            ID_LIKE=debian
            PRETTY_NAME="Ubuntu 24.04 LTS"
        "#});

        assert_eq!(DistroFamily::detect(&os_release).unwrap(), DistroFamily::Debian);
        assert_eq!(os_release.pretty_name(), Some("Ubuntu 24.04 LTS"));
    }

    #[test_case("ID=nixos"; "nixos")]
    #[test_case("ID=gentoo"; "gentoo")]
    #[test_case(""; "empty")]
    #[test]
    fn detect_unsupported(contents: &str) {
        let os_release = OsRelease::parse(contents);
        let result = DistroFamily::detect(&os_release);
        assert!(matches!(result, Err(DistroError::UnsupportedDistro { .. })));
    }

    #[test]
    fn detect_from_missing_path() {
        let result = detect_from_path("/definitely/not/here/os-release");
        assert!(matches!(result, Err(DistroError::ReadOsRelease { .. })));
    }
}
