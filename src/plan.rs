// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Package plan registry.
//!
//! Each supported distro family maps to exactly one [`DistroProfile`]: the
//! package manager to drive, the flat list of packages to install, any extra
//! repositories those packages need, and the services to enable afterwards.
//! The registry is a static table. Supporting a new family means adding an
//! entry here, not writing new logic.

use crate::{
    distro::{DistroError, DistroFamily, OsRelease},
    exec::CommandLine,
};

use std::fmt::{Display, Formatter, Result as FmtResult};

/// Package managers hostprep knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pacman,
    Apt,
    Dnf,
    Apk,
}

impl PackageManager {
    /// Name of package manager binary.
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Pacman => "pacman",
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
            Self::Apk => "apk",
        }
    }

    /// Command to refresh package index.
    ///
    /// Pacman also upgrades here, since Arch does not support partial upgrades.
    pub fn refresh(&self) -> CommandLine {
        let command = CommandLine::new(self.binary());
        match self {
            Self::Pacman => command.args(["-Syu", "--noconfirm"]),
            Self::Apt => command.arg("update"),
            Self::Dnf => command.args(["makecache", "-y"]),
            Self::Apk => command.arg("update"),
        }
    }

    /// Command to install one package non-interactively.
    pub fn install(&self, package: &str) -> CommandLine {
        let command = CommandLine::new(self.binary());
        match self {
            Self::Pacman => command.args(["-S", "--needed", "--noconfirm", package]),
            Self::Apt => command.args(["install", "-y", package]),
            Self::Dnf => command.args(["install", "-y", package]),
            Self::Apk => command.args(["add", package]),
        }
    }

    /// Command that exits successfully if package is already installed.
    pub fn query(&self, package: &str) -> CommandLine {
        match self {
            Self::Pacman => CommandLine::new("pacman").args(["-Q", package]),
            Self::Apt => CommandLine::new("dpkg").args(["-s", package]),
            Self::Dnf => CommandLine::new("rpm").args(["-q", package]),
            Self::Apk => CommandLine::new("apk").args(["info", "-e", package]),
        }
    }
}

impl Display for PackageManager {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.binary())
    }
}

/// Service managers hostprep knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceManager {
    Systemd,
    OpenRc,
}

impl ServiceManager {
    /// Commands to enable service at boot and start it now.
    pub fn enable(&self, service: &str) -> Vec<CommandLine> {
        match self {
            Self::Systemd => vec![CommandLine::new("systemctl").args(["enable", "--now", service])],
            Self::OpenRc => vec![
                CommandLine::new("rc-update").args(["add", service, "default"]),
                CommandLine::new("rc-service").args([service, "start"]),
            ],
        }
    }

    pub fn binary(&self) -> &'static str {
        match self {
            Self::Systemd => "systemctl",
            Self::OpenRc => "rc-service",
        }
    }
}

/// Third-party repository registered before package installation.
///
/// URLs may contain `{id}` and `{codename}` placeholders. Derivatives share
/// their parent's repositories, so `{id}` is filled with `ubuntu` when `ID` or
/// `ID_LIKE` mentions it and `debian` otherwise. `{codename}` prefers
/// `UBUNTU_CODENAME` over `VERSION_CODENAME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraRepository {
    /// Short name, used for file names on disk.
    pub name: &'static str,

    /// Repository URL (or repository file URL for dnf).
    pub url: &'static str,

    /// URL of repository signing key.
    pub signing_key: &'static str,
}

impl ExtraRepository {
    /// Commands that register repository and its signing key.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::MissingField`] if a placeholder cannot be
    ///   filled from the OS-release file.
    /// - Return [`RepositoryError::Unsupported`] if package manager has no
    ///   notion of extra repositories here.
    pub fn setup_commands(
        &self,
        manager: PackageManager,
        os_release: &OsRelease,
    ) -> Result<Vec<CommandLine>, RepositoryError> {
        let url = fill_placeholders(self.url, os_release)?;
        let key = fill_placeholders(self.signing_key, os_release)?;

        match manager {
            PackageManager::Apt => {
                let keyring = format!("/usr/share/keyrings/{}-archive-keyring.gpg", self.name);
                let codename = suite(os_release)?;
                let source = format!("deb [signed-by={keyring}] {url} {codename} main");
                Ok(vec![
                    CommandLine::new("curl").args(["-fsSL", "-o", keyring.as_str(), key.as_str()]),
                    CommandLine::shell(format!(
                        "echo '{source}' > /etc/apt/sources.list.d/{}.list",
                        self.name
                    )),
                ])
            }
            PackageManager::Dnf => Ok(vec![
                CommandLine::new("rpm").args(["--import", key.as_str()]),
                CommandLine::new("dnf").args([
                    "config-manager".to_string(),
                    "addrepo".to_string(),
                    format!("--from-repofile={url}"),
                    "--overwrite".to_string(),
                ]),
            ]),
            PackageManager::Pacman | PackageManager::Apk => Err(RepositoryError::Unsupported(manager)),
        }
    }
}

fn fill_placeholders(template: &str, os_release: &OsRelease) -> Result<String, RepositoryError> {
    let mut filled = template.to_string();
    if filled.contains("{id}") {
        filled = filled.replace("{id}", base_distribution(os_release));
    }
    if filled.contains("{codename}") {
        filled = filled.replace("{codename}", suite(os_release)?);
    }

    Ok(filled)
}

/// Parent distribution whose apt repositories a Debian family member uses.
fn base_distribution(os_release: &OsRelease) -> &'static str {
    let mentions_ubuntu = [os_release.id(), os_release.id_like()]
        .into_iter()
        .flatten()
        .any(|value| value.to_lowercase().contains("ubuntu"));

    if mentions_ubuntu {
        "ubuntu"
    } else {
        "debian"
    }
}

fn suite(os_release: &OsRelease) -> Result<&str, RepositoryError> {
    os_release
        .get("UBUNTU_CODENAME")
        .filter(|codename| !codename.is_empty())
        .or_else(|| os_release.get("VERSION_CODENAME"))
        .ok_or(RepositoryError::MissingField("VERSION_CODENAME"))
}

/// Everything needed to provision one distro family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistroProfile {
    pub family: DistroFamily,
    pub manager: PackageManager,
    pub service_manager: ServiceManager,
    pub packages: &'static [&'static str],
    pub repositories: &'static [ExtraRepository],
    pub services: &'static [&'static str],
}

impl DistroProfile {
    /// Look up profile for target family.
    ///
    /// # Errors
    ///
    /// - Return [`DistroError::UnsupportedDistro`] if family has no entry.
    pub fn for_family(family: DistroFamily) -> Result<&'static DistroProfile, DistroError> {
        PROFILES
            .iter()
            .find(|profile| profile.family == family)
            .ok_or_else(|| DistroError::UnsupportedDistro {
                id: family.to_string(),
                id_like: String::new(),
            })
    }

    /// Final package list after applying user additions and removals.
    ///
    /// Profile order is kept, additions go last, duplicates are dropped.
    pub fn package_list(
        &self,
        extra: impl IntoIterator<Item = impl AsRef<str>>,
        skip: &[String],
    ) -> Vec<String> {
        let mut packages: Vec<String> = Vec::new();
        let candidates = self
            .packages
            .iter()
            .map(|package| package.to_string())
            .chain(extra.into_iter().map(|package| package.as_ref().to_string()));

        for package in candidates {
            if skip.contains(&package) || packages.contains(&package) {
                continue;
            }
            packages.push(package);
        }

        packages
    }
}

/// Look up profile through raw distro identifier.
///
/// # Errors
///
/// - Return [`DistroError::UnsupportedDistro`] if identifier matches no family.
pub fn profile_for_identifier(identifier: &str) -> Result<&'static DistroProfile, DistroError> {
    let family =
        DistroFamily::from_identifier(identifier).ok_or_else(|| DistroError::UnsupportedDistro {
            id: identifier.to_string(),
            id_like: String::new(),
        })?;
    DistroProfile::for_family(family)
}

const TAILSCALE_APT: ExtraRepository = ExtraRepository {
    name: "tailscale",
    url: "https://pkgs.tailscale.com/stable/{id}",
    signing_key: "https://pkgs.tailscale.com/stable/{id}/{codename}.noarmor.gpg",
};

const TAILSCALE_DNF: ExtraRepository = ExtraRepository {
    name: "tailscale",
    url: "https://pkgs.tailscale.com/stable/fedora/tailscale.repo",
    signing_key: "https://pkgs.tailscale.com/stable/fedora/repo.gpg",
};

static PROFILES: [DistroProfile; 4] = [
    DistroProfile {
        family: DistroFamily::Arch,
        manager: PackageManager::Pacman,
        service_manager: ServiceManager::Systemd,
        packages: &[
            "base-devel", "git", "curl", "wget", "fish", "neovim", "tmux", "ripgrep", "fd", "fzf",
            "bat", "htop", "ufw", "clamav", "tailscale", "tlp",
        ],
        repositories: &[],
        services: &["tailscaled", "ufw", "clamav-freshclam", "tlp"],
    },
    DistroProfile {
        family: DistroFamily::Debian,
        manager: PackageManager::Apt,
        service_manager: ServiceManager::Systemd,
        packages: &[
            "build-essential", "git", "curl", "wget", "fish", "neovim", "tmux", "ripgrep",
            "fd-find", "fzf", "bat", "htop", "ufw", "clamav", "clamav-daemon", "tailscale", "tlp",
        ],
        repositories: &[TAILSCALE_APT],
        services: &["tailscaled", "ufw", "clamav-freshclam", "tlp"],
    },
    DistroProfile {
        family: DistroFamily::Fedora,
        manager: PackageManager::Dnf,
        service_manager: ServiceManager::Systemd,
        packages: &[
            "gcc", "make", "git", "curl", "wget", "fish", "neovim", "tmux", "ripgrep", "fd-find",
            "fzf", "bat", "htop", "ufw", "clamav", "clamav-update", "tailscale", "tlp",
        ],
        repositories: &[TAILSCALE_DNF],
        services: &["tailscaled", "ufw", "clamav-freshclam", "tlp"],
    },
    DistroProfile {
        family: DistroFamily::Alpine,
        manager: PackageManager::Apk,
        service_manager: ServiceManager::OpenRc,
        packages: &[
            "build-base", "git", "curl", "wget", "fish", "neovim", "tmux", "ripgrep", "fd", "fzf",
            "bat", "htop", "ufw", "clamav", "tailscale",
        ],
        repositories: &[],
        services: &["tailscale", "ufw", "freshclam"],
    },
];

/// Extra repository setup error types.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// OS-release field needed by repository URL is missing.
    #[error("os-release field {0} is required to configure repository")]
    MissingField(&'static str),

    /// Package manager does not support extra repositories.
    #[error("extra repositories are not supported for {0}")]
    Unsupported(PackageManager),
}
