// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of hostprep's configuration file to simplify the
//! process of serialization and deserialization. The configuration is an
//! explicit value handed to whatever needs it. Nothing downstream reads the
//! process environment on its own.
//!
//! # General Layout
//!
//! ```toml
//! [settings]
//! os_release = "/etc/os-release"
//! use_sudo = true
//! extra_packages = ["zoxide"]
//!
//! [[dotfiles]]
//! name = "fish"
//! url = "https://example.org/fish.git"
//! target = "$HOME/.config/fish"
//!
//! [firewall]
//! enabled = true
//!
//! [[firewall.rules]]
//! action = "allow"
//! from = "192.168.0.0/16"
//! port = 22
//! proto = "tcp"
//!
//! [scan]
//! scanner = "clamscan"
//! targets = ["/home"]
//! ```
//!
//! Path-valued fields go through shell expansion when parsed.

use crate::{
    distro::DEFAULT_OS_RELEASE,
    firewall::{default_rules, FirewallRule},
    scan::{Scanner, DEFAULT_RETENTION_DAYS},
};

use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::{read_to_string, write},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info};

/// Default Telegram Bot API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Hostprep configuration.
#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// General settings.
    pub settings: Settings,

    /// Dotfile repositories to clone.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dotfiles: Vec<Dotfile>,

    /// Firewall configuration.
    pub firewall: FirewallSettings,

    /// Malware scan configuration.
    pub scan: ScanSettings,
}

impl Config {
    /// Load configuration at target path.
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists, but cannot be read.
    /// - Return [`ConfigError`] if file contents are invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("no configuration at {:?}, using defaults", path.display());
            return Ok(Self::default());
        }

        debug!("load configuration from {:?}", path.display());
        let data = read_to_string(path).map_err(|err| ConfigError::Read {
            source: err,
            path: path.to_path_buf(),
        })?;

        data.parse()
    }

    /// Write configuration to target path, creating parent directories.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Write`] if file cannot be written.
    /// - Return [`ConfigError::Serialize`] if serialization fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = toml::ser::to_string_pretty(self)?;
        let write_error = |err| ConfigError::Write {
            source: err,
            path: path.to_path_buf(),
        };

        if let Some(parent) = path.parent() {
            mkdirp::mkdirp(parent).map_err(write_error)?;
        }
        write(path, data).map_err(write_error)?;

        Ok(())
    }

    /// Ensure every entry maps to a distinct step name.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::DuplicateDotfile`] if two dotfile entries share
    ///   a name.
    /// - Return [`ConfigError::DuplicateRule`] if two firewall rules only
    ///   differ by comment.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for dotfile in &self.dotfiles {
            if !names.insert(dotfile.name.as_str()) {
                return Err(ConfigError::DuplicateDotfile(dotfile.name.clone()));
            }
        }

        let mut labels = HashSet::new();
        for rule in &self.firewall.rules {
            let label = rule.label();
            if labels.contains(&label) {
                return Err(ConfigError::DuplicateRule(label));
            }
            labels.insert(label);
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        config.settings.os_release = expand_path(&config.settings.os_release)?;
        if let Some(credentials) = &config.settings.credentials {
            config.settings.credentials = Some(expand_path(credentials)?);
        }
        for dotfile in &mut config.dotfiles {
            dotfile.target = expand_path(&dotfile.target)?;
        }
        for target in &mut config.scan.targets {
            *target = expand_path(target)?;
        }
        config.scan.log_dir = expand_path(&config.scan.log_dir)?;
        config.validate()?;

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// General settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// OS-release file to detect distro from.
    pub os_release: PathBuf,

    /// Messaging credentials file. Platform default if missing.
    pub credentials: Option<PathBuf>,

    /// Prefix privileged commands with sudo when not root.
    pub use_sudo: bool,

    /// Packages installed on top of distro profile.
    pub extra_packages: Vec<String>,

    /// Profile packages to leave out.
    pub skip_packages: Vec<String>,

    /// Step names to skip.
    pub skip_steps: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            os_release: PathBuf::from(DEFAULT_OS_RELEASE),
            credentials: None,
            use_sudo: true,
            extra_packages: Vec::new(),
            skip_packages: Vec::new(),
            skip_steps: Vec::new(),
        }
    }
}

/// Dotfile repository entry.
#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Dotfile {
    /// Unique name of entry, used in step names.
    pub name: String,

    /// Remote URL to clone from.
    pub url: String,

    /// Directory to clone into.
    pub target: PathBuf,

    /// Branch to check out instead of the remote default.
    pub branch: Option<String>,
}

/// Firewall settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FirewallSettings {
    /// Configure firewall at all.
    pub enabled: bool,

    /// Rules applied after default policies.
    pub rules: Vec<FirewallRule>,
}

impl Default for FirewallSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: default_rules(),
        }
    }
}

/// Malware scan settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Scanner frontend.
    pub scanner: Scanner,

    /// Paths to scan recursively.
    pub targets: Vec<PathBuf>,

    /// Directory holding scan logs.
    pub log_dir: PathBuf,

    /// Days to keep scan logs.
    pub retention_days: u32,

    /// Send notification after scan.
    pub notify: bool,

    /// Attach scan log to notification.
    pub attach_log: bool,

    /// Messaging API base URL.
    pub api_url: String,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            scanner: Scanner::default(),
            targets: vec![PathBuf::from("/home")],
            log_dir: PathBuf::from("/var/log/hostprep"),
            retention_days: DEFAULT_RETENTION_DAYS,
            notify: true,
            attach_log: false,
            api_url: DEFAULT_API_URL.into(),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Two dotfile entries share one name.
    #[error("dotfile entry {0:?} is listed more than once")]
    DuplicateDotfile(String),

    /// Two firewall rules differ only by comment.
    #[error("firewall rule {0:?} is listed more than once")]
    DuplicateRule(String),

    /// Failed to read configuration file.
    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to write configuration file.
    #[error("failed to write configuration at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{Protocol, RuleAction};
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("BLAH", "/home/blah")])]
    fn deserialize_config() -> anyhow::Result<()> {
        let result: Config = r#"
            [settings]
            os_release = "$BLAH/os-release"
            credentials = "$BLAH/.config/hostprep/credentials"
            use_sudo = false
            extra_packages = ["zoxide"]

            [[dotfiles]]
            name = "fish"
            url = "https://blah.org/fish.git"
            target = "$BLAH/.config/fish"
            branch = "main"

            [firewall]
            enabled = true

            [[firewall.rules]]
            action = "deny"
            port = 23
            proto = "tcp"

            [scan]
            scanner = "clamdscan"
            targets = ["$BLAH"]
            log_dir = "$BLAH/scans"
            notify = false
        "#
        .parse()?;

        let expect = Config {
            settings: Settings {
                os_release: "/home/blah/os-release".into(),
                credentials: Some("/home/blah/.config/hostprep/credentials".into()),
                use_sudo: false,
                extra_packages: vec!["zoxide".into()],
                ..Default::default()
            },
            dotfiles: vec![Dotfile {
                name: "fish".into(),
                url: "https://blah.org/fish.git".into(),
                target: "/home/blah/.config/fish".into(),
                branch: Some("main".into()),
            }],
            firewall: FirewallSettings {
                enabled: true,
                rules: vec![FirewallRule {
                    action: RuleAction::Deny,
                    port: Some(23),
                    proto: Some(Protocol::Tcp),
                    ..Default::default()
                }],
            },
            scan: ScanSettings {
                scanner: Scanner::Clamdscan,
                targets: vec!["/home/blah".into()],
                log_dir: "/home/blah/scans".into(),
                notify: false,
                ..Default::default()
            },
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn empty_config_is_default() -> anyhow::Result<()> {
        let result: Config = "".parse()?;
        assert_eq!(result, Config::default());
        assert!(result.settings.use_sudo);
        assert_eq!(result.scan.retention_days, 30);
        Ok(())
    }

    #[test]
    fn serialize_config() -> anyhow::Result<()> {
        let config = Config {
            settings: Settings {
                extra_packages: vec!["zoxide".into(), "fzf".into()],
                ..Default::default()
            },
            dotfiles: vec![Dotfile {
                name: "nvim".into(),
                url: "https://blah.org/nvim.git".into(),
                target: "/home/blah/.config/nvim".into(),
                branch: None,
            }],
            ..Default::default()
        };

        let result = config.to_string();
        let expect = indoc! {r#"
            [[dotfiles]]
            name = "nvim"
            url = "https://blah.org/nvim.git"
            target = "/home/blah/.config/nvim"
        "#};

        assert!(result.contains(expect), "{result}");
        assert!(result.contains("scanner = \"clamscan\""));
        assert!(!result.contains("credentials"));
        assert_eq!(result.parse::<Config>()?, config);

        Ok(())
    }

    #[test]
    fn duplicate_dotfile_names_rejected() {
        let result: Result<Config> = indoc! {r#"
            [[dotfiles]]
            name = "fish"
            url = "https://blah.org/fish.git"
            target = "/home/blah/.config/fish"

            [[dotfiles]]
            name = "fish"
            url = "https://blah.org/other-fish.git"
            target = "/home/blah/.config/other-fish"
        "#}
        .parse();

        assert!(matches!(result, Err(ConfigError::DuplicateDotfile(name)) if name == "fish"));
    }

    #[test]
    fn rules_differing_only_by_comment_rejected() {
        let result: Result<Config> = indoc! {r#"
            [[firewall.rules]]
            action = "allow"
            port = 22
            comment = "ssh"

            [[firewall.rules]]
            action = "allow"
            port = 22
            comment = "ssh again"
        "#}
        .parse();

        assert!(matches!(result, Err(ConfigError::DuplicateRule(label)) if label == "allow-any-22"));
    }

    #[test]
    fn save_then_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::default();

        config.save(&path)?;
        assert_eq!(Config::load(&path)?, config);
        Ok(())
    }

    #[test]
    fn load_missing_is_default() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(Config::load(dir.path().join("nope.toml"))?, Config::default());
        Ok(())
    }
}
