// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that hostprep
//! reads from. These are the only ambient inputs hostprep consults besides
//! the command line.

use std::path::PathBuf;

/// Determine default absolute path to hostprep's configuration directory.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/hostprep`. Does not check
/// if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("hostprep"))
        .ok_or(NoWayHome)
}

/// Default absolute path to configuration file.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_config_path() -> Result<PathBuf> {
    default_config_dir().map(|path| path.join("config.toml"))
}

/// Default absolute path to messaging credentials file.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_credentials_path() -> Result<PathBuf> {
    default_config_dir().map(|path| path.join("credentials"))
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
