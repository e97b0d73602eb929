// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Dotfile repository cloning.
//!
//! Dotfiles are plain Git repositories cloned straight into their target
//! directory, e.g., a fish configuration repository cloned into
//! `~/.config/fish`.
//!
//! # Backup On Conflict
//!
//! Provisioning must be safe to re-run. If the target directory already
//! exists, it is never removed. Instead it is renamed to a sibling backup
//! named `<name>.bak.<YYYYMMDDHHMMSS>`, and the fresh clone takes its place.
//! Backup timestamps are strictly increasing per target: if a backup with an
//! equal or later timestamp already exists, the new one is placed one second
//! after the latest. If the clone then fails, the backup is moved back.

use crate::config::Dotfile;

use auth_git2::{GitAuthenticator, Prompter};
use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, Timelike};
use git2::{build::RepoBuilder, Config, FetchOptions, RemoteCallbacks, Repository};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    ffi::OsStr,
    fs::{read_dir, rename},
    path::{Path, PathBuf},
    time,
};
use tracing::{debug, info, instrument, warn};

/// Timestamp layout of backup suffix.
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Outcome of cloning one dotfile repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOutcome {
    /// Where the repository was cloned to.
    pub target: PathBuf,

    /// Where the previous target contents were moved, if anything existed.
    pub backup: Option<PathBuf>,
}

/// Move existing target out of the way.
///
/// Returns the backup path, or `None` if target did not exist.
///
/// # Errors
///
/// - Return [`DotfileError::InvalidTarget`] if target has no file name or
///   parent directory.
/// - Return [`DotfileError::Backup`] if rename fails.
#[instrument(skip(now), level = "debug")]
pub fn backup_existing(target: &Path, now: DateTime<Local>) -> Result<Option<PathBuf>> {
    if target.symlink_metadata().is_err() {
        debug!("nothing to back up at {:?}", target.display());
        return Ok(None);
    }

    let invalid = || DotfileError::InvalidTarget(target.to_path_buf());
    let name = target.file_name().and_then(OsStr::to_str).ok_or_else(invalid)?;
    let parent = target.parent().ok_or_else(invalid)?;

    let mut stamp = now.naive_local();
    stamp = stamp.with_nanosecond(0).unwrap_or(stamp);
    if let Some(latest) = latest_backup(parent, name) {
        if latest >= stamp {
            stamp = latest + TimeDelta::seconds(1);
        }
    }

    let mut backup = backup_path(parent, name, stamp);
    while backup.symlink_metadata().is_ok() {
        stamp += TimeDelta::seconds(1);
        backup = backup_path(parent, name, stamp);
    }

    info!("back up {:?} to {:?}", target.display(), backup.display());
    rename(target, &backup).map_err(|err| DotfileError::Backup {
        source: err,
        from: target.to_path_buf(),
        to: backup.clone(),
    })?;

    Ok(Some(backup))
}

fn backup_path(parent: &Path, name: &str, stamp: NaiveDateTime) -> PathBuf {
    parent.join(format!("{name}.bak.{}", stamp.format(BACKUP_TIMESTAMP_FORMAT)))
}

/// Latest backup timestamp of target name inside parent directory.
fn latest_backup(parent: &Path, name: &str) -> Option<NaiveDateTime> {
    let prefix = format!("{name}.bak.");
    read_dir(parent)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let file_name = entry.file_name();
            let suffix = file_name.to_str()?.strip_prefix(prefix.as_str())?.to_string();
            NaiveDateTime::parse_from_str(&suffix, BACKUP_TIMESTAMP_FORMAT).ok()
        })
        .max()
}

/// Clone dotfile repository into its target, backing up what was there.
///
/// # Errors
///
/// - Return [`DotfileError::CreateParent`] if parent directory of target
///   cannot be created.
/// - Return [`DotfileError`] if backup or clone fails. A failed clone
///   restores the backup when possible.
#[instrument(skip(dotfile, now, bar), fields(name = %dotfile.name), level = "debug")]
pub fn install_dotfile(
    dotfile: &Dotfile,
    now: DateTime<Local>,
    bar: ProgressBar,
) -> Result<CloneOutcome> {
    let target = dotfile.target.clone();
    if let Some(parent) = target.parent() {
        mkdirp::mkdirp(parent).map_err(|err| DotfileError::CreateParent {
            source: err,
            path: parent.to_path_buf(),
        })?;
    }

    let backup = backup_existing(&target, now)?;
    match clone_repository(&dotfile.url, &target, dotfile.branch.as_deref(), bar) {
        Ok(_) => Ok(CloneOutcome { target, backup }),
        Err(error) => {
            if let Some(backup) = &backup {
                if target.symlink_metadata().is_err() {
                    warn!("clone failed, restore {:?}", target.display());
                    if let Err(err) = rename(backup, &target) {
                        warn!("cannot restore backup {:?}: {err}", backup.display());
                    }
                } else {
                    warn!(
                        "clone failed, previous contents kept at {:?}",
                        backup.display()
                    );
                }
            }
            Err(error)
        }
    }
}

/// Clone repository from target URL into target path.
///
/// The progress of the clone is displayed through a progress bar. If
/// credentials are required for the clone to continue, then the user will be
/// prompted for that information accordingly. The progress bar will be
/// blocked for user input.
///
/// # Errors
///
/// - Return [`DotfileError::Git2`] if libgit2 operations fail.
/// - Return [`DotfileError::IndicatifStyleTemplate`] if progress bar style is
///   invalid.
pub fn clone_repository(
    url: &str,
    path: &Path,
    branch: Option<&str>,
    bar: ProgressBar,
) -> Result<Repository> {
    info!("clone {url} into {:?}", path.display());
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_message(url.to_string());
    bar.enable_steady_tick(time::Duration::from_millis(100));

    let prompter = IndicatifPrompter::new(bar);
    let authenticator = GitAuthenticator::default().set_prompter(prompter.clone());
    let config = Config::open_default()?;

    let mut throttle = time::Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(&config));
    rc.transfer_progress(|progress| {
        let stats = progress.to_owned();
        let bar_size = stats.total_objects() as u64;
        let bar_pos = stats.received_objects() as u64;
        if throttle.elapsed() > time::Duration::from_millis(10) {
            throttle = time::Instant::now();
            prompter.bar.set_length(bar_size);
            prompter.bar.set_position(bar_pos);
        }
        true
    });

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(rc);
    let mut builder = RepoBuilder::new();
    builder.fetch_options(fo);
    if let Some(branch) = branch {
        builder.branch(branch);
    }

    let result = builder.clone(url, path);
    prompter.bar.finish_and_clear();

    Ok(result?)
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    pub(crate) bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// Dotfile clone error types.
#[derive(Debug, thiserror::Error)]
pub enum DotfileError {
    /// Target path cannot be backed up.
    #[error("invalid dotfile target {:?}", .0.display())]
    InvalidTarget(PathBuf),

    /// Parent directory of target cannot be created.
    #[error("failed to create directory {:?}", path.display())]
    CreateParent {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Existing target cannot be moved to backup.
    #[error("failed to back up {:?} to {:?}", from.display(), to.display())]
    Backup {
        #[source]
        source: std::io::Error,
        from: PathBuf,
        to: PathBuf,
    },

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = DotfileError> = std::result::Result<T, E>;
