// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Preconditions checked before provisioning touches the system.
//!
//! Every failure here is fatal. There is no point installing packages
//! without a way to elevate privileges, or scanning without the scanner.

use crate::exec::Executor;

use tracing::{debug, warn};

/// How privileged commands get run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Already running as root.
    Root,

    /// Prefix privileged commands with `sudo`.
    Sudo,
}

impl Privilege {
    /// Check if privileged commands need a `sudo` prefix.
    pub fn needs_sudo(&self) -> bool {
        matches!(self, Self::Sudo)
    }
}

/// Check if current process runs with root privileges.
pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Determine how to run privileged commands.
///
/// # Errors
///
/// - Return [`PreflightError::NotRoot`] if not root, and sudo is disallowed.
/// - Return [`PreflightError::MissingCommand`] if sudo is allowed, but cannot
///   be found.
pub fn resolve_privilege(is_root: bool, use_sudo: bool, executor: &dyn Executor) -> Result<Privilege> {
    if is_root {
        debug!("running as root");
        return Ok(Privilege::Root);
    }

    if !use_sudo {
        return Err(PreflightError::NotRoot);
    }

    if !executor.has_command("sudo") {
        return Err(PreflightError::MissingCommand("sudo".into()));
    }

    warn!("not running as root, privileged commands will use sudo");
    Ok(Privilege::Sudo)
}

/// Ensure every required program is on `PATH`.
///
/// # Errors
///
/// - Return [`PreflightError::MissingCommand`] naming the first missing
///   program.
pub fn require_commands<'a>(
    executor: &dyn Executor,
    programs: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    for program in programs {
        if !executor.has_command(program) {
            return Err(PreflightError::MissingCommand(program.into()));
        }
    }

    Ok(())
}

/// Preflight error types.
#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    /// Not root, and sudo use is disabled.
    #[error("must run as root, or enable use_sudo in configuration")]
    NotRoot,

    /// Required program missing from `PATH`.
    #[error("required command {0:?} not found")]
    MissingCommand(String),

    /// Required credential missing.
    #[error("missing credential {0}")]
    MissingCredential(String),
}

/// Friendly result alias :3
pub type Result<T, E = PreflightError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExecutor;
    use pretty_assertions::assert_eq;

    #[test]
    fn root_needs_nothing() {
        let exec = FakeExecutor::new().without("sudo");
        assert_eq!(resolve_privilege(true, false, &exec).unwrap(), Privilege::Root);
    }

    #[test]
    fn user_with_sudo() {
        let exec = FakeExecutor::new();
        let privilege = resolve_privilege(false, true, &exec).unwrap();
        assert!(privilege.needs_sudo());
    }

    #[test]
    fn user_without_sudo_permission() {
        let exec = FakeExecutor::new();
        let result = resolve_privilege(false, false, &exec);
        assert!(matches!(result, Err(PreflightError::NotRoot)));
    }

    #[test]
    fn user_without_sudo_binary() {
        let exec = FakeExecutor::new().without("sudo");
        let result = resolve_privilege(false, true, &exec);
        assert!(matches!(result, Err(PreflightError::MissingCommand(cmd)) if cmd == "sudo"));
    }

    #[test]
    fn first_missing_command_reported() {
        let exec = FakeExecutor::new().without("ufw").without("dnf");
        let result = require_commands(&exec, ["git", "dnf", "ufw"]);
        assert!(matches!(result, Err(PreflightError::MissingCommand(cmd)) if cmd == "dnf"));
    }
}
