// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External command execution.
//!
//! Nearly everything hostprep does boils down to running some external tool:
//! package managers, service managers, firewall frontends, and scanners. All
//! of these calls go through the [`Executor`] trait so provisioning logic can
//! be exercised without touching the host system.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    process::Command,
};
use tracing::{debug, instrument};

/// Program plus arguments to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Construct new command line for target program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append many arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Prefix command line with `sudo` if requested.
    pub fn elevate(self, sudo: bool) -> Self {
        if !sudo {
            return self;
        }

        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.program);
        args.extend(self.args);
        Self {
            program: "sudo".into(),
            args,
        }
    }

    /// Shell snippet run through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl Display for CommandLine {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(fmt, " {arg:?}")?;
            } else {
                write!(fmt, " {arg}")?;
            }
        }

        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` if terminated by signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Merge stdout and stderr into one message.
    pub fn message(&self) -> String {
        let mut message = String::new();
        if !self.stdout.is_empty() {
            message.push_str(format!("stdout: {}", self.stdout).as_str());
        }

        if !self.stderr.is_empty() {
            if !message.is_empty() && !message.ends_with('\n') {
                message.push('\n');
            }
            message.push_str(format!("stderr: {}", self.stderr).as_str());
        }

        // INVARIANT: Chomp trailing newlines.
        message.trim_end_matches(['\r', '\n']).to_string()
    }
}

/// Run external commands.
pub trait Executor {
    /// Run command to completion and capture its output.
    ///
    /// Non-zero exit codes are _not_ errors here; callers that care about the
    /// exit code beyond success or failure should use this method.
    ///
    /// # Errors
    ///
    /// - Return [`ExecError::Spawn`] if command cannot be started.
    fn output(&self, command: &CommandLine) -> Result<CommandOutput>;

    /// Run command with inherited stdio, blocking until it exits.
    ///
    /// # Errors
    ///
    /// - Return [`ExecError::Spawn`] if command cannot be started.
    /// - Return [`ExecError::Failed`] if command exits unsuccessfully.
    fn run_interactive(&self, command: &CommandLine) -> Result<()>;

    /// Check if program can be found on `PATH`.
    fn has_command(&self, program: &str) -> bool;

    /// Run command to completion, treating non-zero exit as failure.
    ///
    /// # Errors
    ///
    /// - Return [`ExecError::Spawn`] if command cannot be started.
    /// - Return [`ExecError::Failed`] if command exits unsuccessfully.
    fn run(&self, command: &CommandLine) -> Result<String> {
        let output = self.output(command)?;
        if !output.success() {
            return Err(ExecError::Failed {
                command: command.to_string(),
                code: output.code,
                message: output.message(),
            });
        }

        Ok(output.message())
    }
}

/// Executor backed by real system processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for SystemExecutor {
    #[instrument(skip(self, command), fields(command = %command), level = "debug")]
    fn output(&self, command: &CommandLine) -> Result<CommandOutput> {
        debug!("run {command}");
        let output = Command::new(command.program())
            .args(command.arguments())
            .output()
            .map_err(|err| ExecError::Spawn {
                source: err,
                command: command.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(output.stdout.as_slice()).into_owned(),
            stderr: String::from_utf8_lossy(output.stderr.as_slice()).into_owned(),
        })
    }

    #[instrument(skip(self, command), fields(command = %command), level = "debug")]
    fn run_interactive(&self, command: &CommandLine) -> Result<()> {
        debug!("run interactive {command}");
        let status = Command::new(command.program())
            .args(command.arguments())
            .spawn()
            .and_then(|mut child| child.wait())
            .map_err(|err| ExecError::Spawn {
                source: err,
                command: command.to_string(),
            })?;

        if !status.success() {
            return Err(ExecError::Failed {
                command: command.to_string(),
                code: status.code(),
                message: String::new(),
            });
        }

        Ok(())
    }

    fn has_command(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Command execution error types.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Command could not be started.
    #[error("failed to spawn {command:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        command: String,
    },

    /// Command exited unsuccessfully.
    #[error("command {command:?} failed with exit code {code:?}{}", fmt_message(.message))]
    Failed {
        command: String,
        code: Option<i32>,
        message: String,
    },
}

fn fmt_message(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(":\n{message}")
    }
}

/// Friendly result alias :3
pub type Result<T, E = ExecError> = std::result::Result<T, E>;
