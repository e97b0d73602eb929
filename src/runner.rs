// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Sequential step runner.
//!
//! Provisioning is an ordered list of named [`Step`]s. The runner executes
//! them one after another, never in parallel, because package managers and
//! service managers are not safe to run concurrently and output must stay
//! readable.
//!
//! # Failure Tiers
//!
//! Every step action returns a typed result. On failure the runner alone
//! decides what happens next:
//!
//! - __Fatal__: the step is marked [`Criticality::Fatal`], or the error itself
//!   is fatal in kind (see [`StepError::is_fatal`]). The run stops, and the
//!   error is surfaced together with the report gathered so far.
//! - __Recoverable__: anything else. A warning is logged, the failure is
//!   recorded, and the next step runs.
//!
//! Each step runs at most once per invocation. Actions are `FnOnce`, and step
//! names must be unique within one run.

use crate::{
    dotfiles::DotfileError,
    exec::{ExecError, Executor},
    firewall::FirewallError,
    notify::NotifyError,
    plan::RepositoryError,
    preflight::PreflightError,
    scan::ScanError,
};

use indicatif::{ProgressBar, ProgressStyle};
use std::{
    collections::HashSet,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
};
use tracing::{info, instrument, warn};

/// How a step failure affects the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Failure aborts the whole run.
    Fatal,

    /// Failure is logged, and the run continues.
    BestEffort,
}

impl Display for Criticality {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Fatal => fmt.write_str("fatal"),
            Self::BestEffort => fmt.write_str("best-effort"),
        }
    }
}

/// Successful step outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Step changed something on the system.
    Applied,

    /// Step found nothing to do.
    AlreadySatisfied,
}

/// Boxed step action.
pub type Action<'a> = Box<dyn FnOnce(&dyn Executor) -> Result<Completion, StepError> + 'a>;

/// Named unit of provisioning work.
pub struct Step<'a> {
    name: String,
    criticality: Criticality,
    action: Action<'a>,
}

impl<'a> Step<'a> {
    /// Construct new step.
    pub fn new(
        name: impl Into<String>,
        criticality: Criticality,
        action: impl FnOnce(&dyn Executor) -> Result<Completion, StepError> + 'a,
    ) -> Self {
        Self {
            name: name.into(),
            criticality,
            action: Box::new(action),
        }
    }

    /// Construct step whose failure aborts the run.
    pub fn fatal(
        name: impl Into<String>,
        action: impl FnOnce(&dyn Executor) -> Result<Completion, StepError> + 'a,
    ) -> Self {
        Self::new(name, Criticality::Fatal, action)
    }

    /// Construct step whose failure is only logged.
    pub fn best_effort(
        name: impl Into<String>,
        action: impl FnOnce(&dyn Executor) -> Result<Completion, StepError> + 'a,
    ) -> Self {
        Self::new(name, Criticality::BestEffort, action)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn criticality(&self) -> Criticality {
        self.criticality
    }
}

impl Debug for Step<'_> {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("Step")
            .field("name", &self.name)
            .field("criticality", &self.criticality)
            .finish_non_exhaustive()
    }
}

/// Final status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Applied,
    AlreadySatisfied,
    Skipped,
    Failed,
}

impl Display for StepStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let label = match self {
            Self::Applied => "applied",
            Self::AlreadySatisfied => "ok",
            Self::Skipped => "skipped",
            Self::Failed => "FAILED",
        };
        fmt.pad(label)
    }
}

/// Recorded outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub error: Option<String>,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        self.status != StepStatus::Failed
    }
}

/// Accumulated outcomes of one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub results: Vec<StepResult>,
}

impl RunReport {
    /// Steps that did not fail.
    pub fn succeeded(&self) -> impl Iterator<Item = &StepResult> {
        self.results.iter().filter(|result| result.is_success())
    }

    /// Steps that need manual follow-up.
    pub fn failed(&self) -> impl Iterator<Item = &StepResult> {
        self.results.iter().filter(|result| !result.is_success())
    }

    /// Check if every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed().next().is_none()
    }

    /// Names of every recorded step, in run order.
    pub fn step_names(&self) -> Vec<&str> {
        self.results.iter().map(|result| result.name.as_str()).collect()
    }
}

impl Display for RunReport {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let failed = self.failed().count();
        writeln!(
            fmt,
            "{} steps, {} succeeded, {} need manual follow-up",
            self.results.len(),
            self.results.len() - failed,
            failed
        )?;

        for result in &self.results {
            write!(fmt, "  [{:>7}] {}", result.status, result.name)?;
            if let Some(error) = &result.error {
                let first_line = error.lines().next().unwrap_or_default();
                write!(fmt, ": {first_line}")?;
            }
            writeln!(fmt)?;
        }

        Ok(())
    }
}

/// Explicit runner configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Treat every failure as fatal.
    pub fail_fast: bool,

    /// Draw progress bar over steps.
    pub progress: bool,

    /// Names of steps to record as skipped instead of running.
    pub skip: Vec<String>,
}

/// Runs steps in order against an executor.
pub struct Runner<'e> {
    executor: &'e dyn Executor,
    settings: RunnerSettings,
}

impl<'e> Runner<'e> {
    /// Construct new runner.
    pub fn new(executor: &'e dyn Executor, settings: RunnerSettings) -> Self {
        Self { executor, settings }
    }

    /// Execute steps in order.
    ///
    /// # Errors
    ///
    /// - Return [`RunError::DuplicateStep`] if two steps share a name. Nothing
    ///   runs in that case.
    /// - Return [`RunError::Fatal`] if a fatal failure occurs. Steps after the
    ///   failing one do not run.
    #[instrument(skip(self, steps), level = "debug")]
    pub fn run(&self, steps: Vec<Step<'_>>) -> Result<RunReport> {
        {
            let mut seen = HashSet::new();
            for step in &steps {
                if !seen.insert(step.name.as_str()) {
                    return Err(RunError::DuplicateStep(step.name.clone()));
                }
            }
        }

        let total = steps.len();
        let bar = self.progress_bar(total);
        let mut report = RunReport::default();
        for (index, step) in steps.into_iter().enumerate() {
            let Step {
                name,
                criticality,
                action,
            } = step;
            bar.set_message(name.clone());
            bar.inc(1);

            if self.settings.skip.contains(&name) {
                info!("[{}/{total}] skip {name}", index + 1);
                report.results.push(StepResult {
                    name,
                    status: StepStatus::Skipped,
                    error: None,
                });
                continue;
            }

            info!("[{}/{total}] {name}", index + 1);
            match action(self.executor) {
                Ok(completion) => {
                    let status = match completion {
                        Completion::Applied => StepStatus::Applied,
                        Completion::AlreadySatisfied => StepStatus::AlreadySatisfied,
                    };
                    report.results.push(StepResult {
                        name,
                        status,
                        error: None,
                    });
                }
                Err(error) => {
                    report.results.push(StepResult {
                        name: name.clone(),
                        status: StepStatus::Failed,
                        error: Some(error.to_string()),
                    });

                    if criticality == Criticality::Fatal || error.is_fatal() || self.settings.fail_fast {
                        bar.abandon();
                        return Err(RunError::Fatal {
                            step: name,
                            source: error,
                            report,
                        });
                    }

                    warn!("{name} failed, continuing: {error}");
                }
            }
        }
        bar.finish_and_clear();

        Ok(report)
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.settings.progress {
            return ProgressBar::hidden();
        }

        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::with_template("{elapsed_precise} [{bar:30}] {pos}/{len} {msg}") {
            bar.set_style(style.progress_chars("=> "));
        }
        bar
    }
}

/// Error returned by a step action.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// External command failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Extra repository could not be configured.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Dotfile clone failed.
    #[error(transparent)]
    Dotfile(#[from] DotfileError),

    /// Firewall rule is invalid.
    #[error(transparent)]
    Firewall(#[from] FirewallError),

    /// Scan or scan log handling failed.
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// Notification could not be prepared.
    #[error(transparent)]
    Notify(NotifyError),

    /// Precondition for provisioning does not hold.
    #[error(transparent)]
    Preflight(#[from] PreflightError),

    /// Anything else.
    #[error("{0}")]
    Message(String),
}

impl From<NotifyError> for StepError {
    fn from(error: NotifyError) -> Self {
        match error {
            NotifyError::Credential(error) => Self::Preflight(error),
            error => Self::Notify(error),
        }
    }
}

impl StepError {
    /// Check if error aborts the run regardless of step criticality.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Preflight(_))
    }
}

/// Step runner error types.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Two steps share one name.
    #[error("step {0:?} is listed more than once")]
    DuplicateStep(String),

    /// Fatal failure aborted run.
    #[error("fatal failure in step {step:?}")]
    Fatal {
        step: String,
        #[source]
        source: StepError,
        report: RunReport,
    },
}

/// Friendly result alias :3
pub type Result<T, E = RunError> = std::result::Result<T, E>;
