// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Scan-and-notify pipeline.
//!
//! The scan pipeline reuses the step runner so that it shares the same
//! failure tiers as provisioning:
//!
//! | Step               | Criticality | Notes                               |
//! |--------------------|-------------|-------------------------------------|
//! | `scan:credentials` | fatal       | only when notifying                 |
//! | `scan:privilege`   | fatal       | only when running the scanner       |
//! | `scan:run`         | fatal       | or `scan:parse` for an existing log |
//! | `scan:notify`      | best effort | only when notifying                 |
//! | `scan:prune`       | best effort |                                     |
//!
//! Stages hand results to each other through shared state owned by
//! [`ScanPipeline`].

use crate::{
    config::ScanSettings,
    exec::Executor,
    notify::{deliver, Credentials, Notifier, TelegramNotifier},
    preflight::{require_commands, resolve_privilege},
    runner::{Completion, Step, StepError},
    scan::{log_file_path, prepare_log_dir, prune_logs, prune_logs_elevated, run_scan, ScanReport},
};

use chrono::{DateTime, Local};
use std::{
    cell::RefCell,
    fmt::{Debug, Formatter, Result as FmtResult},
    path::PathBuf,
    time::SystemTime,
};
use tracing::info;

/// Constructs a notifier from API base URL and credentials.
pub type Connect<'a> = Box<dyn Fn(&str, Credentials) -> Box<dyn Notifier> + 'a>;

/// Where scan output comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanSource {
    /// Run the configured scanner.
    Run,

    /// Parse an existing scan log.
    Log(PathBuf),
}

#[derive(Debug, Default)]
struct ScanState {
    credentials: Option<Credentials>,
    sudo: bool,
    log_file: Option<PathBuf>,
    report: Option<ScanReport>,
}

/// One scan-and-notify invocation.
pub struct ScanPipeline<'a> {
    settings: &'a ScanSettings,
    source: ScanSource,
    credentials_path: PathBuf,
    notify: bool,
    is_root: bool,
    use_sudo: bool,
    started: DateTime<Local>,
    host: String,
    connect: Connect<'a>,
    state: RefCell<ScanState>,
}

impl<'a> ScanPipeline<'a> {
    /// Construct new pipeline that delivers over the Telegram Bot API.
    pub fn new(
        settings: &'a ScanSettings,
        source: ScanSource,
        credentials_path: impl Into<PathBuf>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            settings,
            source,
            credentials_path: credentials_path.into(),
            notify: settings.notify,
            is_root: true,
            use_sudo: false,
            started: Local::now(),
            host: host.into(),
            connect: Box::new(|api_url: &str, credentials: Credentials| -> Box<dyn Notifier> {
                Box::new(TelegramNotifier::new(api_url, credentials))
            }),
            state: RefCell::new(ScanState::default()),
        }
    }

    /// Override whether to notify at all.
    pub fn with_notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    /// Set privilege inputs used when running the scanner.
    pub fn with_privilege(mut self, is_root: bool, use_sudo: bool) -> Self {
        self.is_root = is_root;
        self.use_sudo = use_sudo;
        self
    }

    /// Set time the scan is considered started.
    pub fn with_start(mut self, started: DateTime<Local>) -> Self {
        self.started = started;
        self
    }

    /// Replace notifier construction.
    pub fn with_connect(mut self, connect: Connect<'a>) -> Self {
        self.connect = connect;
        self
    }

    /// Ordered pipeline steps.
    pub fn steps(&self) -> Vec<Step<'_>> {
        let mut steps = Vec::new();
        if self.notify {
            steps.push(Step::fatal("scan:credentials", move |_| self.load_credentials()));
        }

        match &self.source {
            ScanSource::Run => {
                steps.push(Step::fatal("scan:privilege", move |exec| self.check_privilege(exec)));
                steps.push(Step::fatal("scan:run", move |exec| self.run_scanner(exec)));
            }
            ScanSource::Log(path) => {
                steps.push(Step::fatal("scan:parse", move |_| self.parse_log(path.clone())));
            }
        }

        if self.notify {
            steps.push(Step::best_effort("scan:notify", move |_| self.send_report()));
        }
        steps.push(Step::best_effort("scan:prune", move |exec| self.prune(exec)));

        steps
    }

    /// Parsed report, once a scan or parse stage has completed.
    pub fn report(&self) -> Option<ScanReport> {
        self.state.borrow().report.clone()
    }

    fn load_credentials(&self) -> Result<Completion, StepError> {
        let credentials = Credentials::read(&self.credentials_path)?;
        self.state.borrow_mut().credentials = Some(credentials);
        Ok(Completion::AlreadySatisfied)
    }

    fn check_privilege(&self, exec: &dyn Executor) -> Result<Completion, StepError> {
        let privilege = resolve_privilege(self.is_root, self.use_sudo, exec)?;
        require_commands(exec, [self.settings.scanner.binary()])?;
        self.state.borrow_mut().sudo = privilege.needs_sudo();
        Ok(Completion::AlreadySatisfied)
    }

    fn run_scanner(&self, exec: &dyn Executor) -> Result<Completion, StepError> {
        let sudo = self.state.borrow().sudo;
        prepare_log_dir(exec, &self.settings.log_dir, sudo)?;
        let log_file = log_file_path(&self.settings.log_dir, self.started);

        let stdout = run_scan(exec, self.settings.scanner, &self.settings.targets, &log_file, sudo)?;
        let report = if stdout.trim().is_empty() {
            ScanReport::from_log(&log_file, Local::now())?
        } else {
            ScanReport::parse(&stdout, Local::now())
        };
        info!("scan found {} infected file(s)", report.infected);

        let mut state = self.state.borrow_mut();
        state.log_file = Some(log_file);
        state.report = Some(report);
        Ok(Completion::Applied)
    }

    fn parse_log(&self, path: PathBuf) -> Result<Completion, StepError> {
        let report = ScanReport::from_log(&path, Local::now())?;
        let mut state = self.state.borrow_mut();
        state.log_file = Some(path);
        state.report = Some(report);
        Ok(Completion::AlreadySatisfied)
    }

    fn send_report(&self) -> Result<Completion, StepError> {
        let state = self.state.borrow();
        let (Some(credentials), Some(report)) = (&state.credentials, &state.report) else {
            return Err(StepError::Message("nothing to notify about".into()));
        };

        let notifier = (self.connect)(&self.settings.api_url, credentials.clone());
        let attachment = if self.settings.attach_log {
            state.log_file.as_deref()
        } else {
            None
        };

        if deliver(notifier.as_ref(), &report.message(&self.host), attachment) {
            Ok(Completion::Applied)
        } else {
            Err(StepError::Message("scan notification was not delivered".into()))
        }
    }

    fn prune(&self, exec: &dyn Executor) -> Result<Completion, StepError> {
        // INVARIANT: Logs written through sudo are owned by root.
        let removed = if self.state.borrow().sudo {
            prune_logs_elevated(exec, &self.settings.log_dir, self.settings.retention_days)?
        } else {
            prune_logs(
                &self.settings.log_dir,
                self.settings.retention_days,
                SystemTime::now(),
            )?
        };
        if removed.is_empty() {
            return Ok(Completion::AlreadySatisfied);
        }

        info!("pruned {} old scan log(s)", removed.len());
        Ok(Completion::Applied)
    }
}

impl Debug for ScanPipeline<'_> {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("ScanPipeline")
            .field("source", &self.source)
            .field("notify", &self.notify)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}
