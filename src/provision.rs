// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Provisioning step assembly.
//!
//! Turn configuration plus detected distro profile into the ordered list of
//! named steps the [`Runner`](crate::runner::Runner) executes:
//!
//! 1. `preflight:privilege` and `preflight:commands` (fatal).
//! 2. `repo:<name>` for each extra repository.
//! 3. `packages:refresh`, then `package:<name>` for each package.
//! 4. `service:<name>` for each service.
//! 5. `dotfiles:<name>` for each configured dotfile repository.
//! 6. `firewall:defaults`, `firewall:<rule>`, `firewall:enable`.
//!
//! Everything after preflight is best effort. An unsupported distro is
//! rejected by [`run`] before any step exists.

use crate::{
    config::{Config, Dotfile},
    distro::{detect_from_path, DistroError, OsRelease},
    dotfiles::install_dotfile,
    exec::{CommandLine, Executor},
    firewall::{default_policy_commands, enable_command, FirewallRule},
    plan::{DistroProfile, ExtraRepository},
    preflight::{require_commands, resolve_privilege, Privilege},
    runner::{Completion, RunError, RunReport, Runner, RunnerSettings, Step, StepError},
};

use chrono::Local;
use indicatif::ProgressBar;
use std::cell::Cell;
use tracing::{debug, info, instrument};

/// Detect distro family from configured OS-release file and look up its
/// profile.
///
/// # Errors
///
/// - Return [`DistroError`] if OS-release file cannot be read, or names an
///   unsupported distro.
pub fn detect_profile(config: &Config) -> Result<(OsRelease, &'static DistroProfile), DistroError> {
    let (os_release, family) = detect_from_path(&config.settings.os_release)?;
    info!("detected {family} family");

    Ok((os_release, DistroProfile::for_family(family)?))
}

/// Provision this host: detect distro, build steps, run them.
///
/// # Errors
///
/// - Return [`ProvisionError::Distro`] if distro cannot be detected. Nothing
///   is executed in that case.
/// - Return [`ProvisionError::Run`] if a step fails fatally.
#[instrument(skip_all, level = "debug")]
pub fn run(
    config: &Config,
    executor: &dyn Executor,
    settings: RunnerSettings,
    is_root: bool,
) -> Result<RunReport, ProvisionError> {
    let (os_release, profile) = detect_profile(config)?;
    let provisioner =
        Provisioner::new(config, &os_release, profile, is_root).with_progress(settings.progress);
    let report = Runner::new(executor, settings).run(provisioner.steps())?;

    Ok(report)
}

/// Builds provisioning steps for one host.
#[derive(Debug)]
pub struct Provisioner<'a> {
    config: &'a Config,
    os_release: &'a OsRelease,
    profile: &'static DistroProfile,
    is_root: bool,
    progress: bool,
    privilege: Cell<Privilege>,
}

impl<'a> Provisioner<'a> {
    /// Construct new provisioner.
    ///
    /// Privilege is settled by the `preflight:privilege` step at run time.
    /// Until then commands are assumed to run as root.
    pub fn new(
        config: &'a Config,
        os_release: &'a OsRelease,
        profile: &'static DistroProfile,
        is_root: bool,
    ) -> Self {
        Self {
            config,
            os_release,
            profile,
            is_root,
            progress: false,
            privilege: Cell::new(Privilege::Root),
        }
    }

    /// Show clone progress bars for dotfile steps.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Final package list for this host.
    pub fn packages(&self) -> Vec<String> {
        self.profile.package_list(
            &self.config.settings.extra_packages,
            &self.config.settings.skip_packages,
        )
    }

    /// Ordered provisioning steps.
    pub fn steps(&self) -> Vec<Step<'_>> {
        let mut steps = vec![
            Step::fatal("preflight:privilege", move |exec| self.check_privilege(exec)),
            Step::fatal("preflight:commands", move |exec| self.check_commands(exec)),
        ];

        for repository in self.profile.repositories {
            steps.push(Step::best_effort(
                format!("repo:{}", repository.name),
                move |exec| self.add_repository(exec, repository),
            ));
        }

        steps.push(Step::best_effort("packages:refresh", move |exec| {
            exec.run_interactive(&self.elevate(self.profile.manager.refresh()))?;
            Ok(Completion::Applied)
        }));

        for package in self.packages() {
            steps.push(Step::best_effort(format!("package:{package}"), move |exec| {
                self.install_package(exec, &package)
            }));
        }

        for service in self.profile.services {
            steps.push(Step::best_effort(format!("service:{service}"), move |exec| {
                for command in self.profile.service_manager.enable(service) {
                    exec.run(&self.elevate(command))?;
                }
                Ok(Completion::Applied)
            }));
        }

        for dotfile in &self.config.dotfiles {
            steps.push(Step::best_effort(format!("dotfiles:{}", dotfile.name), move |_| {
                self.install_dotfile(dotfile)
            }));
        }

        if self.config.firewall.enabled {
            steps.push(Step::best_effort("firewall:defaults", move |exec| {
                for command in default_policy_commands() {
                    exec.run(&self.elevate(command))?;
                }
                Ok(Completion::Applied)
            }));

            for rule in &self.config.firewall.rules {
                steps.push(Step::best_effort(format!("firewall:{}", rule.label()), move |exec| {
                    self.apply_rule(exec, rule)
                }));
            }

            steps.push(Step::best_effort("firewall:enable", move |exec| {
                exec.run(&self.elevate(enable_command()))?;
                Ok(Completion::Applied)
            }));
        }

        steps
    }

    fn elevate(&self, command: CommandLine) -> CommandLine {
        command.elevate(self.privilege.get().needs_sudo())
    }

    fn check_privilege(&self, exec: &dyn Executor) -> Result<Completion, StepError> {
        let privilege = resolve_privilege(self.is_root, self.config.settings.use_sudo, exec)?;
        self.privilege.set(privilege);
        Ok(Completion::AlreadySatisfied)
    }

    fn check_commands(&self, exec: &dyn Executor) -> Result<Completion, StepError> {
        require_commands(
            exec,
            [
                self.profile.manager.binary(),
                self.profile.service_manager.binary(),
            ],
        )?;
        Ok(Completion::AlreadySatisfied)
    }

    fn add_repository(
        &self,
        exec: &dyn Executor,
        repository: &ExtraRepository,
    ) -> Result<Completion, StepError> {
        let commands = repository.setup_commands(self.profile.manager, self.os_release)?;
        let mut refreshed = false;
        for command in commands {
            // INVARIANT: Fetch tools are bootstrapped through the package manager.
            if !exec.has_command(command.program()) {
                info!("install missing {} for repository setup", command.program());
                if !refreshed {
                    exec.run_interactive(&self.elevate(self.profile.manager.refresh()))?;
                    refreshed = true;
                }
                exec.run(&self.elevate(self.profile.manager.install(command.program())))?;
            }
            exec.run(&self.elevate(command))?;
        }

        Ok(Completion::Applied)
    }

    fn install_package(&self, exec: &dyn Executor, package: &str) -> Result<Completion, StepError> {
        if exec.output(&self.profile.manager.query(package))?.success() {
            debug!("{package} already installed");
            return Ok(Completion::AlreadySatisfied);
        }

        exec.run_interactive(&self.elevate(self.profile.manager.install(package)))?;
        Ok(Completion::Applied)
    }

    fn install_dotfile(&self, dotfile: &Dotfile) -> Result<Completion, StepError> {
        let bar = if self.progress {
            ProgressBar::no_length()
        } else {
            ProgressBar::hidden()
        };

        let outcome = install_dotfile(dotfile, Local::now(), bar)?;
        if let Some(backup) = outcome.backup {
            info!("previous {:?} kept at {:?}", outcome.target.display(), backup.display());
        }

        Ok(Completion::Applied)
    }

    fn apply_rule(&self, exec: &dyn Executor, rule: &FirewallRule) -> Result<Completion, StepError> {
        exec.run(&self.elevate(rule.to_command()?))?;
        Ok(Completion::Applied)
    }
}

/// Provisioning error types.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Distro could not be detected or is unsupported.
    #[error(transparent)]
    Distro(#[from] DistroError),

    /// Step runner stopped.
    #[error(transparent)]
    Run(#[from] RunError),
}
