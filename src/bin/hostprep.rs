// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use hostprep::{
    config::Config,
    distro::detect_from_path,
    exec::SystemExecutor,
    notify::host_name,
    path::{default_config_path, default_credentials_path},
    pipeline::{ScanPipeline, ScanSource},
    plan::DistroProfile,
    preflight::is_root,
    provision::{self, detect_profile, ProvisionError, Provisioner},
    runner::{RunError, RunReport, Runner, RunnerSettings, Step},
};

use anyhow::{bail, Error, Result};
use clap::{Parser, Subcommand};
use std::{
    path::{Path, PathBuf},
    process::exit,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "hostprep [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Path to OS-release file, overrides configuration.
    #[arg(long, global = true, value_name = "path")]
    pub os_release: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let config_path = match self.config {
            Some(path) => path,
            None => default_config_path()?,
        };

        let load = |os_release: Option<PathBuf>| -> Result<Config> {
            let mut config = Config::load(&config_path)?;
            if let Some(os_release) = os_release {
                config.settings.os_release = os_release;
            }
            Ok(config)
        };

        match self.command {
            Command::Detect => run_detect(&load(self.os_release)?),
            Command::Plan => run_plan(&load(self.os_release)?),
            Command::Provision(opts) => run_provision(&load(self.os_release)?, opts),
            Command::Scan(opts) => run_scan(&load(self.os_release)?, opts),
            Command::Init(opts) => run_init(&config_path, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Show detected distro family.
    #[command(override_usage = "hostprep detect [options]")]
    Detect,

    /// List provisioning steps without running them.
    #[command(override_usage = "hostprep plan [options]")]
    Plan,

    /// Provision this host.
    #[command(override_usage = "hostprep provision [options]")]
    Provision(ProvisionOptions),

    /// Run malware scan and report result.
    #[command(override_usage = "hostprep scan [options]")]
    Scan(ScanOptions),

    /// Write default configuration file.
    #[command(override_usage = "hostprep init [options]")]
    Init(InitOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ProvisionOptions {
    /// Only list steps that would run.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Treat every failed step as fatal.
    #[arg(long)]
    pub fail_fast: bool,

    /// Draw progress bar over steps.
    #[arg(long)]
    pub progress: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ScanOptions {
    /// Parse existing scan log instead of running the scanner.
    #[arg(long, value_name = "file")]
    pub from_log: Option<PathBuf>,

    /// Do not send notification.
    #[arg(long)]
    pub no_notify: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Overwrite existing configuration.
    #[arg(short, long)]
    pub force: bool,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_default();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = Cli::parse().run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run_init(path: &Path, opts: InitOptions) -> Result<()> {
    if path.exists() && !opts.force {
        bail!("configuration already exists at {:?}, use --force to overwrite", path.display());
    }

    Config::default().save(path)?;
    info!("wrote default configuration to {:?}", path.display());

    Ok(())
}

fn run_detect(config: &Config) -> Result<()> {
    let (os_release, family) = detect_from_path(&config.settings.os_release)?;
    let profile = DistroProfile::for_family(family)?;

    println!("{}", os_release.pretty_name().unwrap_or(family.as_str()));
    println!("family: {family}");
    println!("package manager: {}", profile.manager);

    Ok(())
}

fn run_plan(config: &Config) -> Result<()> {
    let (os_release, profile) = detect_profile(config)?;
    let provisioner = Provisioner::new(config, &os_release, profile, is_root());
    print_steps(&provisioner.steps(), &config.settings.skip_steps);

    Ok(())
}

fn run_provision(config: &Config, opts: ProvisionOptions) -> Result<()> {
    if opts.dry_run {
        return run_plan(config);
    }

    let executor = SystemExecutor::new();
    let settings = RunnerSettings {
        fail_fast: opts.fail_fast,
        progress: opts.progress,
        skip: config.settings.skip_steps.clone(),
    };
    let result = match provision::run(config, &executor, settings, is_root()) {
        Ok(report) => Ok(report),
        Err(ProvisionError::Run(error)) => Err(error),
        Err(error) => return Err(error.into()),
    };
    let report = finish(result)?;
    if !report.is_clean() {
        warn!("some steps need manual follow-up");
    }

    Ok(())
}

fn run_scan(config: &Config, opts: ScanOptions) -> Result<()> {
    let credentials = match &config.settings.credentials {
        Some(path) => path.clone(),
        None => default_credentials_path()?,
    };
    let source = match opts.from_log {
        Some(path) => ScanSource::Log(path),
        None => ScanSource::Run,
    };

    let pipeline = ScanPipeline::new(&config.scan, source, credentials, host_name())
        .with_notify(config.scan.notify && !opts.no_notify)
        .with_privilege(is_root(), config.settings.use_sudo);

    let executor = SystemExecutor::new();
    let runner = Runner::new(&executor, RunnerSettings::default());
    finish(runner.run(pipeline.steps()))?;

    if let Some(report) = pipeline.report() {
        println!("{}", report.message(&host_name()));
    }

    Ok(())
}

fn print_steps(steps: &[Step<'_>], skip: &[String]) {
    for (index, step) in steps.iter().enumerate() {
        let note = if skip.iter().any(|name| name == step.name()) {
            " (skipped)"
        } else {
            ""
        };
        println!("{:>3}. {} [{}]{note}", index + 1, step.name(), step.criticality());
    }
}

fn finish(result: Result<RunReport, RunError>) -> Result<RunReport> {
    match result {
        Ok(report) => {
            print!("{report}");
            Ok(report)
        }
        Err(RunError::Fatal {
            step,
            source,
            report,
        }) => {
            print!("{report}");
            Err(Error::new(source).context(format!("fatal failure in step {step:?}")))
        }
        Err(error) => Err(error.into()),
    }
}
