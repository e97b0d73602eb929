// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! ClamAV scanning and scan report parsing.
//!
//! A scan runs in independent stages: run the scanner, parse its output into a
//! [`ScanReport`], hand the report to a notifier, and prune old scan logs.
//! Failure in a later stage never invalidates an earlier one.
//!
//! # Output Parsing
//!
//! Scanner output differs between `clamscan` and `clamdscan`, and between
//! verbosity levels. Parsing is best-effort: each metric is tried against
//! several known phrasings, and missing metrics stay `None`. The infected
//! count is the one exception. It is always the exact number of lines that
//! contain `FOUND`.

use crate::exec::{CommandLine, Executor};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{read_to_string, remove_file},
    path::{Path, PathBuf},
    sync::LazyLock,
    time::{Duration, SystemTime},
};
use tracing::{debug, info, instrument, warn};

/// Default number of days to keep scan logs.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Maximum number of infected paths listed in a message.
const MAX_LISTED_PATHS: usize = 20;

/// Scanner frontend to use.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scanner {
    /// Standalone scanner, loads its own signature database.
    #[default]
    Clamscan,

    /// Client of running clamd daemon.
    Clamdscan,
}

impl Scanner {
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Clamscan => "clamscan",
            Self::Clamdscan => "clamdscan",
        }
    }

    /// Command that scans targets recursively, logging to target log file.
    pub fn command(&self, targets: &[PathBuf], log_file: &Path) -> CommandLine {
        let log = format!("--log={}", log_file.display());
        let command = CommandLine::new(self.binary());
        let command = match self {
            Self::Clamscan => command.args(["-r", "-i"]).arg(log),
            Self::Clamdscan => command.args(["--multiscan", "--fdpass", "-i"]).arg(log),
        };

        command.args(targets.iter().map(|target| target.display().to_string()))
    }
}

impl Display for Scanner {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.binary())
    }
}

/// Parsed scan outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    /// Number of scanned files, if reported.
    pub files: Option<u64>,

    /// Number of scanned directories, if reported.
    pub directories: Option<u64>,

    /// Number of infected files.
    pub infected: u64,

    /// Paths reported as infected.
    pub infected_paths: Vec<String>,

    /// Amount of data scanned, as printed by scanner.
    pub data_scanned: Option<String>,

    /// Wall time of scan, if reported.
    pub duration: Option<Duration>,

    /// When scan finished.
    pub timestamp: DateTime<Local>,
}

static SCANNED_FILES: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?m)^\s*Scanned files:\s*(\d+)").expect("valid regex"),
        Regex::new(r"(?mi)^\s*(?:files scanned:\s*(\d+)|(\d+)\s+files? scanned)").expect("valid regex"),
    ]
});

static SCANNED_DIRS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?m)^\s*Scanned directories:\s*(\d+)").expect("valid regex"),
        Regex::new(r"(?mi)^\s*(?:directories scanned:\s*(\d+)|(\d+)\s+director(?:y|ies) scanned)")
            .expect("valid regex"),
    ]
});

static SECONDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Time:\s*([\d.]+)\s*sec").expect("valid regex"));

static MINUTES_SECONDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Time:.*?(\d+)\s*m\s*(\d+)\s*s").expect("valid regex"));

static DATA_SCANNED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Data scanned:\s*(\S+(?:\s*[KMGT]?i?B)?)").expect("valid regex"));

static END_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*End Date:\s*(\d{4}:\d{2}:\d{2} \d{2}:\d{2}:\d{2})").expect("valid regex")
});

impl ScanReport {
    /// Parse scanner output.
    ///
    /// Uses `fallback_time` as timestamp if output carries no end date.
    pub fn parse(output: &str, fallback_time: DateTime<Local>) -> Self {
        let infected_paths: Vec<String> = output
            .lines()
            .filter(|line| line.contains("FOUND"))
            .map(|line| match line.rsplit_once(": ") {
                Some((path, _)) => path.trim().to_string(),
                None => line.trim().to_string(),
            })
            .collect();

        Self {
            files: first_count(SCANNED_FILES.as_slice(), output),
            directories: first_count(SCANNED_DIRS.as_slice(), output),
            infected: infected_paths.len() as u64,
            infected_paths,
            data_scanned: DATA_SCANNED
                .captures(output)
                .map(|caps| caps[1].trim().to_string()),
            duration: parse_duration(output),
            timestamp: parse_end_date(output).unwrap_or(fallback_time),
        }
    }

    /// Read and parse scan log file.
    ///
    /// # Errors
    ///
    /// - Return [`ScanError::ReadLog`] if log cannot be read.
    pub fn from_log(path: impl AsRef<Path>, fallback_time: DateTime<Local>) -> Result<Self> {
        let output = read_to_string(path.as_ref()).map_err(|err| ScanError::ReadLog {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;

        Ok(Self::parse(&output, fallback_time))
    }

    pub fn is_clean(&self) -> bool {
        self.infected == 0
    }

    /// Human readable notification message.
    pub fn message(&self, host: &str) -> String {
        let mut message = if self.is_clean() {
            format!("✅ ClamAV scan clean on {host}\n")
        } else {
            format!("🚨 ClamAV found {} infected file(s) on {host}\n", self.infected)
        };

        message.push_str(format!("Finished: {}\n", self.timestamp.format("%Y-%m-%d %H:%M:%S")).as_str());
        match (self.files, self.directories) {
            (Some(files), Some(dirs)) => {
                message.push_str(format!("Scanned: {files} files in {dirs} directories\n").as_str())
            }
            (Some(files), None) => message.push_str(format!("Scanned: {files} files\n").as_str()),
            (None, Some(dirs)) => message.push_str(format!("Scanned: {dirs} directories\n").as_str()),
            (None, None) => {}
        }
        if let Some(data) = &self.data_scanned {
            message.push_str(format!("Data: {data}\n").as_str());
        }
        if let Some(duration) = self.duration {
            message.push_str(format!("Duration: {}s\n", duration.as_secs()).as_str());
        }

        if !self.is_clean() {
            message.push_str("Infected:\n");
            for path in self.infected_paths.iter().take(MAX_LISTED_PATHS) {
                message.push_str(format!("- {path}\n").as_str());
            }
            if self.infected_paths.len() > MAX_LISTED_PATHS {
                let rest = self.infected_paths.len() - MAX_LISTED_PATHS;
                message.push_str(format!("... and {rest} more\n").as_str());
            }
        }

        message.trim_end().to_string()
    }
}

fn first_count(patterns: &[Regex], output: &str) -> Option<u64> {
    patterns.iter().find_map(|pattern| {
        pattern.captures(output).and_then(|caps| {
            caps.iter()
                .skip(1)
                .flatten()
                .find_map(|found| found.as_str().parse().ok())
        })
    })
}

fn parse_duration(output: &str) -> Option<Duration> {
    if let Some(caps) = SECONDS.captures(output) {
        if let Ok(seconds) = caps[1].parse::<f64>() {
            return Duration::try_from_secs_f64(seconds).ok();
        }
    }

    MINUTES_SECONDS.captures(output).and_then(|caps| {
        let minutes: u64 = caps[1].parse().ok()?;
        let seconds: u64 = caps[2].parse().ok()?;
        minutes
            .checked_mul(60)
            .and_then(|total| total.checked_add(seconds))
            .map(Duration::from_secs)
    })
}

fn parse_end_date(output: &str) -> Option<DateTime<Local>> {
    let caps = END_DATE.captures(output)?;
    let naive = NaiveDateTime::parse_from_str(&caps[1], "%Y:%m:%d %H:%M:%S").ok()?;
    Local.from_local_datetime(&naive).earliest()
}

/// Path of log file for a scan started at target time.
pub fn log_file_path(log_dir: &Path, started: DateTime<Local>) -> PathBuf {
    log_dir.join(format!("scan-{}.log", started.format("%Y%m%d-%H%M%S")))
}

/// Create log directory if missing.
///
/// With `sudo` set the directory is created through `sudo mkdir -p`, since the
/// default log directory lives under `/var/log`.
///
/// # Errors
///
/// - Return [`ScanError::CreateLogDir`] if directory cannot be created.
/// - Return [`ScanError::Exec`] if elevated `mkdir` fails.
pub fn prepare_log_dir(executor: &dyn Executor, log_dir: &Path, sudo: bool) -> Result<()> {
    if sudo {
        let command = CommandLine::new("mkdir")
            .arg("-p")
            .arg(log_dir.display().to_string())
            .elevate(true);
        executor.run(&command)?;
        return Ok(());
    }

    mkdirp::mkdirp(log_dir).map_err(|err| ScanError::CreateLogDir {
        source: err,
        path: log_dir.to_path_buf(),
    })?;

    Ok(())
}

/// Run scanner against targets.
///
/// Exit code 1 means infected files were found, which is not a failure.
/// Returns the scanner's stdout.
///
/// # Errors
///
/// - Return [`ScanError::Exec`] if scanner cannot be started.
/// - Return [`ScanError::ScannerFailed`] if scanner reports an error.
#[instrument(skip(executor, targets), level = "debug")]
pub fn run_scan(
    executor: &dyn Executor,
    scanner: Scanner,
    targets: &[PathBuf],
    log_file: &Path,
    sudo: bool,
) -> Result<String> {
    info!("scan {} target(s) with {scanner}", targets.len());
    let command = scanner.command(targets, log_file).elevate(sudo);
    let output = executor.output(&command)?;
    match output.code {
        Some(0) => debug!("scan finished clean"),
        Some(1) => warn!("scan found infected files"),
        code => {
            return Err(ScanError::ScannerFailed {
                code,
                message: output.message(),
            })
        }
    }

    Ok(output.stdout)
}

/// Remove `*.log` files in target directory older than retention period.
///
/// Returns removed paths. Files that cannot be inspected or removed are
/// skipped with a warning.
///
/// # Errors
///
/// - Return [`ScanError::Pattern`] if log directory makes an invalid glob.
#[instrument(level = "debug")]
pub fn prune_logs(log_dir: &Path, retention_days: u32, now: SystemTime) -> Result<Vec<PathBuf>> {
    let retention = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
    let cutoff = now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH);
    let pattern = Path::new(&glob::Pattern::escape(&log_dir.to_string_lossy())).join("*.log");

    let mut removed = Vec::new();
    for entry in glob::glob(&pattern.to_string_lossy())? {
        let path = match entry {
            Ok(path) => path,
            Err(err) => {
                warn!("cannot inspect scan log: {err}");
                continue;
            }
        };

        let modified = match path.metadata().and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                warn!("cannot read age of {:?}: {err}", path.display());
                continue;
            }
        };

        if modified < cutoff {
            match remove_file(&path) {
                Ok(()) => {
                    debug!("prune {:?}", path.display());
                    removed.push(path);
                }
                Err(err) => warn!("cannot remove {:?}: {err}", path.display()),
            }
        }
    }

    Ok(removed)
}

/// Remove `*.log` files older than retention period through `sudo find`.
///
/// Used when scan logs are owned by root. Returns removed paths as reported
/// by `find`.
///
/// # Errors
///
/// - Return [`ScanError::Exec`] if `find` fails.
#[instrument(skip(executor), level = "debug")]
pub fn prune_logs_elevated(
    executor: &dyn Executor,
    log_dir: &Path,
    retention_days: u32,
) -> Result<Vec<PathBuf>> {
    let minutes = u64::from(retention_days) * 24 * 60;
    let command = CommandLine::new("find")
        .arg(log_dir.display().to_string())
        .args(["-maxdepth", "1", "-type", "f", "-name", "*.log"])
        .arg("-mmin")
        .arg(format!("+{minutes}"))
        .args(["-print", "-delete"])
        .elevate(true);
    let stdout = executor.run(&command)?;

    Ok(stdout
        .lines()
        .map(PathBuf::from)
        .filter(|path| path.starts_with(log_dir))
        .collect())
}

/// Scan error types.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Scanner could not be started.
    #[error(transparent)]
    Exec(#[from] crate::exec::ExecError),

    /// Scanner exited with an error code.
    #[error("scanner failed with exit code {code:?}: {message}")]
    ScannerFailed { code: Option<i32>, message: String },

    /// Scan log could not be read.
    #[error("failed to read scan log at {:?}", path.display())]
    ReadLog {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Log directory could not be created.
    #[error("failed to create log directory at {:?}", path.display())]
    CreateLogDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Log directory produced invalid glob pattern.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

/// Friendly result alias :3
pub type Result<T, E = ScanError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{fake::FakeExecutor, CommandOutput};
    use indoc::indoc;
    use simple_test_case::test_case;
    use std::fs::File;

    const CLAMSCAN_INFECTED: &str = indoc! {"
        /home/user/Downloads/eicar.com: Win.Test.EICAR_HDB-1 FOUND
        /home/user/Downloads/eicar.zip: Win.Test.EICAR_HDB-1 FOUND

        ----------- SCAN SUMMARY -----------
        Known viruses: 8697458
        Engine version: 1.0.1
        Scanned directories: 12
        Scanned files: 345
        Infected files: 2
        Data scanned: 12.34 MB
        Data read: 10.00 MB (ratio 1.23:1)
        Time: 19.539 sec (0 m 19 s)
        Start Date: 2024:01:15 10:00:01
        End Date:   2024:01:15 10:00:20
    "};

    const CLAMDSCAN_CLEAN: &str = indoc! {"
        ----------- SCAN SUMMARY -----------
        Infected files: 0
        Time: 0 m 42 s
        Start Date: 2024:01:15 10:00:01
        End Date:   2024:01:15 10:00:43
    "};

    fn fallback() -> DateTime<Local> {
        Local.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
    }

    fn found_lines(count: usize) -> String {
        let mut output = String::new();
        for index in 0..count {
            output.push_str(format!("/srv/file{index}: Eicar-Signature FOUND\n").as_str());
        }
        output.push_str("Infected files: 0\nScanned files: 10\n");
        output
    }

    #[test_case(0; "none")]
    #[test_case(1; "one")]
    #[test_case(57; "many")]
    #[test]
    fn infected_count_matches_found_lines(count: usize) {
        let report = ScanReport::parse(&found_lines(count), fallback());
        assert_eq!(report.infected, count as u64);
        assert_eq!(report.infected_paths.len(), count);
        assert_eq!(report.files, Some(10));
    }

    #[test]
    fn parse_clamscan_summary() {
        let report = ScanReport::parse(CLAMSCAN_INFECTED, fallback());
        let expect = ScanReport {
            files: Some(345),
            directories: Some(12),
            infected: 2,
            infected_paths: vec![
                "/home/user/Downloads/eicar.com".into(),
                "/home/user/Downloads/eicar.zip".into(),
            ],
            data_scanned: Some("12.34 MB".into()),
            duration: Some(Duration::from_millis(19_539)),
            timestamp: Local.with_ymd_and_hms(2024, 1, 15, 10, 0, 20).unwrap(),
        };
        assert_eq!(report, expect);
    }

    #[test]
    fn parse_clamdscan_fallbacks() {
        let output = format!("{CLAMDSCAN_CLEAN}3 directories scanned\n1200 files scanned\n");
        let report = ScanReport::parse(&output, fallback());

        assert!(report.is_clean());
        assert_eq!(report.files, Some(1200));
        assert_eq!(report.directories, Some(3));
        assert_eq!(report.duration, Some(Duration::from_secs(42)));
        assert_eq!(report.data_scanned, None);
    }

    #[test]
    fn parse_without_summary_uses_fallback_time() {
        let report = ScanReport::parse("", fallback());
        assert_eq!(report.timestamp, fallback());
        assert_eq!(report.files, None);
        assert!(report.is_clean());
    }

    #[test]
    fn clean_message() {
        let report = ScanReport::parse(CLAMDSCAN_CLEAN, fallback());
        let expect = indoc! {"
            ✅ ClamAV scan clean on box
            Finished: 2024-01-15 10:00:43
            Duration: 42s"};
        assert_eq!(report.message("box"), expect);
    }

    #[test]
    fn infected_message() {
        let report = ScanReport::parse(CLAMSCAN_INFECTED, fallback());
        let expect = indoc! {"
            🚨 ClamAV found 2 infected file(s) on box
            Finished: 2024-01-15 10:00:20
            Scanned: 345 files in 12 directories
            Data: 12.34 MB
            Duration: 19s
            Infected:
            - /home/user/Downloads/eicar.com
            - /home/user/Downloads/eicar.zip"};
        assert_eq!(report.message("box"), expect);
    }

    #[test]
    fn infected_message_truncates_paths() {
        let report = ScanReport::parse(&found_lines(25), fallback());
        let message = report.message("box");
        assert!(message.contains("- /srv/file19\n"));
        assert!(!message.contains("/srv/file20"));
        assert!(message.ends_with("... and 5 more"));
    }

    #[test]
    fn scanner_commands() {
        let targets = vec![PathBuf::from("/home"), PathBuf::from("/srv")];
        let log = Path::new("/var/log/hostprep/scan.log");
        assert_eq!(
            Scanner::Clamscan.command(&targets, log).to_string(),
            "clamscan -r -i --log=/var/log/hostprep/scan.log /home /srv"
        );
        assert_eq!(
            Scanner::Clamdscan.command(&targets, log).to_string(),
            "clamdscan --multiscan --fdpass -i --log=/var/log/hostprep/scan.log /home /srv"
        );
    }

    #[test]
    fn run_scan_accepts_infected_exit_code() -> anyhow::Result<()> {
        let targets = vec![PathBuf::from("/home")];
        let log = Path::new("/tmp/scan.log");
        let command = Scanner::Clamscan.command(&targets, log).to_string();
        let exec = FakeExecutor::new().respond(
            &command,
            CommandOutput {
                code: Some(1),
                stdout: "/home/x: Eicar FOUND\n".into(),
                stderr: String::new(),
            },
        );

        let stdout = run_scan(&exec, Scanner::Clamscan, &targets, log, false)?;
        assert_eq!(stdout, "/home/x: Eicar FOUND\n");
        Ok(())
    }

    #[test]
    fn run_scan_rejects_scanner_error() {
        let targets = vec![PathBuf::from("/home")];
        let log = Path::new("/tmp/scan.log");
        let command = Scanner::Clamscan.command(&targets, log).elevate(true).to_string();
        let exec = FakeExecutor::new().respond(&command, CommandOutput::failed(2, "no database"));

        let result = run_scan(&exec, Scanner::Clamscan, &targets, log, true);
        assert!(matches!(result, Err(ScanError::ScannerFailed { code: Some(2), .. })));
    }

    #[test]
    fn prune_removes_only_old_logs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let now = SystemTime::now();
        let day = Duration::from_secs(24 * 60 * 60);

        let old = dir.path().join("scan-old.log");
        let fresh = dir.path().join("scan-fresh.log");
        let other = dir.path().join("notes.txt");
        File::create(&old)?.set_modified(now - day * 31)?;
        File::create(&fresh)?.set_modified(now - day * 2)?;
        File::create(&other)?.set_modified(now - day * 90)?;

        let removed = prune_logs(dir.path(), DEFAULT_RETENTION_DAYS, now)?;

        assert_eq!(removed, vec![old.clone()]);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
        Ok(())
    }

    #[test]
    fn prune_handles_glob_characters_in_log_dir() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let dir = root.path().join("logs[1]");
        std::fs::create_dir(&dir)?;
        let sibling = root.path().join("logs1");
        std::fs::create_dir(&sibling)?;
        let now = SystemTime::now();
        let day = Duration::from_secs(24 * 60 * 60);

        let old = dir.join("scan-old.log");
        let decoy = sibling.join("scan-old.log");
        File::create(&old)?.set_modified(now - day * 31)?;
        File::create(&decoy)?.set_modified(now - day * 31)?;

        let removed = prune_logs(&dir, DEFAULT_RETENTION_DAYS, now)?;

        assert_eq!(removed, vec![old.clone()]);
        assert!(!old.exists());
        assert!(decoy.exists());
        Ok(())
    }

    #[test]
    fn elevated_prune_goes_through_find() -> anyhow::Result<()> {
        let command = "sudo find /var/log/hostprep -maxdepth 1 -type f -name *.log -mmin +43200 -print -delete";
        let exec = FakeExecutor::new().respond(
            command,
            CommandOutput::ok("/var/log/hostprep/scan-old.log\n"),
        );

        let removed = prune_logs_elevated(&exec, Path::new("/var/log/hostprep"), DEFAULT_RETENTION_DAYS)?;

        assert_eq!(removed, vec![PathBuf::from("/var/log/hostprep/scan-old.log")]);
        assert_eq!(exec.calls(), vec![command.to_string()]);
        Ok(())
    }

    #[test]
    fn elevated_log_dir_goes_through_executor() -> anyhow::Result<()> {
        let exec = FakeExecutor::new();
        prepare_log_dir(&exec, Path::new("/var/log/hostprep"), true)?;
        assert_eq!(exec.calls(), vec!["sudo mkdir -p /var/log/hostprep".to_string()]);
        Ok(())
    }

    #[test]
    fn oversized_duration_is_dropped() {
        let report = ScanReport::parse("Time: 999999999999999999 m 0 s\n", fallback());
        assert_eq!(report.duration, None);
    }

    #[test]
    fn log_file_name_carries_timestamp() {
        let started = Local.with_ymd_and_hms(2024, 1, 15, 3, 4, 5).unwrap();
        assert_eq!(
            log_file_path(Path::new("/var/log/hostprep"), started),
            PathBuf::from("/var/log/hostprep/scan-20240115-030405.log")
        );
    }
}
