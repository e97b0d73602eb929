// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{RecordingExecutor, RepoFixture};

use hostprep::{
    config::{Config, Dotfile, ScanSettings},
    distro::detect_from_path,
    dotfiles::install_dotfile,
    pipeline::{ScanPipeline, ScanSource},
    plan::DistroProfile,
    provision::Provisioner,
    runner::{Runner, RunnerSettings, StepStatus},
};

use anyhow::Result;
use chrono::Local;
use indicatif::ProgressBar;
use indoc::{formatdoc, indoc};
use pretty_assertions::assert_eq;
use std::{
    fs::{create_dir_all, read_dir, read_to_string, write, File},
    time::{Duration, SystemTime},
};

#[test]
fn clone_twice_keeps_original_as_backup() -> Result<()> {
    let root = tempfile::tempdir()?;
    let fixture = RepoFixture::new(root.path().join("fish.git"))?;
    fixture.stage_and_commit("config.fish", "set -g fish_greeting\n")?;

    let home = root.path().join("home");
    let target = home.join(".config").join("fish");
    create_dir_all(&target)?;
    write(target.join("config.fish"), "# hand written\n")?;

    let dotfile = Dotfile {
        name: "fish".into(),
        url: fixture.url(),
        target: target.clone(),
        branch: None,
    };
    let now = Local::now();
    let first = install_dotfile(&dotfile, now, ProgressBar::hidden())?;
    let second = install_dotfile(&dotfile, now, ProgressBar::hidden())?;

    let mut entries: Vec<String> = read_dir(home.join(".config"))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();

    assert_eq!(entries.iter().filter(|name| *name == "fish").count(), 1);
    assert_eq!(
        entries
            .iter()
            .filter(|name| name.starts_with("fish.bak."))
            .count(),
        2
    );
    assert_eq!(read_to_string(target.join("config.fish"))?, "set -g fish_greeting\n");

    let (Some(first_backup), Some(second_backup)) = (first.backup, second.backup) else {
        panic!("both runs should have backed up existing target");
    };
    assert!(first_backup < second_backup);
    assert_eq!(read_to_string(first_backup.join("config.fish"))?, "# hand written\n");

    Ok(())
}

#[test]
fn clone_selected_branch() -> Result<()> {
    let root = tempfile::tempdir()?;
    let fixture = RepoFixture::new(root.path().join("nvim.git"))?;
    fixture.stage_and_commit("init.lua", "-- main\n")?;
    fixture.commit_on_branch("experimental", "plugins.lua", "-- experimental\n")?;

    let target = root.path().join("home").join(".config").join("nvim");
    let dotfile = Dotfile {
        name: "nvim".into(),
        url: fixture.url(),
        target: target.clone(),
        branch: Some("experimental".into()),
    };
    let outcome = install_dotfile(&dotfile, Local::now(), ProgressBar::hidden())?;

    assert_eq!(outcome.backup, None);
    assert_eq!(read_to_string(target.join("plugins.lua"))?, "-- experimental\n");

    Ok(())
}

#[test]
fn provision_fedora_host() -> Result<()> {
    let root = tempfile::tempdir()?;
    let fixture = RepoFixture::new(root.path().join("fish.git"))?;
    fixture.stage_and_commit("config.fish", "set -g fish_greeting\n")?;

    let os_release = root.path().join("os-release");
    write(
        &os_release,
        indoc! {r#"
            NAME="Fedora Linux"
            ID=fedora
            VERSION_ID=41
            PRETTY_NAME="Fedora Linux 41 (Workstation Edition)"
        "#},
    )?;

    let config: Config = formatdoc!(
        r#"
            [settings]
            os_release = "{}"
            extra_packages = ["zoxide"]

            [[dotfiles]]
            name = "fish"
            url = "{}"
            target = "{}"
        "#,
        os_release.display(),
        fixture.url(),
        root.path().join("home/.config/fish").display(),
    )
    .parse()?;

    let (os_release, family) = detect_from_path(&config.settings.os_release)?;
    let profile = DistroProfile::for_family(family)?;
    let provisioner = Provisioner::new(&config, &os_release, profile, false);
    let exec = RecordingExecutor::new()
        .fail("rpm -q zoxide")
        .fail("sudo systemctl enable --now tlp");

    let report = Runner::new(&exec, RunnerSettings::default()).run(provisioner.steps())?;

    let failed: Vec<&str> = report.failed().map(|result| result.name.as_str()).collect();
    assert_eq!(failed, vec!["service:tlp"]);

    let status = |name: &str| {
        report
            .results
            .iter()
            .find(|result| result.name == name)
            .map(|result| result.status)
    };
    assert_eq!(status("package:zoxide"), Some(StepStatus::Applied));
    assert_eq!(status("package:git"), Some(StepStatus::AlreadySatisfied));
    assert_eq!(status("dotfiles:fish"), Some(StepStatus::Applied));
    assert_eq!(status("firewall:enable"), Some(StepStatus::Applied));

    let calls = exec.calls();
    assert!(calls.contains(&"sudo rpm --import https://pkgs.tailscale.com/stable/fedora/repo.gpg".to_string()));
    assert!(calls.contains(&"sudo dnf install -y zoxide".to_string()));
    assert!(!calls.contains(&"sudo dnf install -y git".to_string()));
    assert!(calls.contains(&"sudo ufw --force enable".to_string()));
    assert!(root.path().join("home/.config/fish/config.fish").is_file());

    Ok(())
}

#[test]
fn scan_existing_log_and_prune() -> Result<()> {
    let root = tempfile::tempdir()?;
    let log_dir = root.path().join("logs");
    create_dir_all(&log_dir)?;

    let stale = log_dir.join("scan-20240101-000000.log");
    write(&stale, "Scanned files: 1\n")?;
    File::options()
        .write(true)
        .open(&stale)?
        .set_modified(SystemTime::now() - Duration::from_secs(60 * 24 * 60 * 60))?;

    let current = log_dir.join("scan-current.log");
    write(
        &current,
        indoc! {"
            /home/blah/a.exe: Win.Trojan.Agent FOUND
            /home/blah/b.exe: Win.Trojan.Agent FOUND

            ----------- SCAN SUMMARY -----------
            Scanned directories: 10
            Scanned files: 200
            Infected files: 2
        "},
    )?;

    let settings = ScanSettings {
        log_dir: log_dir.clone(),
        notify: false,
        ..Default::default()
    };
    let pipeline = ScanPipeline::new(
        &settings,
        ScanSource::Log(current.clone()),
        root.path().join("credentials"),
        "blah",
    );
    let exec = RecordingExecutor::new();
    let report = Runner::new(&exec, RunnerSettings::default()).run(pipeline.steps())?;

    assert_eq!(report.step_names(), vec!["scan:parse", "scan:prune"]);
    let scan = pipeline.report().expect("scan report");
    assert_eq!(scan.infected, 2);
    assert_eq!(scan.files, Some(200));
    assert!(!stale.exists());
    assert!(current.exists());
    assert!(exec.calls().is_empty());

    Ok(())
}
