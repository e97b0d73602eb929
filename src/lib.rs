// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Distribution-aware host provisioning.
//!
//! Hostprep reads an OS-release file to figure out which Linux family it runs
//! on, picks the matching [`DistroProfile`](plan::DistroProfile), and turns it
//! into an ordered list of named steps: extra repositories, packages,
//! services, dotfile clones, and firewall rules. A separate pipeline runs a
//! ClamAV scan and reports the result to a chat bot.
//!
//! # Failure Tiers
//!
//! Steps are either fatal or best effort. Fatal failures, such as missing
//! privileges, an unsupported distro, or missing credentials, stop everything.
//! Best effort failures are logged and listed in the final
//! [`RunReport`](runner::RunReport) for manual follow-up.

pub mod config;
pub mod distro;
pub mod dotfiles;
pub mod envfile;
pub mod exec;
pub mod firewall;
pub mod notify;
pub mod path;
pub mod pipeline;
pub mod plan;
pub mod preflight;
pub mod provision;
pub mod runner;
pub mod scan;
