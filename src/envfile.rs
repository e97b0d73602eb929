// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Shell-style key/value file parsing.
//!
//! Both OS-release files and credential files follow the same loose format
//! that shell scripts can `source` directly: one `KEY=value` assignment per
//! line, values optionally wrapped in single or double quotes, `#` comments,
//! and an optional leading `export`. Only this common subset is understood.
//! No variable expansion or escape processing is performed.

use std::collections::BTreeMap;

/// Parse shell-style key/value assignments.
///
/// Lines without an `=` are ignored. Later assignments of the same key win,
/// just like they would when sourced by a shell.
pub fn parse(contents: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }

            entries.insert(key.to_string(), unquote(value.trim()).to_string());
        }
    }

    entries
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }

    value
}
