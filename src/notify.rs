// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Scan result delivery.
//!
//! Results go to a chat bot over the Telegram Bot API: a form POST to
//! `<api>/bot<token>/sendMessage`, and optionally a multipart POST of the scan
//! log to `<api>/bot<token>/sendDocument`. Delivery is best effort. Failures
//! are logged and never change the outcome of a scan.

use crate::{envfile, preflight::PreflightError};

use reqwest::blocking::{multipart::Form, Client, Response};
use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Longest message text the Bot API accepts.
pub const MAX_MESSAGE_LEN: usize = 4096;

const TOKEN_KEYS: [&str; 2] = ["BOT_TOKEN", "TELEGRAM_BOT_TOKEN"];
const CHAT_ID_KEYS: [&str; 2] = ["CHAT_ID", "TELEGRAM_CHAT_ID"];

/// Bot credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub chat_id: String,
}

impl Credentials {
    /// Parse credentials from key/value file contents.
    ///
    /// # Errors
    ///
    /// - Return [`PreflightError::MissingCredential`] if token or chat
    ///   identifier is missing or empty.
    pub fn parse(contents: &str) -> Result<Self, PreflightError> {
        let entries = envfile::parse(contents);
        let lookup = |keys: [&str; 2]| {
            keys.iter()
                .filter_map(|key| entries.get(*key))
                .find(|value| !value.trim().is_empty())
                .map(|value| value.trim().to_string())
                .ok_or_else(|| PreflightError::MissingCredential(keys.join("/")))
        };

        Ok(Self {
            token: lookup(TOKEN_KEYS)?,
            chat_id: lookup(CHAT_ID_KEYS)?,
        })
    }

    /// Read credentials file.
    ///
    /// # Errors
    ///
    /// - Return [`NotifyError::ReadCredentials`] if file cannot be read.
    /// - Return [`NotifyError::Credential`] if a credential is missing.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = read_to_string(path).map_err(|err| NotifyError::ReadCredentials {
            source: err,
            path: path.to_path_buf(),
        })?;

        Ok(Self::parse(&contents)?)
    }
}

impl Debug for Credentials {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

/// Destination for scan results.
pub trait Notifier {
    /// Send text message.
    fn send_message(&self, text: &str) -> Result<()>;

    /// Send file with caption.
    fn send_document(&self, path: &Path, caption: &str) -> Result<()>;
}

/// Telegram Bot API client.
#[derive(Debug)]
pub struct TelegramNotifier {
    client: Client,
    api_url: String,
    credentials: Credentials,
}

impl TelegramNotifier {
    /// Construct new notifier against target API base URL.
    pub fn new(api_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    /// URL of target Bot API method.
    pub fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_url, self.credentials.token)
    }
}

impl Notifier for TelegramNotifier {
    #[instrument(skip(self, text), level = "debug")]
    fn send_message(&self, text: &str) -> Result<()> {
        let text = truncate_message(text);
        let response = self
            .client
            .post(self.endpoint("sendMessage"))
            .form(&[("chat_id", self.credentials.chat_id.as_str()), ("text", text)])
            .send()?;

        check_response(response)
    }

    #[instrument(skip(self, caption), level = "debug")]
    fn send_document(&self, path: &Path, caption: &str) -> Result<()> {
        let form = Form::new()
            .text("chat_id", self.credentials.chat_id.clone())
            .text("caption", truncate_message(caption).to_string())
            .file("document", path)
            .map_err(|err| NotifyError::Attachment {
                source: err,
                path: path.to_path_buf(),
            })?;
        let response = self
            .client
            .post(self.endpoint("sendDocument"))
            .multipart(form)
            .send()?;

        check_response(response)
    }
}

fn check_response(response: Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        debug!("delivered with status {status}");
        return Ok(());
    }

    let body = response.text().unwrap_or_default();
    Err(NotifyError::Rejected {
        status: status.as_u16(),
        body,
    })
}

/// Cut message down to what the Bot API accepts, on a character boundary.
pub fn truncate_message(text: &str) -> &str {
    match text.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// Deliver message, then optional attachment.
///
/// Failures are logged as warnings. Returns whether everything arrived.
pub fn deliver(notifier: &dyn Notifier, text: &str, attachment: Option<&Path>) -> bool {
    let mut delivered = true;
    match notifier.send_message(text) {
        Ok(()) => info!("scan notification sent"),
        Err(error) => {
            warn!("failed to send scan notification: {error}");
            delivered = false;
        }
    }

    if let Some(path) = attachment {
        let caption = format!("scan log {}", path.display());
        match notifier.send_document(path, &caption) {
            Ok(()) => info!("scan log attached"),
            Err(error) => {
                warn!("failed to attach scan log: {error}");
                delivered = false;
            }
        }
    }

    delivered
}

/// Host name to put in messages, `unknown-host` if it cannot be determined.
pub fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown-host".into())
}

/// Notification error types.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Credentials file could not be read.
    #[error("failed to read credentials at {:?}", path.display())]
    ReadCredentials {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Credentials file lacks a value.
    #[error(transparent)]
    Credential(#[from] PreflightError),

    /// Attachment could not be opened.
    #[error("failed to open attachment at {:?}", path.display())]
    Attachment {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Request could not be sent.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// API answered with an error status.
    #[error("messaging API rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Friendly result alias :3
pub type Result<T, E = NotifyError> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;

    /// Records everything sent. Fails every request when `broken` is set.
    #[derive(Debug, Default)]
    pub(crate) struct FakeNotifier {
        pub(crate) messages: RefCell<Vec<String>>,
        pub(crate) documents: RefCell<Vec<PathBuf>>,
        pub(crate) broken: bool,
    }

    impl Notifier for FakeNotifier {
        fn send_message(&self, text: &str) -> Result<()> {
            if self.broken {
                return Err(NotifyError::Rejected {
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            self.messages.borrow_mut().push(text.to_string());
            Ok(())
        }

        fn send_document(&self, path: &Path, _caption: &str) -> Result<()> {
            if self.broken {
                return Err(NotifyError::Rejected {
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            self.documents.borrow_mut().push(path.to_path_buf());
            Ok(())
        }
    }
}
