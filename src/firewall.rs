// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Firewall rule translation.
//!
//! Hostprep drives `ufw`. Incoming traffic is denied by default, outgoing
//! traffic is allowed, and each configured [`FirewallRule`] opens (or closes)
//! a hole for a source range and port. Only the exit status of `ufw` is
//! consumed.

use crate::exec::CommandLine;

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    net::IpAddr,
};

/// Allow or deny matching traffic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Allow,
    Deny,
}

impl Display for RuleAction {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Allow => fmt.write_str("allow"),
            Self::Deny => fmt.write_str("deny"),
        }
    }
}

/// Transport protocol of rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Display for Protocol {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Tcp => fmt.write_str("tcp"),
            Self::Udp => fmt.write_str("udp"),
        }
    }
}

/// Single firewall rule.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FirewallRule {
    /// Allow or deny.
    pub action: RuleAction,

    /// Source address or CIDR range. Any source if missing.
    pub from: Option<String>,

    /// Destination port. Any port if missing.
    pub port: Option<u16>,

    /// Transport protocol. Both if missing.
    pub proto: Option<Protocol>,

    /// Comment stored with rule.
    pub comment: Option<String>,
}

impl FirewallRule {
    /// Short label for step names, e.g., `allow-192.168.0.0/16-22/tcp`.
    pub fn label(&self) -> String {
        let mut label = self.action.to_string();
        label.push('-');
        label.push_str(self.from.as_deref().unwrap_or("any"));
        if let Some(port) = self.port {
            label.push_str(format!("-{port}").as_str());
        }
        if let Some(proto) = self.proto {
            label.push_str(format!("/{proto}").as_str());
        }

        label
    }

    /// Validate rule.
    ///
    /// # Errors
    ///
    /// - Return [`FirewallError::EmptyRule`] if rule has neither source nor
    ///   port, which would match all traffic.
    /// - Return [`FirewallError::InvalidSource`] if source is not an IP
    ///   address or CIDR range.
    pub fn validate(&self) -> Result<()> {
        if self.from.is_none() && self.port.is_none() {
            return Err(FirewallError::EmptyRule);
        }

        if let Some(from) = &self.from {
            validate_source(from)?;
        }

        Ok(())
    }

    /// Translate rule into `ufw` invocation.
    ///
    /// # Errors
    ///
    /// - Return [`FirewallError`] if rule is invalid.
    pub fn to_command(&self) -> Result<CommandLine> {
        self.validate()?;

        let mut command = CommandLine::new("ufw").arg(self.action.to_string());
        command = command.args(["from", self.from.as_deref().unwrap_or("any")]);
        command = command.args(["to", "any"]);
        if let Some(port) = self.port {
            command = command.args(["port".to_string(), port.to_string()]);
        }
        if let Some(proto) = self.proto {
            command = command.args(["proto".to_string(), proto.to_string()]);
        }
        if let Some(comment) = &self.comment {
            command = command.args(["comment", comment.as_str()]);
        }

        Ok(command)
    }
}

fn validate_source(source: &str) -> Result<()> {
    let invalid = || FirewallError::InvalidSource(source.to_string());
    let (address, prefix) = match source.split_once('/') {
        Some((address, prefix)) => (address, Some(prefix)),
        None => (source, None),
    };

    let address: IpAddr = address.parse().map_err(|_| invalid())?;
    if let Some(prefix) = prefix {
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if address.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }
    }

    Ok(())
}

/// Commands that set default policies.
pub fn default_policy_commands() -> Vec<CommandLine> {
    vec![
        CommandLine::new("ufw").args(["default", "deny", "incoming"]),
        CommandLine::new("ufw").args(["default", "allow", "outgoing"]),
    ]
}

/// Command that enables firewall without prompting.
pub fn enable_command() -> CommandLine {
    CommandLine::new("ufw").args(["--force", "enable"])
}

/// Default rule set: SSH from private LAN, anything from the tailnet.
pub fn default_rules() -> Vec<FirewallRule> {
    vec![
        FirewallRule {
            action: RuleAction::Allow,
            from: Some("192.168.0.0/16".into()),
            port: Some(22),
            proto: Some(Protocol::Tcp),
            comment: Some("ssh from lan".into()),
        },
        FirewallRule {
            action: RuleAction::Allow,
            from: Some("100.64.0.0/10".into()),
            port: None,
            proto: None,
            comment: Some("tailscale".into()),
        },
    ]
}

/// Firewall rule error types.
#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    /// Rule would match all traffic.
    #[error("firewall rule needs a source or a port")]
    EmptyRule,

    /// Source is not an address or CIDR range.
    #[error("invalid firewall source {0:?}")]
    InvalidSource(String),
}

/// Friendly result alias :3
pub type Result<T, E = FirewallError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test]
    fn default_rules_translate() -> anyhow::Result<()> {
        let result = default_rules()
            .iter()
            .map(|rule| rule.to_command().map(|cmd| cmd.to_string()))
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(
            result,
            vec![
                "ufw allow from 192.168.0.0/16 to any port 22 proto tcp comment \"ssh from lan\"",
                "ufw allow from 100.64.0.0/10 to any comment tailscale",
            ]
        );
        Ok(())
    }

    #[test]
    fn deny_port_from_anywhere() -> anyhow::Result<()> {
        let rule = FirewallRule {
            action: RuleAction::Deny,
            port: Some(23),
            ..Default::default()
        };

        assert_eq!(rule.to_command()?.to_string(), "ufw deny from any to any port 23");
        assert_eq!(rule.label(), "deny-any-23");
        Ok(())
    }

    #[test]
    fn empty_rule_rejected() {
        let rule = FirewallRule::default();
        assert!(matches!(rule.to_command(), Err(FirewallError::EmptyRule)));
    }

    #[test_case("10.0.0.0/33"; "prefix too long")]
    #[test_case("not-an-ip"; "garbage")]
    #[test_case("10.0.0.0/x"; "bad prefix")]
    #[test]
    fn invalid_sources_rejected(source: &str) {
        let rule = FirewallRule {
            from: Some(source.into()),
            ..Default::default()
        };
        assert!(matches!(rule.validate(), Err(FirewallError::InvalidSource(_))));
    }

    #[test_case("fd7a:115c:a1e0::/48"; "ipv6 range")]
    #[test_case("192.168.1.10"; "single address")]
    #[test]
    fn valid_sources_accepted(source: &str) {
        let rule = FirewallRule {
            from: Some(source.into()),
            ..Default::default()
        };
        assert!(rule.validate().is_ok());
    }
}
