//! Runtime configuration: DNS retry policy, SMTP timeouts, overall deadline.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    pub dns: DnsConfig,
    pub smtp: SmtpConfig,
    pub dkim: DkimConfig,
    /// Overall budget for one facade call, in milliseconds.
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    /// Retries after the first attempt. Capped at 2.
    pub retries: u32,
    /// First backoff delay; doubles after every retry.
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub helo_name: String,
    /// PEM bundle of trust anchors used to judge peer certificates.
    pub ca_bundle: Option<PathBuf>,
    pub allow_plaintext_auth: bool,
    pub probe_starttls_required: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DkimConfig {
    pub clock_skew_secs: u64,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            dns: DnsConfig::default(),
            smtp: SmtpConfig::default(),
            dkim: DkimConfig::default(),
            deadline_ms: 30_000,
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            retries: 2,
            backoff_ms: 200,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            command_timeout_ms: 10_000,
            helo_name: "inspector.invalid".to_string(),
            ca_bundle: None,
            allow_plaintext_auth: false,
            probe_starttls_required: true,
        }
    }
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self { clock_skew_secs: 300 }
    }
}

impl InspectorConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn with_dns_timeout(mut self, timeout: Duration) -> Self {
        self.dns.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_smtp_timeouts(mut self, connect: Duration, command: Duration) -> Self {
        self.smtp.connect_timeout_ms = connect.as_millis() as u64;
        self.smtp.command_timeout_ms = command.as_millis() as u64;
        self
    }

    pub fn allow_plaintext_auth(mut self, allow: bool) -> Self {
        self.smtp.allow_plaintext_auth = allow;
        self
    }
}

impl DnsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retries(&self) -> u32 {
        self.retries.min(2)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

impl SmtpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = InspectorConfig::default();
        assert_eq!(cfg.dns.timeout(), Duration::from_secs(5));
        assert_eq!(cfg.dns.retries(), 2);
        assert_eq!(cfg.smtp.connect_timeout(), Duration::from_secs(10));
        assert!(!cfg.smtp.allow_plaintext_auth);
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let cfg = InspectorConfig::from_toml(
            r#"
            deadline_ms = 1000

            [dns]
            retries = 7

            [smtp]
            helo_name = "probe.example.net"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.deadline(), Duration::from_secs(1));
        // retries are capped regardless of configuration
        assert_eq!(cfg.dns.retries(), 2);
        assert_eq!(cfg.dns.timeout_ms, 5_000);
        assert_eq!(cfg.smtp.helo_name, "probe.example.net");
    }

    #[test]
    fn backoff_doubles() {
        let dns = DnsConfig::default();
        assert_eq!(dns.backoff(1), Duration::from_millis(200));
        assert_eq!(dns.backoff(2), Duration::from_millis(400));
    }
}
