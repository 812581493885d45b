//! Transport configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::retry::RetryPolicy;
use crate::telemetry::ReconnectSchedule;

/// How events reach peers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayMode {
    /// Live socket channel through the relay only.
    #[default]
    DirectRelay,
    /// Live channel plus an offline mailbox for peers that are away.
    StoreAndForward,
}

/// Opaque handle of a linked wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletHandle(pub String);

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    pub mode: RelayMode,
    pub relay_host: String,
    /// Present for wallet-linked sessions; guests have none.
    pub wallet: Option<WalletHandle>,
    /// Own identity public key, hex.
    pub identity_key: String,
    pub heartbeat_interval_ms: u64,
    /// Ascending delays between reconnect attempts; the last one repeats.
    pub reconnect_schedule_ms: Vec<u64>,
    /// Heartbeat samples kept for the RTT average.
    pub rtt_window: usize,
    pub mailbox_retry: RetryPolicy,
    /// Budget for a single mailbox or ping call.
    pub request_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::DirectRelay,
            relay_host: String::new(),
            wallet: None,
            identity_key: String::new(),
            heartbeat_interval_ms: 30_000,
            reconnect_schedule_ms: vec![2_000, 5_000, 10_000],
            rtt_window: 10,
            mailbox_retry: RetryPolicy::default(),
            request_timeout_ms: 8_000,
        }
    }
}

impl TransportConfig {
    pub fn new(mode: RelayMode, relay_host: impl Into<String>, identity_key: impl Into<String>) -> Self {
        Self {
            mode,
            relay_host: relay_host.into(),
            identity_key: identity_key.into(),
            ..Self::default()
        }
    }

    pub fn with_wallet(mut self, wallet: impl Into<String>) -> Self {
        self.wallet = Some(WalletHandle(wallet.into()));
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_schedule(&self) -> ReconnectSchedule {
        ReconnectSchedule::new(
            self.reconnect_schedule_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms)),
        )
    }

    /// Reject configurations that cannot produce a working transport.
    pub fn validate(&self) -> Result<()> {
        if self.relay_host.trim().is_empty() {
            return Err(TransportError::Misconfigured("relay host is empty".into()));
        }
        if self.identity_key.trim().is_empty() {
            return Err(TransportError::Misconfigured("identity key is empty".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(TransportError::Misconfigured(
                "heartbeat interval must be positive".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(TransportError::Misconfigured(
                "request timeout must be positive".into(),
            ));
        }
        if self.rtt_window == 0 {
            return Err(TransportError::Misconfigured("rtt window must hold a sample".into()));
        }
        if self.reconnect_schedule_ms.is_empty() {
            return Err(TransportError::Misconfigured("reconnect schedule is empty".into()));
        }
        if self.reconnect_schedule_ms.windows(2).any(|w| w[1] < w[0]) {
            return Err(TransportError::Misconfigured(
                "reconnect schedule must be ascending".into(),
            ));
        }
        Ok(())
    }

    /// Identity of this configuration for handle reuse.
    pub fn config_key(&self) -> ConfigKey {
        ConfigKey::new(self.mode, &self.relay_host, &self.identity_key)
    }
}

/// Canonical serialization of `{host, identityKey, mode}`.
///
/// Two configurations with equal keys share one live transport; anything
/// else (heartbeat tuning, wallet handle) does not force a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigKey(String);

// Fields in lexical order so the JSON is canonical.
#[derive(Serialize)]
struct KeyFields<'a> {
    host: String,
    #[serde(rename = "identityKey")]
    identity_key: String,
    mode: &'a RelayMode,
}

impl ConfigKey {
    pub fn new(mode: RelayMode, host: &str, identity_key: &str) -> Self {
        let fields = KeyFields {
            host: host.trim().trim_end_matches('/').to_ascii_lowercase(),
            identity_key: identity_key.trim().to_ascii_lowercase(),
            mode: &mode,
        };
        // Serializing plain strings and a unit enum cannot fail.
        let json = serde_json::to_string(&fields).unwrap_or_default();
        Self(json)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.reconnect_schedule_ms, vec![2_000, 5_000, 10_000]);
        assert_eq!(config.rtt_window, 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_is_canonical() {
        let a = TransportConfig::new(RelayMode::DirectRelay, "Relay.Example/", "ABCD");
        let b = TransportConfig::new(RelayMode::DirectRelay, "relay.example", "abcd")
            .with_wallet("w1");
        assert_eq!(a.config_key(), b.config_key());
        assert_eq!(
            a.config_key().as_str(),
            r#"{"host":"relay.example","identityKey":"abcd","mode":"direct-relay"}"#
        );
    }

    #[test]
    fn test_mode_changes_key() {
        let a = TransportConfig::new(RelayMode::DirectRelay, "relay", "id");
        let b = TransportConfig::new(RelayMode::StoreAndForward, "relay", "id");
        assert_ne!(a.config_key(), b.config_key());
    }

    #[test]
    fn test_rejects_descending_schedule() {
        let mut config = TransportConfig::new(RelayMode::DirectRelay, "relay", "id");
        assert!(config.validate().is_ok());
        config.reconnect_schedule_ms = vec![5_000, 2_000];
        assert!(matches!(
            config.validate(),
            Err(TransportError::Misconfigured(_))
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TransportConfig = serde_json::from_str(
            r#"{"mode":"store-and-forward","relayHost":"relay","identityKey":"id"}"#,
        )
        .unwrap();
        assert_eq!(config.mode, RelayMode::StoreAndForward);
        assert_eq!(config.request_timeout_ms, 8_000);
    }
}
