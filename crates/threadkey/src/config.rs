//! Client configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use threadkey_relay::TransportConfig;

use crate::error::{ClientError, Result};

/// Configuration for a [`crate::ThreadClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    /// Base URL of shareable invite links.
    pub invite_base_url: String,
    /// Invite lifetime in seconds.
    pub invite_ttl_secs: u64,
    /// Period of the background safety-number check.
    pub safety_check_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            invite_base_url: "https://threadkey.app".to_string(),
            invite_ttl_secs: 7 * 24 * 3600,
            safety_check_interval_secs: 300,
        }
    }
}

impl ClientConfig {
    /// Parse JSON; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// Read and parse a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn safety_check_interval(&self) -> Duration {
        Duration::from_secs(self.safety_check_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        if self.invite_base_url.trim().is_empty() {
            return Err(ClientError::Config("invite base url is empty".into()));
        }
        if self.invite_ttl_secs == 0 {
            return Err(ClientError::Config("invite ttl must be positive".into()));
        }
        if self.safety_check_interval_secs == 0 {
            return Err(ClientError::Config(
                "safety check interval must be positive".into(),
            ));
        }
        Ok(())
    }
}
