//! Tunnel server configuration
//!
//! Loaded from a TOML file, overridable from the CLI, and read-only once the
//! server starts. The secret is accepted either as 32 hex characters or in
//! UUID form with dashes.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::protocol::SECRET_LEN;

/// Main tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// WebSocket listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// 128-bit client token, hex with optional UUID dashes
    #[serde(default)]
    pub secret: String,

    /// Host dialed when the first outbound attempt yields no data
    #[serde(default)]
    pub fallback_addr: String,

    /// DoH endpoint answering tunneled DNS queries
    #[serde(default = "default_doh_url")]
    pub doh_url: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8443))
}

fn default_doh_url() -> String {
    "https://1.1.1.1/dns-query".to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            secret: String::new(),
            fallback_addr: String::new(),
            doh_url: default_doh_url(),
        }
    }
}

impl TunnelConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.secret_bytes()?;

        if self.fallback_addr.is_empty() {
            return Err("Fallback address must be set".to_string());
        }

        if !self.doh_url.starts_with("https://") && !self.doh_url.starts_with("http://") {
            return Err(format!("Invalid DoH URL: {}", self.doh_url));
        }

        Ok(())
    }

    /// Decode the configured secret into raw token bytes
    pub fn secret_bytes(&self) -> Result<[u8; SECRET_LEN], String> {
        if self.secret.is_empty() {
            return Err("Secret token must be set".to_string());
        }

        let bare = self.secret.replace('-', "");
        let decoded =
            hex::decode(&bare).map_err(|e| format!("Secret is not valid hex: {e}"))?;

        decoded
            .try_into()
            .map_err(|_| "Secret must be exactly 128 bits (32 hex characters)".to_string())
    }
}
