use serde::Deserialize;

use crate::error::{Error, Result};

/// Driver options. The core never reads files, flags, or environment
/// variables; embedders construct this directly or deserialize it from
/// whatever carrier they use.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_connections_per_endpoint")]
    pub max_connections_per_endpoint: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// GET_MORE batch size; 0 lets the server pick.
    #[serde(default = "default_cursor_batch_size")]
    pub cursor_batch_size: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections_per_endpoint: default_max_connections_per_endpoint(),
            max_frame_bytes: default_max_frame_bytes(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            reconnect_jitter: default_reconnect_jitter(),
            max_consecutive_failures: default_max_consecutive_failures(),
            cursor_batch_size: default_cursor_batch_size(),
        }
    }
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections_per_endpoint == 0 {
            return Err(Error::Config(
                "max_connections_per_endpoint must be at least 1".to_string(),
            ));
        }
        if self.max_frame_bytes < crate::protocol::HEADER_LEN + 5 {
            return Err(Error::Config(format!(
                "max_frame_bytes {} cannot hold a header and a document",
                self.max_frame_bytes
            )));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(Error::Config(format!(
                "reconnect_jitter must be between 0.0 and 1.0, got {}",
                self.reconnect_jitter
            )));
        }
        if self.reconnect_cap_ms < self.reconnect_base_ms {
            return Err(Error::Config(format!(
                "reconnect_cap_ms {} is below reconnect_base_ms {}",
                self.reconnect_cap_ms, self.reconnect_base_ms
            )));
        }
        if self.cursor_batch_size < 0 {
            return Err(Error::Config(format!(
                "cursor_batch_size must not be negative, got {}",
                self.cursor_batch_size
            )));
        }
        Ok(())
    }
}

fn default_max_connections_per_endpoint() -> usize {
    10
}
fn default_max_frame_bytes() -> usize {
    48 * 1024 * 1024
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_timeout_ms() -> u64 {
    5000
}
fn default_reconnect_base_ms() -> u64 {
    100
}
fn default_reconnect_cap_ms() -> u64 {
    30_000
}
fn default_reconnect_jitter() -> f64 {
    0.2
}
fn default_max_consecutive_failures() -> u32 {
    5
}
fn default_cursor_batch_size() -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_connections_per_endpoint, 10);
        assert_eq!(cfg.max_frame_bytes, 48 * 1024 * 1024);
        assert_eq!(cfg.connect_timeout_ms, 5000);
        assert_eq!(cfg.request_timeout_ms, 30_000);
        assert_eq!(cfg.shutdown_timeout_ms, 5000);
        assert_eq!(cfg.reconnect_base_ms, 100);
        assert_eq!(cfg.reconnect_cap_ms, 30_000);
        assert_eq!(cfg.reconnect_jitter, 0.2);
        assert_eq!(cfg.cursor_batch_size, 0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.max_connections_per_endpoint = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.reconnect_jitter = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.reconnect_cap_ms = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.cursor_batch_size = -1;
        assert!(cfg.validate().is_err());
    }
}
