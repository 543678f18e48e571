//! Transport configuration.
//!
//! Defaults suit a loopback development setup. A JSON file can override
//! them, and `BUSTCP_*` environment variables override both.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::framing::DEFAULT_MAX_FRAME_SIZE;

/// Tunables shared by listeners and dialers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Interface a listener binds when no host is given.
    pub listen_host: String,
    /// Host a dialer connects to when no host is given.
    pub connect_host: String,
    /// Capacity of each session's outbound frame queue.
    pub outbound_queue: usize,
    /// Largest accepted frame payload in bytes.
    pub max_frame_size: u32,
    /// Size of the per-session socket read buffer.
    pub read_buffer_size: usize,
    /// Give up dialing after this many milliseconds (`None` waits for the OS).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            connect_host: "127.0.0.1".to_string(),
            outbound_queue: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: 64 * 1024,
            connect_timeout_ms: None,
        }
    }
}

impl TransportConfig {
    /// Load from an optional JSON file, then apply environment overrides.
    ///
    /// A missing file falls back to defaults; an unreadable or invalid one
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::load_from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file. Unspecified fields keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Apply `BUSTCP_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("BUSTCP_LISTEN_HOST") {
            self.listen_host = host;
        }
        if let Ok(host) = std::env::var("BUSTCP_CONNECT_HOST") {
            self.connect_host = host;
        }
        if let Ok(value) = std::env::var("BUSTCP_OUTBOUND_QUEUE") {
            self.outbound_queue = value
                .parse()
                .with_context(|| format!("BUSTCP_OUTBOUND_QUEUE is not a number: {value}"))?;
        }
        if let Ok(value) = std::env::var("BUSTCP_MAX_FRAME_SIZE") {
            self.max_frame_size = value
                .parse()
                .with_context(|| format!("BUSTCP_MAX_FRAME_SIZE is not a number: {value}"))?;
        }
        if let Ok(value) = std::env::var("BUSTCP_CONNECT_TIMEOUT_MS") {
            let ms = value
                .parse()
                .with_context(|| format!("BUSTCP_CONNECT_TIMEOUT_MS is not a number: {value}"))?;
            self.connect_timeout_ms = Some(ms);
        }
        Ok(())
    }

    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.outbound_queue == 0 {
            anyhow::bail!("outbound_queue must be at least 1");
        }
        if self.max_frame_size < 2 {
            anyhow::bail!("max_frame_size must be at least 2 bytes");
        }
        if self.read_buffer_size == 0 {
            anyhow::bail!("read_buffer_size must be at least 1");
        }
        Ok(())
    }
}
