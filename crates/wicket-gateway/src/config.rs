//! Gateway configuration

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind address (e.g., "127.0.0.1:8000")
    pub bind: String,
    /// Upgrade path to accept (e.g., "/ws"). `None` accepts any path.
    pub path: Option<String>,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Frames a connection may have queued for writing before writes fail
    pub output_buffer_size: usize,
    /// How long a closing connection waits for the close handshake
    pub close_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            path: None,
            max_connections: 1024,
            output_buffer_size: 128,
            close_timeout_ms: 5000,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(GatewayError::InvalidConfig(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        // Connection slots are semaphore permits
        if self.max_connections > u32::MAX as usize {
            return Err(GatewayError::InvalidConfig(format!(
                "max_connections must not exceed {}",
                u32::MAX
            )));
        }
        if self.output_buffer_size == 0 {
            return Err(GatewayError::InvalidConfig(
                "output_buffer_size must be greater than zero".to_string(),
            ));
        }
        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(GatewayError::InvalidConfig(format!(
                    "path must start with '/': {}",
                    path
                )));
            }
        }
        Ok(())
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}
