//! Node configuration.
//!
//! Defaults suit a node on a LAN talking to a nearby tracker. Environment
//! variables override them, and command-line flags override the environment.
//!
//! | Field | Default | Environment |
//! |-------|---------|-------------|
//! | `heartbeat_interval` | 2 s | `RING_HEARTBEAT_MS` |
//! | `bind_ip` | `0.0.0.0` | `RING_BIND_IP` |
//! | `read_buffer_len` | 4096 | `RING_READ_BUFFER` |

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::types::MAX_PDU_LEN;

/// Runtime settings for a node and its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Poll timeout. Each expiry while steady sends one Alive to the tracker.
    pub heartbeat_interval: Duration,
    /// Local address every socket binds to (env: RING_BIND_IP).
    pub bind_ip: Ipv4Addr,
    /// Size of each socket read. Never below one maximal PDU.
    pub read_buffer_len: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(2000),
            bind_ip: Ipv4Addr::UNSPECIFIED,
            read_buffer_len: 4096,
        }
    }
}

impl NodeConfig {
    /// Create configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a variable lookup. Unparseable values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = lookup("RING_HEARTBEAT_MS").and_then(|v| v.parse::<u64>().ok()) {
            if ms > 0 {
                self.heartbeat_interval = Duration::from_millis(ms);
            }
        }

        if let Some(ip) = lookup("RING_BIND_IP").and_then(|v| v.parse::<Ipv4Addr>().ok()) {
            self.bind_ip = ip;
        }

        if let Some(len) = lookup("RING_READ_BUFFER").and_then(|v| v.parse::<usize>().ok()) {
            self.read_buffer_len = len;
        }

        self.read_buffer_len = self.read_buffer_len.max(MAX_PDU_LEN);
        self
    }
}
