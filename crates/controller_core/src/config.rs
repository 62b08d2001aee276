//! Controller configuration types and defaults.
//!
//! [`ControllerConfig`] carries every tunable the link layer needs. The
//! binary builds it from its TOML file; tests usually start from
//! [`ControllerConfig::default`] and shorten the timers.

use crate::message::PluginVersions;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration of the link layer.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// The socket address to accept host and control connections on
    pub bind_address: SocketAddr,

    /// Version announced in `hello`
    pub version: String,

    /// Loaded plugins announced in `hello`
    pub plugins: PluginVersions,

    /// Interval between heartbeats on a connected session
    pub heartbeat_interval_ms: u64,

    /// How long a dropped session waits for the peer to resume
    pub session_timeout_ms: u64,

    /// How long a new connection may take to send its handshake
    pub handshake_timeout_ms: u64,

    /// Deadline for forwarded and controller-originated requests
    pub request_timeout_ms: u64,

    /// Maximum number of simultaneously open raw connections
    pub max_connections: usize,
}

impl ControllerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Checks the timers for values the session logic cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat interval must be greater than zero".into());
        }
        if self.session_timeout_ms < self.heartbeat_interval_ms {
            return Err("session timeout must not be shorter than the heartbeat interval".into());
        }
        if self.handshake_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err("handshake and request timeouts must be greater than zero".into());
        }
        if self.max_connections == 0 {
            return Err("max connections must be greater than zero".into());
        }
        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            version: env!("CARGO_PKG_VERSION").to_string(),
            plugins: PluginVersions::new(),
            heartbeat_interval_ms: 15_000,
            session_timeout_ms: 60_000,
            handshake_timeout_ms: 30_000,
            request_timeout_ms: 30_000,
            max_connections: 1000,
        }
    }
}
