//! Configuration structures.
//!
//! Configuration is loaded from an optional JSON file plus environment
//! overrides. Every section has working defaults so `Config::default()` is a
//! usable single-machine setup.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ipc::WireFormat;
use crate::types::{Error, Result};

/// Environment variable overriding [`NodeConfig::host_authority`].
pub const ENV_HOST_AUTHORITY: &str = "HOSTMESH_HOST_AUTHORITY";

/// Global host configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identity and dispatch settings of this node.
    #[serde(default)]
    pub node: NodeConfig,

    /// Framed channel settings.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Child process launch settings.
    #[serde(default)]
    pub launcher: LauncherConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a JSON file (if given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)?
            }
            None => Config::default(),
        };
        if let Ok(host) = std::env::var(ENV_HOST_AUTHORITY) {
            if !host.is_empty() {
                config.node.host_authority = host;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the transport cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.node.host_authority.is_empty() || self.node.host_authority.contains('/') {
            return Err(Error::validation(format!(
                "host_authority must be non-empty and contain no '/': {:?}",
                self.node.host_authority
            )));
        }
        if self.channel.max_frame_bytes == 0 || self.channel.max_frame_bytes > i32::MAX as u32 {
            return Err(Error::validation(format!(
                "max_frame_bytes out of range: {}",
                self.channel.max_frame_bytes
            )));
        }
        if self.channel.keepalive_interval == Some(Duration::ZERO) {
            return Err(Error::validation(
                "keepalive_interval must be positive (omit it to disable keep-alives)",
            ));
        }
        if self.channel.keepalive_misses == 0 {
            return Err(Error::validation("keepalive_misses must be at least 1"));
        }
        Ok(())
    }
}

/// Identity and dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host part of every address this node hands out.
    pub host_authority: String,

    /// Serializer used for envelopes and payloads.
    #[serde(default)]
    pub wire_format: WireFormat,

    /// How long an incoming call waits for its endpoint to be registered
    /// before failing with "endpoint not found".
    #[serde(with = "humantime_serde")]
    pub endpoint_resolve_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host_authority: "localhost".to_string(),
            wire_format: WireFormat::default(),
            endpoint_resolve_timeout: Duration::ZERO,
        }
    }
}

/// Framed channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Maximum frame payload size in bytes. Larger frames fail the channel.
    pub max_frame_bytes: u32,

    /// Idle interval after which a keep-alive frame is sent. `None` disables
    /// keep-alives and the peer-loss timer.
    #[serde(default, with = "humantime_serde")]
    pub keepalive_interval: Option<Duration>,

    /// Number of silent keep-alive intervals tolerated before the peer is
    /// declared lost.
    pub keepalive_misses: u32,
}

impl ChannelConfig {
    /// Silence after which the peer is considered gone.
    pub fn peer_timeout(&self) -> Option<Duration> {
        self.keepalive_interval
            .map(|interval| interval.saturating_mul(self.keepalive_misses))
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_misses: 3,
        }
    }
}

/// Child process launch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Absolute limit, counted from spawn, for the child to complete its handshake.
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Worker executable used when a creation request names none.
    /// Defaults to `hostmesh-worker` next to the current executable.
    pub worker_program: Option<PathBuf>,

    /// Extra arguments passed to every worker.
    #[serde(default)]
    pub worker_args: Vec<String>,

    /// Program used to start workers on another host (`<shell> <host> <worker> ...`).
    pub remote_shell: String,

    /// Address the rendezvous listener binds for socket transports.
    pub rendezvous_addr: SocketAddr,

    /// Time a destroyed child gets to exit on its own before it is killed.
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,

    /// Console lines kept per child for failure diagnostics.
    pub output_capture_lines: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            worker_program: None,
            worker_args: Vec::new(),
            remote_shell: "ssh".to_string(),
            rendezvous_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            kill_grace: Duration::from_secs(2),
            output_capture_lines: 200,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_humantime_durations_parse() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "channel": {
                "max_frame_bytes": 1024,
                "keepalive_interval": "250ms",
                "keepalive_misses": 4
            },
            "launcher": {
                "handshake_timeout": "3s",
                "worker_program": null,
                "remote_shell": "ssh",
                "rendezvous_addr": "127.0.0.1:0",
                "kill_grace": "1s",
                "output_capture_lines": 10
            }
        }))
        .unwrap();

        assert_eq!(config.channel.keepalive_interval, Some(Duration::from_millis(250)));
        assert_eq!(config.channel.peer_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(config.launcher.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.node.host_authority, "localhost");
    }

    #[test]
    fn test_missing_keepalive_means_infinite() {
        let config: ChannelConfig = serde_json::from_value(serde_json::json!({
            "max_frame_bytes": 1024,
            "keepalive_misses": 3
        }))
        .unwrap();
        assert_eq!(config.keepalive_interval, None);
        assert_eq!(config.peer_timeout(), None);
    }

    #[test]
    fn test_validate_rejects_bad_frame_limit() {
        let mut config = Config::default();
        config.channel.max_frame_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.node.host_authority = "a/b".to_string();
        assert!(config.validate().is_err());
    }
}
