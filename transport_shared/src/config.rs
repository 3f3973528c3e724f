//! Configuration system.
//!
//! Transport configuration loads from JSON strings or files. Every field has a
//! default so partial files are accepted.

use std::{
    net::{IpAddr, Ipv4Addr},
    path::Path,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Reference bound for one stable frame (1 MiB).
pub const DEFAULT_MAX_STABLE_PACKET_SIZE: u32 = 1024 * 1024;

/// Reference bound for one datagram, header included (MTU-sized).
pub const DEFAULT_MAX_UNSTABLE_PACKET_SIZE: usize = 1500;

/// Root configuration shared by the server and the clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Address both listening sockets bind to.
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,
    /// Datagram port. `0` picks an ephemeral port.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Stream port. `0` picks an ephemeral port.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Number of stable-connection processors.
    #[serde(default = "default_stable_threads")]
    pub stable_threads: usize,
    /// Largest accepted stable frame body.
    #[serde(default = "default_max_stable_packet_size")]
    pub max_stable_packet_size: u32,
    /// Largest accepted datagram, header included.
    #[serde(default = "default_max_unstable_packet_size")]
    pub max_unstable_packet_size: usize,
    /// Upper bound on every readiness wait; also bounds shutdown latency.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Sleep taken by a processor whose table is empty.
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    /// Silence after which a datagram peer's controller is discarded.
    #[serde(default = "default_unstable_peer_timeout_ms")]
    pub unstable_peer_timeout_ms: u64,
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_udp_port() -> u16 {
    40000
}

fn default_tcp_port() -> u16 {
    40001
}

fn default_stable_threads() -> usize {
    4
}

fn default_max_stable_packet_size() -> u32 {
    DEFAULT_MAX_STABLE_PACKET_SIZE
}

fn default_max_unstable_packet_size() -> usize {
    DEFAULT_MAX_UNSTABLE_PACKET_SIZE
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_idle_sleep_ms() -> u64 {
    10
}

fn default_unstable_peer_timeout_ms() -> u64 {
    30_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            udp_port: default_udp_port(),
            tcp_port: default_tcp_port(),
            stable_threads: default_stable_threads(),
            max_stable_packet_size: default_max_stable_packet_size(),
            max_unstable_packet_size: default_max_unstable_packet_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
            unstable_peer_timeout_ms: default_unstable_peer_timeout_ms(),
        }
    }
}

impl TransportConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Loopback config on ephemeral ports with short waits, for tests.
    pub fn loopback() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port: 0,
            tcp_port: 0,
            stable_threads: 2,
            poll_timeout_ms: 50,
            idle_sleep_ms: 2,
            ..Default::default()
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn unstable_peer_timeout(&self) -> Duration {
        Duration::from_millis(self.unstable_peer_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let cfg = TransportConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, TransportConfig::default());
        assert_eq!(cfg.max_stable_packet_size, 1024 * 1024);
        assert_eq!(cfg.max_unstable_packet_size, 1500);
    }

    #[test]
    fn partial_json_overrides_fields() {
        let cfg = TransportConfig::from_json_str(
            r#"{ "bind_ip": "127.0.0.1", "tcp_port": 5000, "stable_threads": 8 }"#,
        )
        .unwrap();
        assert_eq!(cfg.bind_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(cfg.tcp_port, 5000);
        assert_eq!(cfg.stable_threads, 8);
        assert_eq!(cfg.udp_port, 40000);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = TransportConfig::from_json_file("/nonexistent/transport.json").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/transport.json"));
    }
}
