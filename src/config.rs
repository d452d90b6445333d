/**
 * config.rs
 *
 * Runtime configuration: the friend table plus one opaque blob per
 * backend, forwarded verbatim by the orchestrator.
 */

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::friends::Friend;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub friends: HashMap<String, Friend>,
    #[serde(default)]
    pub signalling: SignallingConfig,
    #[serde(default)]
    pub nat: NatConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw).context("parsing config file")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignallingConfig {
    /// Relay URL (wss://host:port).
    pub url: String,
    /// Identity announced to the relay at registration.
    pub name: String,
    /// Accept self-signed relay certificates (development relays).
    pub accept_invalid_certs: bool,
}

impl Default for SignallingConfig {
    fn default() -> Self {
        Self {
            url: "wss://127.0.0.1:8443".to_string(),
            name: String::new(),
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// STUN server (host:port).
    pub server: String,
    /// Seconds to wait for a binding response.
    pub timeout_secs: u64,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            server: "stun.l.google.com:19302".to_string(),
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Local TCP port for the rendezvous (0 picks a free one).
    pub tcp_port: u16,
    /// Hex-encoded 32-byte seed for the probe signing key. A fresh key
    /// is generated when absent.
    pub probe_key: Option<String>,
    /// STUN server used to warm the punching socket's NAT mapping.
    pub stun_server: Option<String>,
    pub punch_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            tcp_port: 0,
            probe_key: None,
            stun_server: None,
            punch_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Base of the virtual network the pool hands addresses out of.
    pub network: Ipv4Addr,
    /// Number of assignable host addresses.
    pub capacity: u16,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(10, 99, 0, 0),
            capacity: 254,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "friends": {"bob": {"validated": true}},
                "signalling": {"url": "wss://relay:8443", "name": "alice"},
                "allocator": {"network": "10.7.0.0", "capacity": 64}
            }"#,
        )
        .unwrap();
        assert!(cfg.friends["bob"].validated);
        assert_eq!(cfg.signalling.url, "wss://relay:8443");
        assert_eq!(cfg.allocator.network, Ipv4Addr::new(10, 7, 0, 0));
        assert_eq!(cfg.allocator.capacity, 64);
        // untouched sections fall back to defaults
        assert_eq!(cfg.tunnel.punch_timeout_secs, 30);
        assert_eq!(cfg.nat.timeout_secs, 5);
    }

    #[test]
    fn empty_object_is_a_valid_config() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert!(cfg.friends.is_empty());
        assert_eq!(cfg.allocator.capacity, 254);
    }
}
