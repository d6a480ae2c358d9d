//! Wisp server configuration

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use wisp_mux::ServerConfig;
use wisp_mux::packet::WispVersion;

/// A single port or an inclusive `[low, high]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortRange {
    Single(u16),
    Range(u16, u16),
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        match *self {
            Self::Single(p) => p == port,
            Self::Range(low, high) => (low..=high).contains(&port),
        }
    }
}

/// Configuration for the Wisp proxy server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WispConfig {
    /// Allow TCP streams
    pub allow_tcp: bool,
    /// Allow UDP streams (also decides whether the UDP extension is offered)
    pub allow_udp: bool,
    /// Allow IP literals as destinations
    pub allow_direct_ip: bool,
    /// Allow connections to loopback addresses
    pub allow_loopback: bool,
    /// Allow connections to private/non-global IPs
    pub allow_private: bool,
    /// Regexes; when non-empty a hostname must match one of them
    pub hostname_whitelist: Vec<String>,
    /// Regexes; ignored when a whitelist is set
    pub hostname_blacklist: Vec<String>,
    /// When non-empty the port must fall in one of these
    pub port_whitelist: Vec<PortRange>,
    /// Ignored when a whitelist is set
    pub port_blacklist: Vec<PortRange>,
    /// Live streams allowed per connection
    pub stream_limit_total: Option<usize>,
    /// Live streams to one hostname allowed per connection
    pub stream_limit_per_host: Option<usize>,
    /// Packets buffered per stream before the client must wait for credit
    pub buffer_size: u32,
    /// Largest chunk read from a destination socket at once
    pub socket_buffer_size: usize,
    /// 1 or 2
    pub wisp_version: u8,
    pub wisp_motd: Option<String>,
    /// username -> password; enables password authentication
    pub wisp_passwords: Option<HashMap<String, String>>,
    /// DNS servers to use (empty = system default)
    pub dns_servers: Vec<String>,
    /// Directory served for non-Wisp paths
    pub static_dir: Option<PathBuf>,
    /// Seconds between WebSocket pings on Wisp connections (0 = never)
    pub ping_interval: u64,
    /// Log the client address from X-Forwarded-For / X-Real-IP
    pub parse_real_ip: bool,
    /// Proxies trusted to set those headers
    pub parse_real_ip_from: Vec<IpAddr>,
}

impl Default for WispConfig {
    fn default() -> Self {
        Self {
            allow_tcp: true,
            allow_udp: true,
            allow_direct_ip: true,
            allow_loopback: false,
            allow_private: true,
            hostname_whitelist: Vec::new(),
            hostname_blacklist: Vec::new(),
            port_whitelist: Vec::new(),
            port_blacklist: vec![
                // Common blocked ports for security
                PortRange::Single(22),  // SSH
                PortRange::Single(25),  // SMTP
                PortRange::Single(587), // SMTP submission
            ],
            stream_limit_total: None,
            stream_limit_per_host: None,
            buffer_size: wisp_mux::DEFAULT_BUFFER_SIZE,
            socket_buffer_size: 16384,
            wisp_version: 2,
            wisp_motd: None,
            wisp_passwords: None,
            dns_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            static_dir: None,
            ping_interval: 30,
            parse_real_ip: true,
            parse_real_ip_from: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        }
    }
}

impl WispConfig {
    /// Defaults, then the JSON file named by `WISP_CONFIG`, then the JSON
    /// object in `WISP_OPTIONS`.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("WISP_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        if let Ok(options) = std::env::var("WISP_OPTIONS") {
            config = config
                .with_overrides(&options)
                .context("Invalid WISP_OPTIONS")?;
        }
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Replace the top-level fields present in the JSON object `overrides`.
    pub fn with_overrides(self, overrides: &str) -> Result<Self> {
        let overrides: Value = serde_json::from_str(overrides)?;
        let Value::Object(overrides) = overrides else {
            anyhow::bail!("Expected a JSON object");
        };
        let mut merged = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut merged {
            fields.extend(overrides);
        }
        Ok(serde_json::from_value(merged)?)
    }

    /// Check if a port is blocked
    pub fn is_port_blocked(&self, port: u16) -> bool {
        if !self.port_whitelist.is_empty() {
            return !self.port_whitelist.iter().any(|range| range.contains(port));
        }
        self.port_blacklist.iter().any(|range| range.contains(port))
    }

    /// Settings for the protocol engine.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            buffer_size: self.buffer_size,
            version: if self.wisp_version >= 2 {
                WispVersion::V2
            } else {
                WispVersion::V1
            },
            udp_extension: self.allow_udp,
            passwords: self.wisp_passwords.clone(),
            motd: self.wisp_motd.clone(),
            ..Default::default()
        }
    }
}
