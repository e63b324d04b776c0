//! Tunnel configuration types
//!
//! `ServerConfig` is the caller-supplied credential set for a remote
//! Shadowsocks server; `TunnelConfig` collects the knobs of the local
//! pipeline (binary paths, ports, timeouts) with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Local SOCKS5 port exposed by the Shadowsocks proxy process
pub const DEFAULT_LOCAL_PROXY_PORT: u16 = 1081;

/// Loopback address the local proxy binds to
pub const LOCAL_PROXY_HOST: &str = "127.0.0.1";

/// Default timeout for the TCP reachability probe (milliseconds)
pub const DEFAULT_REACHABILITY_TIMEOUT_MS: u64 = 10_000;

/// Default overall time limit for the credential probe (milliseconds)
pub const DEFAULT_CREDENTIAL_TIMEOUT_MS: u64 = 10_000;

/// Default wait after tunnel spawn before configuring routes (milliseconds)
///
/// The virtual interface is not guaranteed to be up the moment the tunnel
/// process starts; this is a heuristic, not a readiness signal.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 3_000;

/// Remote Shadowsocks server access parameters
///
/// Immutable value supplied by the caller; the core never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname or IP address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Shadowsocks password
    pub password: String,
    /// Shadowsocks cipher name (e.g. "chacha20-ietf-poly1305")
    pub method: String,
    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ServerConfig {
    /// Name to show in logs and UI, falling back to host:port
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

/// Knobs of the local connection pipeline
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Path to the bundled Shadowsocks client binary
    pub proxy_binary: PathBuf,
    /// Path to the bundled SOCKS-to-TUN binary
    pub tunnel_binary: PathBuf,
    /// Local port the Shadowsocks proxy listens on
    pub local_proxy_port: u16,
    /// Timeout for the TCP reachability probe
    pub reachability_timeout: Duration,
    /// Overall time limit for the credential probe
    pub credential_timeout: Duration,
    /// Wait after tunnel spawn before configuring routes
    pub settle_delay: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            proxy_binary: PathBuf::from("ss-local"),
            tunnel_binary: PathBuf::from("tun2socks"),
            local_proxy_port: DEFAULT_LOCAL_PROXY_PORT,
            reachability_timeout: Duration::from_millis(DEFAULT_REACHABILITY_TIMEOUT_MS),
            credential_timeout: Duration::from_millis(DEFAULT_CREDENTIAL_TIMEOUT_MS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
        }
    }
}

impl TunnelConfig {
    /// Loopback address of the local SOCKS5 endpoint
    pub fn local_proxy_addr(&self) -> String {
        format!("{}:{}", LOCAL_PROXY_HOST, self.local_proxy_port)
    }
}
