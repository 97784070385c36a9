// Relay server configuration.
//
// All settings come from environment variables with defaults suitable for
// local development. Unparseable values fall back to the default.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::room::BroadcastPolicy;

const DEFAULT_PORT: u16 = 8081;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
const DEFAULT_OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Whether a room's own updates are echoed back to their sender.
    pub broadcast_policy: BroadcastPolicy,
    /// Largest accepted WebSocket message.
    pub max_message_bytes: usize,
    /// Per-connection outbound queue depth before the connection is dropped as slow.
    pub outbound_queue: usize,
    /// Log filter directive (e.g. `info`, `tandem_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TANDEM_RELAY_HOST` | `0.0.0.0` |
    /// | `TANDEM_RELAY_PORT` (or `PORT`) | `8081` |
    /// | `TANDEM_RELAY_BROADCAST_ORIGIN` | `include` |
    /// | `TANDEM_RELAY_MAX_MESSAGE_BYTES` | `1048576` |
    /// | `TANDEM_RELAY_OUTBOUND_QUEUE` | `256` |
    /// | `TANDEM_RELAY_LOG_FILTER` | `info` |
    /// | `TANDEM_RELAY_LOG_FORMAT` | `text` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("TANDEM_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("TANDEM_RELAY_PORT")
            .or_else(|_| env("PORT"))
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let ip = parse_host(&host).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let listen_addr = SocketAddr::new(ip, port);

        let broadcast_policy = env("TANDEM_RELAY_BROADCAST_ORIGIN")
            .ok()
            .and_then(|v| BroadcastPolicy::parse(&v))
            .unwrap_or_default();

        let max_message_bytes = env("TANDEM_RELAY_MAX_MESSAGE_BYTES")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .filter(|bytes: &usize| *bytes > 0)
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);

        let outbound_queue = env("TANDEM_RELAY_OUTBOUND_QUEUE")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .filter(|depth: &usize| *depth > 0)
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE);

        let log_filter = env("TANDEM_RELAY_LOG_FILTER")
            .or_else(|_| env("RUST_LOG"))
            .unwrap_or_else(|_| "info".into());

        let log_format = env("TANDEM_RELAY_LOG_FORMAT")
            .ok()
            .and_then(|v| LogFormat::parse(&v))
            .unwrap_or_default();

        Self { listen_addr, broadcast_policy, max_message_bytes, outbound_queue, log_filter, log_format }
    }
}

/// Accepts a bare IPv4 or IPv6 address, optionally bracketed (`[::1]`).
fn parse_host(host: &str) -> Option<IpAddr> {
    let host = host.trim();
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    host.parse().ok()
}
