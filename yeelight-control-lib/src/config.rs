//! Tunables for connections and the discovery scanner.
//!
//! All durations are stored in milliseconds so the structs map one to one onto
//! configuration files.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Multicast group used for discovery and announcements.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
/// Port of the multicast group.
pub const MULTICAST_PORT: u16 = 1982;
/// Default TCP control port of a device.
pub const DEFAULT_DEVICE_PORT: u16 = 55443;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Upper bound for opening the TCP socket.
    pub connect_timeout_ms: u64,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout_ms: 5000,
        }
    }
}

/// Configuration of a connection that closes itself when idle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoConnectionConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Time without sends or received frames after which the socket is closed.
    pub idle_timeout_ms: u64,
}

impl AutoConnectionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for AutoConnectionConfig {
    fn default() -> Self {
        AutoConnectionConfig {
            connection: ConnectionConfig::default(),
            idle_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Where the search probe is sent.
    pub discovery_target: SocketAddr,
    /// Local address the announcement listener binds to. The multicast group
    /// is only joined when this address is unspecified (`0.0.0.0`).
    pub listen_address: SocketAddr,
    pub multicast_group: Ipv4Addr,
    /// Window used by scans that do not pass their own timeout.
    pub default_timeout_ms: u64,
    /// Receive buffer for a single datagram.
    pub buffer_size: usize,
}

impl ScannerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            discovery_target: SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT)),
            listen_address: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                MULTICAST_PORT,
            )),
            multicast_group: MULTICAST_GROUP,
            default_timeout_ms: 2000,
            buffer_size: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AutoConnectionConfig =
            serde_json::from_str(r#"{"idle_timeout_ms": 750}"#).unwrap();
        assert_eq!(config.idle_timeout(), Duration::from_millis(750));
        assert_eq!(config.connection, ConnectionConfig::default());
    }

    #[test]
    fn test_scanner_defaults_target_the_multicast_group() {
        let config = ScannerConfig::default();
        assert_eq!(config.discovery_target.to_string(), "239.255.255.250:1982");
        assert!(config.listen_address.ip().is_unspecified());
        assert_eq!(config.default_timeout(), Duration::from_secs(2));
    }
}
