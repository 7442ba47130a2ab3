use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::bail;

use crate::packet::MAX_PACKET_LEN;

pub const DEFAULT_SERVER_PORT: u16 = 69;
pub const DEFAULT_PROXY_PORT: u16 = 23;

#[derive(Debug, Clone)]
pub struct TftpConfig {
    /// The server's well-known address. The client sends requests here (unless it goes through a
    ///  proxy), the proxy forwards requests here.
    pub server_addr: SocketAddr,
    /// The address the fault-injecting proxy listens on for requests
    pub proxy_addr: SocketAddr,

    /// How long a session waits for a valid reply before it re-sends its last packet
    pub timeout: Duration,
    /// Total number of times a packet is sent before the session gives up, including the first
    ///  transmission
    pub max_retries: u32,

    /// This is part of the wire protocol and not really configurable - it is here so a
    ///  deviating setting is rejected instead of silently ignored
    pub max_packet_size: usize,

    /// On shutdown, the server stops accepting requests and gives in-flight sessions this long
    ///  to finish before closing their sockets
    pub shutdown_grace_period: Duration,
}

impl Default for TftpConfig {
    fn default() -> Self {
        TftpConfig {
            server_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_SERVER_PORT)),
            proxy_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PROXY_PORT)),
            timeout: Duration::from_millis(5000),
            max_retries: 5,
            max_packet_size: MAX_PACKET_LEN,
            shutdown_grace_period: Duration::from_secs(10),
        }
    }
}

impl TftpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_retries == 0 {
            bail!("max_retries must be at least 1");
        }
        if self.timeout.is_zero() {
            bail!("timeout must be positive");
        }
        if self.max_packet_size != MAX_PACKET_LEN {
            bail!("only the standard packet size of {} bytes is supported, configured was {}", MAX_PACKET_LEN, self.max_packet_size);
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: self.timeout,
            max_retries: self.max_retries,
        }
    }
}

/// The part of the configuration that a single transfer session needs
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SessionConfig {
    pub timeout: Duration,
    pub max_retries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = TftpConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server_addr.port(), 69);
        assert_eq!(config.session_config(), SessionConfig { timeout: Duration::from_secs(5), max_retries: 5 });
    }

    #[rstest]
    #[case::no_retries(0, Duration::from_secs(1), MAX_PACKET_LEN)]
    #[case::zero_timeout(3, Duration::ZERO, MAX_PACKET_LEN)]
    #[case::packet_size(3, Duration::from_secs(1), 1024)]
    fn test_validate_rejects(#[case] max_retries: u32, #[case] timeout: Duration, #[case] max_packet_size: usize) {
        let config = TftpConfig {
            max_retries,
            timeout,
            max_packet_size,
            ..TftpConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
