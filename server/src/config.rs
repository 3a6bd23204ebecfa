//! Startup configuration for a cluster process
//!
//! Command line arguments (with environment fallbacks) are converted into a
//! validated [`ServerConfig`]. Validation is synchronous and happens before
//! any network activity, so a misconfigured process fails fast.

use crate::error::{Error, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Command line arguments of the `server` binary
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Coordination store address (the `coordinator` binary)
    #[clap(short, long, env = "SESSION_STORE_ADDR")]
    pub store: Option<String>,
    /// Client-facing WebSocket address to listen on
    #[clap(short, long, env = "SESSION_LISTEN_ADDR")]
    pub listen: Option<SocketAddr>,
    /// Address peers use to forward messages to this process
    #[clap(short, long, env = "SESSION_PEER_ADDR")]
    pub peer: Option<SocketAddr>,
    /// Maximum concurrent client connections
    #[clap(long, default_value = "1024")]
    pub max_connections: usize,
    /// Maximum outstanding correlated requests per connection
    #[clap(long, default_value = "64")]
    pub max_pending_replies: usize,
    /// Seconds before an unanswered request is failed
    #[clap(long, default_value = "30")]
    pub reply_timeout_secs: u64,
}

impl Args {
    /// Returns the coordination store address, which is mandatory
    pub fn store_addr(&self) -> Result<&str> {
        self.store
            .as_deref()
            .filter(|addr| !addr.trim().is_empty())
            .ok_or_else(|| Error::Configuration("coordination store address is required".into()))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .ok_or_else(|| Error::Configuration("client listen address is required".into()))
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        let config = ServerConfig {
            peer_addr: self.peer,
            max_connections: self.max_connections,
            max_pending_replies: self.max_pending_replies,
            reply_timeout: Duration::from_secs(self.reply_timeout_secs),
            ..ServerConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

/// Tunables for one cluster process
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address of the inter-process link listener
    pub peer_addr: Option<SocketAddr>,
    pub max_connections: usize,
    pub max_pending_replies: usize,
    pub reply_timeout: Duration,
    /// How often expired correlation slots are swept
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            peer_addr: None,
            max_connections: 1024,
            max_pending_replies: 64,
            reply_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(250),
        }
    }
}

impl ServerConfig {
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_addr.is_none() {
            return Err(Error::Configuration("peer link address is required".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Configuration("max_connections must be positive".into()));
        }
        if self.max_pending_replies == 0 {
            return Err(Error::Configuration(
                "max_pending_replies must be positive".into(),
            ));
        }
        if self.reply_timeout.is_zero() || self.sweep_interval.is_zero() {
            return Err(Error::Configuration("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_store_address_is_configuration_error() {
        let args = Args::try_parse_from(["server", "--listen", "127.0.0.1:9000"]).unwrap();
        let args = Args { store: None, ..args };

        assert!(matches!(args.store_addr(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_full_arguments() {
        let args = Args::try_parse_from([
            "server",
            "--store",
            "127.0.0.1:7000",
            "--listen",
            "127.0.0.1:9000",
            "--peer",
            "127.0.0.1:9100",
            "--reply-timeout-secs",
            "5",
        ])
        .unwrap();

        assert_eq!(args.store_addr().unwrap(), "127.0.0.1:7000");
        let config = args.server_config().unwrap();
        assert_eq!(config.reply_timeout, Duration::from_secs(5));
        assert_eq!(config.peer_addr, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn test_missing_peer_address_fails_validation() {
        let config = ServerConfig::default();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_zero_capacity_fails_validation() {
        let config = ServerConfig {
            max_pending_replies: 0,
            ..ServerConfig::default().with_peer_addr("127.0.0.1:0".parse().unwrap())
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_with_peer_is_valid() {
        let config = ServerConfig::default().with_peer_addr("127.0.0.1:0".parse().unwrap());
        assert!(config.validate().is_ok());
    }
}
