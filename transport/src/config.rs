//! Configuration of the transport.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
};
use turnstone_pool::AllocatorConfig;

/// PEM files holding the certificate chain and private key served over TLS.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

/// Maps IPv4 servers to a public address for peers outside their subnet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatConfig {
    /// Address reported to peers outside the subnet.
    pub public: Ipv4Addr,
    /// Mask applied to the server and peer addresses to compare subnets.
    pub mask: Ipv4Addr,
}

/// Configuration for a [crate::Manager].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Upper bound on buffer memory, in MiB.
    pub max_memory_mb: usize,
    /// Size of the first arena, in MiB. Defaults to an eighth of the maximum.
    pub initial_memory_mb: Option<usize>,
    /// Size of every further arena, in MiB. Defaults to a sixteenth of the
    /// maximum.
    pub extra_memory_mb: Option<usize>,
    /// Receives kept outstanding per stream connection.
    pub tcp_queue_size: usize,
    /// Accepts kept outstanding per stream server.
    pub tcp_min_accept_backlog: usize,
    /// Upper bound on outstanding accepts once disconnected sockets are relisted.
    pub tcp_max_accept_backlog: usize,
    /// Receives kept outstanding per datagram server.
    pub udp_queue_size: usize,
    /// Certificate served by TLS servers.
    pub tls: Option<TlsConfig>,
    /// Lowest port handed out by [crate::Manager::bind_range].
    pub min_port: u16,
    /// Highest port handed out by [crate::Manager::bind_range].
    pub max_port: u16,
    /// Optional public address mapping.
    pub nat: Option<NatConfig>,
    /// Interface addresses to serve on.
    pub addresses: Vec<IpAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_memory_mb: 256,
            initial_memory_mb: None,
            extra_memory_mb: None,
            tcp_queue_size: 8,
            tcp_min_accept_backlog: 1024,
            tcp_max_accept_backlog: 2048,
            udp_queue_size: 16,
            tls: None,
            min_port: 49152,
            max_port: 65535,
            nat: None,
            addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        }
    }
}

impl Config {
    // Setters
    /// See [Config]
    pub fn with_memory_mb(mut self, max: usize, initial: usize, extra: usize) -> Self {
        self.max_memory_mb = max;
        self.initial_memory_mb = Some(initial);
        self.extra_memory_mb = Some(extra);
        self
    }
    /// See [Config]
    pub const fn with_tcp_queue_size(mut self, tcp_queue_size: usize) -> Self {
        self.tcp_queue_size = tcp_queue_size;
        self
    }
    /// See [Config]
    pub const fn with_accept_backlog(mut self, min: usize, max: usize) -> Self {
        self.tcp_min_accept_backlog = min;
        self.tcp_max_accept_backlog = max;
        self
    }
    /// See [Config]
    pub const fn with_udp_queue_size(mut self, udp_queue_size: usize) -> Self {
        self.udp_queue_size = udp_queue_size;
        self
    }
    /// See [Config]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
    /// See [Config]
    pub const fn with_port_range(mut self, min_port: u16, max_port: u16) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }
    /// See [Config]
    pub const fn with_nat(mut self, nat: NatConfig) -> Self {
        self.nat = Some(nat);
        self
    }
    /// See [Config]
    pub fn with_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.addresses = addresses;
        self
    }

    /// Returns the allocator configuration implied by the memory settings.
    pub fn allocator(&self) -> AllocatorConfig {
        AllocatorConfig::with_arenas_mb(
            self.max_memory_mb,
            self.initial_memory_mb.unwrap_or(self.max_memory_mb / 8),
            self.extra_memory_mb.unwrap_or(self.max_memory_mb / 16),
        )
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<(), Error> {
        self.allocator()
            .validate()
            .map_err(|err| Error::InvalidConfig(err.to_string()))?;
        if self.tcp_queue_size == 0 {
            return Err(Error::InvalidConfig("tcp_queue_size must be positive".into()));
        }
        if self.udp_queue_size == 0 {
            return Err(Error::InvalidConfig("udp_queue_size must be positive".into()));
        }
        if self.tcp_min_accept_backlog == 0 {
            return Err(Error::InvalidConfig(
                "tcp_min_accept_backlog must be positive".into(),
            ));
        }
        if self.tcp_min_accept_backlog > self.tcp_max_accept_backlog {
            return Err(Error::InvalidConfig(
                "tcp_min_accept_backlog exceeds tcp_max_accept_backlog".into(),
            ));
        }
        if self.min_port == 0 || self.min_port > self.max_port {
            return Err(Error::InvalidConfig(format!(
                "invalid port range {}..={}",
                self.min_port, self.max_port
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstone_pool::MB;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        let allocator = config.allocator();
        assert_eq!(allocator.ceiling, 256 * MB);
        assert_eq!(allocator.initial_arena, 32 * MB);
        assert_eq!(allocator.extra_arena, 16 * MB);
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
max_memory_mb: 64
tcp_queue_size: 4
addresses: ["0.0.0.0", "::1"]
tls:
  certificate: cert.pem
  private_key: key.pem
nat:
  public: 203.0.113.7
  mask: 255.255.255.0
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_memory_mb, 64);
        assert_eq!(config.tcp_queue_size, 4);
        assert_eq!(config.udp_queue_size, 16);
        assert_eq!(config.addresses.len(), 2);
        assert_eq!(
            config.tls.as_ref().unwrap().certificate,
            PathBuf::from("cert.pem")
        );
        assert_eq!(config.nat.unwrap().public, Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(config.allocator().initial_arena, 8 * MB);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_yaml::from_str::<Config>("max_memory: 1").is_err());
    }

    #[test]
    fn test_invalid_configs() {
        assert!(Config::default().with_tcp_queue_size(0).validate().is_err());
        assert!(Config::default()
            .with_accept_backlog(10, 5)
            .validate()
            .is_err());
        assert!(Config::default().with_port_range(9000, 8000).validate().is_err());
        assert!(Config::default().with_memory_mb(1, 1, 1).validate().is_ok());
        assert!(Config::default().with_memory_mb(4, 8, 1).validate().is_err());
    }

    #[test]
    fn test_oversized_memory_is_invalid() {
        let yaml = format!("max_memory_mb: {}", usize::MAX);
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
