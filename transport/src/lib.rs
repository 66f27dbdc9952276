//! TCP, UDP, and TLS transport servers that deliver received bytes in order,
//! in pooled buffers.
//!
//! # Overview
//!
//! A [Manager] owns one server per interface address and [ProtocolPort]. Every
//! server draws [IoDescriptor]s from a shared [Context] (a descriptor pool plus
//! a [turnstone_pool::SegmentAllocator]), receives into them, and hands them to
//! the application [Handler] in the order the receives were issued.
//!
//! Stream servers keep a [connection::Connection] per remote address. Each
//! connection keeps up to `tcp_queue_size` receives outstanding and reorders
//! their completions through a [ring::ReceiveRing]. Teardown is idempotent and
//! returns every buffer still held by the ring.
//!
//! TLS is the TCP server with a [security::SecurityContext] installed on every
//! connection (see [tls::TlsContext]).

use serde::{Deserialize, Serialize};
use std::{fmt, io::Error as IoError, net::SocketAddr, str::FromStr};
use thiserror::Error;
use turnstone_pool::AllocError;

pub mod backlog;
pub mod config;
pub mod connection;
pub mod context;
pub mod descriptor;
pub mod handler;
pub mod manager;
pub mod ring;
pub mod security;
pub mod server;
pub mod signal;
pub mod spinlock;
pub mod stream_buffer;
pub mod table;
pub mod tls;

pub use config::{Config, NatConfig, TlsConfig};
pub use connection::ConnectionId;
pub use context::Context;
pub use descriptor::IoDescriptor;
pub use handler::{ConnectionInfo, Dispatcher, Handler, InfoKind, ServerInfo, Verdict};
pub use manager::{AddressSource, Manager, StaticAddresses};

/// Errors that can occur when operating the transport.
#[derive(Error, Debug)]
pub enum Error {
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
    #[error("io error: {0}")]
    Io(#[from] IoError),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
    #[error("invalid protocol port: {0}")]
    InvalidProtocolPort(String),
    #[error("buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("no server for {0}")]
    NetworkDown(ServerEndpoint),
    #[error("not connected")]
    NotConnected,
    #[error("no free port in range")]
    TooManyOpenSockets,
    #[error("no interface address available")]
    SystemNotReady,
    #[error("missing certificate")]
    MissingCertificate,
    #[error("closed")]
    Closed,
}

impl Error {
    /// Returns true if the error reports an address already in use.
    pub fn is_address_in_use(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == std::io::ErrorKind::AddrInUse)
    }
}

/// Transport protocol of a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
    Tls,
}

impl Protocol {
    /// Returns true for connection-oriented protocols.
    pub const fn is_stream(self) -> bool {
        matches!(self, Self::Tcp | Self::Tls)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Tls => "tls",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            "tls" => Ok(Self::Tls),
            _ => Err(Error::UnknownProtocol(s.to_string())),
        }
    }
}

/// A protocol and port to serve on every interface address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolPort {
    pub protocol: Protocol,
    pub port: u16,
}

impl ProtocolPort {
    pub const fn new(protocol: Protocol, port: u16) -> Self {
        Self { protocol, port }
    }
}

impl fmt::Display for ProtocolPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.port)
    }
}

impl FromStr for ProtocolPort {
    type Err = Error;

    /// Parses `protocol:port`, e.g. `tcp:3478`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, port) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidProtocolPort(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| Error::InvalidProtocolPort(s.to_string()))?;
        Ok(Self::new(protocol.parse()?, port))
    }
}

/// The address a server is bound to, qualified by its protocol.
///
/// Two endpoints with the same socket address but different protocols are
/// distinct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerEndpoint {
    pub protocol: Protocol,
    pub address: SocketAddr,
}

impl ServerEndpoint {
    pub const fn new(protocol: Protocol, address: SocketAddr) -> Self {
        Self { protocol, address }
    }

    /// Returns the protocol and port of the endpoint.
    pub const fn protocol_port(&self) -> ProtocolPort {
        ProtocolPort::new(self.protocol, self.address.port())
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}
