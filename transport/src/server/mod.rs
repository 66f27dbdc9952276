//! Stream and datagram servers.

use crate::{
    handler::{Handler, ServerInfo, Verdict},
    Config, Context, Error, IoDescriptor, NatConfig, Protocol, ServerEndpoint,
};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use rustls::ServerConfig;
use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::sync::mpsc;

pub mod tcp;
pub mod udp;

pub use tcp::TcpServer;
pub use udp::UdpServer;

/// A public address reported in place of a server's own address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FakeEndpoint {
    endpoint: ServerEndpoint,
    mask: u32,
    subnet: u32,
}

impl FakeEndpoint {
    /// Derives the fake endpoint of `real`. Only IPv4 servers get one.
    pub fn new(real: ServerEndpoint, nat: &NatConfig) -> Option<Self> {
        let IpAddr::V4(address) = real.address.ip() else {
            return None;
        };
        let mask = u32::from(nat.mask);
        Some(Self {
            endpoint: ServerEndpoint::new(
                real.protocol,
                SocketAddr::new(IpAddr::V4(nat.public), real.address.port()),
            ),
            mask,
            subnet: u32::from(address) & mask,
        })
    }

    pub const fn endpoint(&self) -> ServerEndpoint {
        self.endpoint
    }

    /// Returns true if `remote` should see the fake endpoint: an IPv4 peer
    /// that is neither loopback nor inside the server's subnet.
    pub fn applies_to(&self, remote: SocketAddr) -> bool {
        match remote.ip() {
            IpAddr::V4(ip) => !ip.is_loopback() && u32::from(ip) & self.mask != self.subnet,
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(ip) => !ip.is_loopback() && u32::from(ip) & self.mask != self.subnet,
                None => false,
            },
        }
    }

    /// Returns the subnet of the real server.
    pub fn subnet(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.subnet)
    }
}

pub(crate) struct Metrics {
    pub servers: Gauge,
    pub accepted: Counter,
    pub ended: Counter,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            servers: Gauge::default(),
            accepted: Counter::default(),
            ended: Counter::default(),
        };
        registry.register("servers", "Number of running servers", metrics.servers.clone());
        registry.register(
            "connections_accepted",
            "Total number of stream connections accepted",
            metrics.accepted.clone(),
        );
        registry.register(
            "connections_ended",
            "Total number of stream connections ended",
            metrics.ended.clone(),
        );
        metrics
    }
}

/// State shared by every server of a manager.
pub(crate) struct Environment {
    pub context: Arc<Context>,
    pub handler: Arc<dyn Handler>,
    pub config: Config,
    pub tls: Option<Arc<ServerConfig>>,
    pub failures: mpsc::UnboundedSender<ServerInfo>,
    pub metrics: Metrics,
}

impl Environment {
    /// Offers a received descriptor to the handler and recycles it unless the
    /// handler took it.
    pub fn dispatch(&self, server: &ServerEndpoint, descriptor: IoDescriptor) -> Verdict {
        let mut slot = Some(descriptor);
        let verdict = self.handler.received(server, &mut slot);
        if let Some(descriptor) = slot {
            self.context.recycle(descriptor);
        }
        verdict
    }

    /// Records the outcome of a send on its descriptor and emits `sent`.
    pub fn complete_send(
        &self,
        server: &ServerEndpoint,
        mut descriptor: IoDescriptor,
        result: &Result<(), Error>,
    ) {
        descriptor.set_operation(crate::descriptor::Operation::Send);
        descriptor.set_error(result.as_ref().err().map(error_kind));
        let mut slot = Some(descriptor);
        self.handler.sent(server, &mut slot);
        if let Some(descriptor) = slot {
            self.context.recycle(descriptor);
        }
    }
}

/// Returns the I/O error kind recorded on a descriptor for `err`.
pub fn error_kind(err: &Error) -> ErrorKind {
    match err {
        Error::Io(err) => err.kind(),
        Error::NotConnected | Error::Closed => ErrorKind::NotConnected,
        Error::NetworkDown(_) => ErrorKind::NetworkDown,
        Error::Alloc(_) => ErrorKind::OutOfMemory,
        _ => ErrorKind::Other,
    }
}

/// A running server.
pub enum Server {
    Tcp(TcpServer),
    Udp(UdpServer),
}

impl Server {
    /// Binds `endpoint` and starts serving it.
    pub(crate) fn bind(
        endpoint: ServerEndpoint,
        fake: Option<FakeEndpoint>,
        environment: Arc<Environment>,
    ) -> Result<Self, Error> {
        match endpoint.protocol {
            Protocol::Udp => Ok(Self::Udp(UdpServer::bind(endpoint, fake, environment)?)),
            Protocol::Tcp => Ok(Self::Tcp(TcpServer::bind(endpoint, fake, environment, None)?)),
            Protocol::Tls => {
                let tls = environment.tls.clone().ok_or(Error::MissingCertificate)?;
                Ok(Self::Tcp(TcpServer::bind(
                    endpoint,
                    fake,
                    environment,
                    Some(tls),
                )?))
            }
        }
    }

    /// Returns the endpoint the server is bound to.
    pub fn endpoint(&self) -> ServerEndpoint {
        match self {
            Self::Tcp(server) => server.endpoint(),
            Self::Udp(server) => server.endpoint(),
        }
    }

    pub fn fake(&self) -> Option<FakeEndpoint> {
        match self {
            Self::Tcp(server) => server.fake(),
            Self::Udp(server) => server.fake(),
        }
    }

    /// Sends the outgoing window of `descriptor` to its remote. The handler
    /// sees `before_send` and `sent` either way.
    pub async fn send(&self, descriptor: IoDescriptor) -> Result<(), Error> {
        match self {
            Self::Tcp(server) => server.send(descriptor).await,
            Self::Udp(server) => server.send(descriptor).await,
        }
    }

    /// Stops every task of the server and waits for them to exit.
    pub async fn stop(&self) {
        match self {
            Self::Tcp(server) => server.stop().await,
            Self::Udp(server) => server.stop().await,
        }
    }
}
