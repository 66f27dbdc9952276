//! Datagram server.

use super::{Environment, FakeEndpoint};
use crate::{
    connection::ConnectionId,
    descriptor::Operation,
    handler::ServerInfo,
    signal::{Signal, Stopper},
    Error, IoDescriptor, ServerEndpoint,
};
use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};
use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::net::UdpSocket;
use tracing::{debug, error, warn};

/// Pause after a receive could not get a buffer.
const ALLOCATION_BACKOFF: Duration = Duration::from_millis(10);

fn bind_socket(address: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(
        Domain::for_address(address),
        Type::DGRAM,
        Some(SocketProtocol::UDP),
    )?;
    if address.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    UdpSocket::from_std(socket.into())
}

/// A UDP server with `udp_queue_size` receives outstanding.
///
/// A socket error fails the whole server: the worker that saw it reports a
/// [ServerInfo] to the manager, which removes the server.
pub struct UdpServer {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: ServerEndpoint,
    fake: Option<FakeEndpoint>,
    environment: Arc<Environment>,
    socket: UdpSocket,
    stopper: Mutex<Stopper>,
}

impl UdpServer {
    pub(crate) fn bind(
        endpoint: ServerEndpoint,
        fake: Option<FakeEndpoint>,
        environment: Arc<Environment>,
    ) -> Result<Self, Error> {
        let socket = bind_socket(endpoint.address)?;
        let endpoint = ServerEndpoint::new(endpoint.protocol, socket.local_addr()?);
        let workers = environment.config.udp_queue_size;
        let inner = Arc::new(Inner {
            endpoint,
            fake,
            environment,
            socket,
            stopper: Mutex::new(Stopper::new()),
        });
        let signal = inner.lock_stopper().stopped();
        for _ in 0..workers {
            tokio::spawn(inner.clone().receive_loop(signal.clone()));
        }
        debug!(%endpoint, workers, "listening");
        Ok(Self { inner })
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        self.inner.endpoint
    }

    pub fn fake(&self) -> Option<FakeEndpoint> {
        self.inner.fake
    }

    pub(crate) async fn send(&self, mut descriptor: IoDescriptor) -> Result<(), Error> {
        let inner = &self.inner;
        inner
            .environment
            .handler
            .before_send(&inner.endpoint, &mut descriptor);
        let result = match descriptor.remote() {
            Some(remote) => inner
                .socket
                .send_to(descriptor.outgoing_data(), remote)
                .await
                .map(|_| ())
                .map_err(Error::from),
            None => Err(Error::NotConnected),
        };
        inner
            .environment
            .complete_send(&inner.endpoint, descriptor, &result);
        result
    }

    pub(crate) async fn stop(&self) {
        let completion = self.inner.lock_stopper().stop();
        let _ = completion.await;
        debug!(endpoint = %self.inner.endpoint, "stopped");
    }
}

impl Inner {
    fn lock_stopper(&self) -> MutexGuard<'_, Stopper> {
        self.stopper.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn receive_loop(self: Arc<Self>, mut signal: Signal) {
        let environment = &self.environment;
        let context = &environment.context;
        loop {
            let mut descriptor = context.descriptor();
            if let Err(err) = descriptor.allocate(context.allocator()) {
                warn!(?err, "no buffer for receive");
                context.recycle(descriptor);
                tokio::select! {
                    _ = &mut signal => break,
                    _ = tokio::time::sleep(ALLOCATION_BACKOFF) => continue,
                }
            }

            let window = descriptor.window_mut().unwrap_or_default();
            let received = tokio::select! {
                _ = &mut signal => None,
                received = self.socket.recv_from(window) => Some(received),
            };
            let Some(received) = received else {
                context.recycle(descriptor);
                break;
            };
            match received {
                Ok((read, remote)) => {
                    descriptor.set_bytes_transferred(read);
                    descriptor.set_operation(Operation::Receive);
                    descriptor.set_remote(remote);
                    descriptor.set_local(match self.fake {
                        Some(fake) if fake.applies_to(remote) => fake.endpoint(),
                        _ => self.endpoint,
                    });
                    descriptor.set_connection(ConnectionId::ANY);

                    // Datagrams have no connection to close on rejection.
                    let _ = environment.dispatch(&self.endpoint, descriptor);
                }
                Err(err) => {
                    context.recycle(descriptor);
                    error!(?err, endpoint = %self.endpoint, "socket failed");
                    let _ = environment
                        .failures
                        .send(ServerInfo::io(self.endpoint, err.kind()));
                    break;
                }
            }
        }
    }
}
