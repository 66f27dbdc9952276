//! Stream server (plain TCP, or TLS when a server configuration is given).

use super::{Environment, FakeEndpoint};
use crate::{
    backlog::{AcceptBacklog, SocketReuse},
    connection::{Connection, ConnectionId, Issue},
    descriptor::Operation,
    handler::Verdict,
    security::SecurityContext,
    signal::{Signal, Stopper},
    table::Table,
    tls::TlsContext,
    Error, IoDescriptor, ServerEndpoint,
};
use rustls::ServerConfig;
use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};
use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

/// Attempts to dial from the server's own port before falling back to an
/// ephemeral one.
const CONNECT_RETRIES: usize = 4;

/// Pause after a receive could not get a buffer.
const ALLOCATION_BACKOFF: Duration = Duration::from_millis(10);

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

fn listen(address: SocketAddr, backlog: usize) -> io::Result<TcpListener> {
    let socket = Socket::new(
        Domain::for_address(address),
        Type::STREAM,
        Some(SocketProtocol::TCP),
    )?;
    if address.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    TcpListener::from_std(socket.into())
}

/// A TCP server.
///
/// Keeps `tcp_min_accept_backlog` accepts outstanding and one [Connection]
/// per remote address. Every connection runs `tcp_queue_size` receive
/// workers whose completions are delivered to the handler in order.
pub struct TcpServer {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: ServerEndpoint,
    fake: Option<FakeEndpoint>,
    environment: Arc<Environment>,
    tls: Option<Arc<ServerConfig>>,
    listener: TcpListener,
    connections: Table<SocketAddr, Connection>,
    backlog: AcceptBacklog,
    reuse: SocketReuse,
    stopper: Mutex<Stopper>,
}

impl TcpServer {
    pub(crate) fn bind(
        endpoint: ServerEndpoint,
        fake: Option<FakeEndpoint>,
        environment: Arc<Environment>,
        tls: Option<Arc<ServerConfig>>,
    ) -> Result<Self, Error> {
        let config = &environment.config;
        let (min, max) = (config.tcp_min_accept_backlog, config.tcp_max_accept_backlog);
        let listener = listen(endpoint.address, max)?;
        let endpoint = ServerEndpoint::new(endpoint.protocol, listener.local_addr()?);

        let inner = Arc::new(Inner {
            endpoint,
            fake,
            environment,
            tls,
            listener,
            connections: Table::new(),
            backlog: AcceptBacklog::new(min, max),
            reuse: SocketReuse::new(min < max),
            stopper: Mutex::new(Stopper::new()),
        });
        while inner.backlog.reserve_to_min() {
            inner.spawn_acceptor();
        }
        debug!(%endpoint, backlog = min, "listening");
        Ok(Self { inner })
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        self.inner.endpoint
    }

    pub fn fake(&self) -> Option<FakeEndpoint> {
        self.inner.fake
    }

    /// Returns the number of open connections.
    pub fn connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// Returns the number of outstanding accepts.
    pub fn outstanding_accepts(&self) -> usize {
        self.inner.backlog.outstanding()
    }

    pub(crate) async fn send(&self, mut descriptor: IoDescriptor) -> Result<(), Error> {
        let inner = &self.inner;
        inner
            .environment
            .handler
            .before_send(&inner.endpoint, &mut descriptor);
        let result = inner.write(&descriptor).await;
        if let Err(err) = &result {
            debug!(?err, remote = ?descriptor.remote(), "send failed");
        }
        inner
            .environment
            .complete_send(&inner.endpoint, descriptor, &result);
        result
    }

    pub(crate) async fn stop(&self) {
        let completion = self.inner.lock_stopper().stop();
        for (_, connection) in self.inner.connections.drain() {
            self.inner.end(&connection);
        }
        let _ = completion.await;
        debug!(endpoint = %self.inner.endpoint, "stopped");
    }
}

impl Inner {
    fn lock_stopper(&self) -> MutexGuard<'_, Stopper> {
        self.stopper.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stopped(&self) -> Signal {
        self.lock_stopper().stopped()
    }

    fn local_endpoint_for(&self, remote: SocketAddr) -> ServerEndpoint {
        match self.fake {
            Some(fake) if fake.applies_to(remote) => fake.endpoint(),
            _ => self.endpoint,
        }
    }

    /// Spawns an acceptor for an accept already reserved in the backlog.
    fn spawn_acceptor(self: &Arc<Self>) {
        let signal = self.stopped();
        tokio::spawn(self.clone().accept_loop(signal));
    }

    async fn accept_loop(self: Arc<Self>, mut signal: Signal) {
        loop {
            let accepted = tokio::select! {
                _ = &mut signal => break,
                accepted = self.listener.accept() => accepted,
            };
            let keep = self.backlog.on_accepted();
            match accepted {
                Ok((stream, remote)) => {
                    debug!(?remote, "accepted connection");
                    if let Err(err) = self.register(stream, true) {
                        warn!(?err, ?remote, "failed to set up connection");
                    }
                }
                Err(err) => {
                    warn!(?err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
            if !keep {
                // Retired: the backlog already dropped this accept.
                return;
            }
        }
        self.backlog.release();
    }

    /// Wraps `stream` in a [Connection], replaces any connection to the same
    /// remote and starts its receive workers.
    fn register(
        self: &Arc<Self>,
        stream: TcpStream,
        accepted: bool,
    ) -> Result<Arc<Connection>, Error> {
        if let Err(err) = stream.set_nodelay(true) {
            warn!(?err, "failed to set TCP_NODELAY");
        }
        let security: Option<Box<dyn SecurityContext>> = match &self.tls {
            Some(config) => Some(Box::new(TlsContext::new(config.clone())?)),
            None => None,
        };
        let environment = &self.environment;
        let queue_size = environment.config.tcp_queue_size;
        let connection = Arc::new(Connection::new(
            self.endpoint,
            stream,
            accepted,
            queue_size,
            security,
            environment.context.allocator().clone(),
        )?);

        if let Some(displaced) = self.connections.replace(connection.remote(), connection.clone()) {
            debug!(remote = ?displaced.remote(), id = %displaced.id(), "replaced connection");
            self.end(&displaced);
        }
        if accepted {
            environment.metrics.accepted.inc();
        }
        environment.handler.connected(&connection.info());

        let signal = self.stopped();
        for _ in 0..queue_size {
            tokio::spawn(self.clone().receive_loop(connection.clone(), signal.clone()));
        }
        Ok(connection)
    }

    async fn receive_loop(self: Arc<Self>, connection: Arc<Connection>, mut signal: Signal) {
        loop {
            let open = tokio::select! {
                _ = &mut signal => break,
                open = self.receive(&connection) => open,
            };
            if !open {
                break;
            }
        }
    }

    /// Issues one receive and delivers whatever has become deliverable.
    /// Returns false once the connection is closed.
    async fn receive(self: &Arc<Self>, connection: &Arc<Connection>) -> bool {
        if !connection.acquire_credit().await {
            return false;
        }
        if let Err(err) = connection.readable().await {
            debug!(?err, "readiness failed");
            connection.return_credits(1);
            self.end(connection);
            return false;
        }

        let context = &self.environment.context;
        let mut descriptor = context.descriptor();
        if let Err(err) = descriptor.allocate(context.allocator()) {
            warn!(?err, "no buffer for receive");
            context.recycle(descriptor);
            connection.return_credits(1);
            tokio::time::sleep(ALLOCATION_BACKOFF).await;
            return true;
        }
        match connection.issue_receive(&mut descriptor) {
            Issue::Completed => {}
            Issue::WouldBlock => {
                context.recycle(descriptor);
                connection.return_credits(1);
                return true;
            }
            Issue::Closed => {
                context.recycle(descriptor);
                return false;
            }
        }

        descriptor.set_operation(Operation::Receive);
        descriptor.set_local(self.local_endpoint_for(connection.remote()));
        descriptor.set_remote(connection.remote());
        descriptor.set_connection(connection.id());
        if let Err(descriptor) = connection.deposit(descriptor) {
            context.recycle(descriptor);
            return false;
        }
        self.deliver(connection).await;
        !connection.is_closed()
    }

    /// Drains the connection's ring into the handler.
    async fn deliver(self: &Arc<Self>, connection: &Arc<Connection>) {
        let environment = &self.environment;
        let context = &environment.context;
        let mut end = false;
        let mut token = false;

        let delivered = connection.drain(|_, descriptor| {
            if let Some(kind) = descriptor.error() {
                debug!(?kind, remote = ?connection.remote(), "receive ended connection");
                context.recycle(descriptor);
                end = true;
                return false;
            }
            if !connection.is_secure() {
                if environment.dispatch(&self.endpoint, descriptor) == Verdict::Reject {
                    end = true;
                }
                return !end;
            }

            let unsealed = connection.unseal(context, &descriptor);
            context.recycle(descriptor);
            match unsealed {
                Ok(unsealed) => {
                    token |= unsealed.token;
                    for plaintext in unsealed.plaintext {
                        if end {
                            context.recycle(plaintext);
                            continue;
                        }
                        end = environment.dispatch(&self.endpoint, plaintext) == Verdict::Reject;
                    }
                }
                Err(err) => {
                    debug!(?err, remote = ?connection.remote(), "security negotiation failed");
                    end = true;
                }
            }
            !end
        });
        connection.return_credits(delivered);

        if !end && token {
            if let Err(err) = connection.flush_pending().await {
                debug!(?err, "failed to flush handshake");
                end = true;
            }
        }
        if end {
            self.end(connection);
        }
    }

    /// Ends `connection` once. The winner fires `ended`, shuts the socket
    /// down and, for accepted sockets, may grow the accept backlog.
    fn end(self: &Arc<Self>, connection: &Arc<Connection>) {
        self.connections.remove_if_same(&connection.remote(), connection);
        let environment = &self.environment;
        if !connection.close(&environment.context) {
            return;
        }
        environment.metrics.ended.inc();
        environment.handler.ended(&connection.info());

        let graceful = match connection.shutdown() {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::Unsupported => {
                self.reuse.disable();
                false
            }
            Err(err) => {
                debug!(?err, "shutdown failed");
                false
            }
        };
        if graceful
            && connection.is_accepted()
            && self.reuse.is_enabled()
            && self.backlog.reserve_to_max()
        {
            self.spawn_acceptor();
        }
    }

    async fn write(self: &Arc<Self>, descriptor: &IoDescriptor) -> Result<(), Error> {
        let remote = descriptor.remote().ok_or(Error::NotConnected)?;
        let id = descriptor.connection();

        let mut existing = self.connections.get(&remote);
        if let Some(connection) = &existing {
            if !connection.is_connected() {
                debug!(?remote, "dropping stale connection");
                self.end(connection);
                existing = None;
            }
        }
        let connection = match existing {
            Some(connection) if id.is_wildcard() || connection.id() == id => connection,
            Some(_) => return Err(Error::NotConnected),
            None if id == ConnectionId::ANY_NEW => self.connect(remote).await?,
            None => return Err(Error::NotConnected),
        };
        connection.write(descriptor.outgoing_data()).await
    }

    /// Opens an outbound connection from the server's address.
    async fn connect(self: &Arc<Self>, remote: SocketAddr) -> Result<Arc<Connection>, Error> {
        let mut local = self.endpoint.address;
        let mut attempts = 0;
        loop {
            let socket = if remote.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            let bound = socket.bind(local);
            let connected = match bound {
                Ok(()) => socket.connect(remote).await,
                Err(err) => Err(err),
            };
            match connected {
                Ok(stream) => {
                    debug!(?remote, "connected");
                    return self.register(stream, false);
                }
                Err(err) if err.kind() == ErrorKind::AddrInUse => {
                    attempts += 1;
                    if attempts >= CONNECT_RETRIES {
                        if local.port() == 0 {
                            return Err(err.into());
                        }
                        // The port is held by the listener; use any port on the
                        // same address.
                        local.set_port(0);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::tests::test_context,
        handler::{ConnectionInfo, Handler},
        server::Metrics,
        Config, Protocol,
    };
    use prometheus_client::registry::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        sync::mpsc,
    };

    /// Forwards received payloads and counts connection events.
    struct Collector {
        received: mpsc::UnboundedSender<(SocketAddr, ConnectionId, Vec<u8>)>,
        connected: AtomicUsize,
        ended: AtomicUsize,
        reject: bool,
    }

    impl Handler for Collector {
        fn received(&self, _: &ServerEndpoint, descriptor: &mut Option<IoDescriptor>) -> Verdict {
            let descriptor = descriptor.as_ref().unwrap();
            let _ = self.received.send((
                descriptor.remote().unwrap(),
                descriptor.connection(),
                descriptor.transferred_data().to_vec(),
            ));
            if self.reject {
                Verdict::Reject
            } else {
                Verdict::Processed
            }
        }

        fn connected(&self, _: &ConnectionInfo) {
            self.connected.fetch_add(1, Ordering::Relaxed);
        }

        fn ended(&self, _: &ConnectionInfo) {
            self.ended.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn server(
        reject: bool,
    ) -> (
        TcpServer,
        Arc<Collector>,
        mpsc::UnboundedReceiver<(SocketAddr, ConnectionId, Vec<u8>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let collector = Arc::new(Collector {
            received: tx,
            connected: AtomicUsize::new(0),
            ended: AtomicUsize::new(0),
            reject,
        });
        let (failures, _) = mpsc::unbounded_channel();
        let environment = Arc::new(Environment {
            context: test_context(),
            handler: collector.clone(),
            config: Config::default()
                .with_accept_backlog(2, 4)
                .with_tcp_queue_size(4),
            tls: None,
            failures,
            metrics: Metrics::new(&mut Registry::default()),
        });
        let endpoint = ServerEndpoint::new(Protocol::Tcp, "127.0.0.1:0".parse().unwrap());
        let server = TcpServer::bind(endpoint, None, environment, None).unwrap();
        (server, collector, rx)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stream_arrives_in_order() {
        let (server, collector, mut rx) = server(false);
        assert_ne!(server.endpoint().address.port(), 0);
        assert_eq!(server.outstanding_accepts(), 2);

        let mut client = TcpStream::connect(server.endpoint().address).await.unwrap();
        let mut expected = Vec::new();
        for i in 0..100u32 {
            let chunk = i.to_be_bytes();
            client.write_all(&chunk).await.unwrap();
            expected.extend_from_slice(&chunk);
        }

        let mut received = Vec::new();
        while received.len() < expected.len() {
            let (_, _, payload) = rx.recv().await.unwrap();
            received.extend_from_slice(&payload);
        }
        assert_eq!(received, expected);
        assert_eq!(collector.connected.load(Ordering::Relaxed), 1);
        assert_eq!(server.connections(), 1);

        drop(client);
        eventually(|| collector.ended.load(Ordering::Relaxed) == 1).await;
        assert_eq!(server.connections(), 0);
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reply_on_accepted_connection() {
        let (server, _, mut rx) = server(false);
        let mut client = TcpStream::connect(server.endpoint().address).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let (remote, id, payload) = rx.recv().await.unwrap();
        assert_eq!(payload, b"ping");

        let context = &server.inner.environment.context;
        let mut reply = context.descriptor();
        reply.copy_from(context.allocator(), b"pong").unwrap();
        reply.set_remote(remote);
        reply.set_connection(id);
        server.send(reply).await.unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // A connection id that does not match is refused.
        let mut stale = context.descriptor();
        stale.copy_from(context.allocator(), b"x").unwrap();
        stale.set_remote(remote);
        stale.set_connection(ConnectionId::next());
        assert!(matches!(server.send(stale).await, Err(Error::NotConnected)));
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reject_ends_connection() {
        let (server, collector, mut rx) = server(true);
        let mut client = TcpStream::connect(server.endpoint().address).await.unwrap();
        client.write_all(b"bad").await.unwrap();
        rx.recv().await.unwrap();
        eventually(|| collector.ended.load(Ordering::Relaxed) == 1).await;

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_without_connection() {
        let (server, _, _rx) = server(false);
        let context = &server.inner.environment.context;
        let mut descriptor = context.descriptor();
        descriptor.copy_from(context.allocator(), b"x").unwrap();
        descriptor.set_remote("127.0.0.1:9".parse().unwrap());
        descriptor.set_connection(ConnectionId::ANY);
        assert!(matches!(
            server.send(descriptor).await,
            Err(Error::NotConnected)
        ));
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_outbound_connect() {
        let (server, collector, mut rx) = server(false);
        let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let context = &server.inner.environment.context;
        let mut descriptor = context.descriptor();
        descriptor.copy_from(context.allocator(), b"hello").unwrap();
        descriptor.set_remote(peer.local_addr().unwrap());
        server.send(descriptor).await.unwrap();

        let (mut stream, _) = peer.accept().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(collector.connected.load(Ordering::Relaxed), 1);

        // Replies flow back through the same connection.
        stream.write_all(b"back").await.unwrap();
        let (_, _, payload) = rx.recv().await.unwrap();
        assert_eq!(payload, b"back");
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_ends_connections() {
        let (server, collector, _rx) = server(false);
        let _client = TcpStream::connect(server.endpoint().address).await.unwrap();
        eventually(|| collector.connected.load(Ordering::Relaxed) == 1).await;
        server.stop().await;
        assert_eq!(collector.ended.load(Ordering::Relaxed), 1);
        assert_eq!(server.connections(), 0);
    }
}
