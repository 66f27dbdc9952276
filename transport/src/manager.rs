//! Runs one server per interface address and protocol port.

use crate::{
    handler::{Handler, ServerInfo},
    server::{Environment, FakeEndpoint, Metrics, Server},
    table::Table,
    tls, Config, Context, Error, IoDescriptor, Protocol, ProtocolPort, ServerEndpoint,
};
use prometheus_client::registry::Registry;
use std::{
    collections::BTreeSet,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info, warn};

/// Supplies the interface addresses servers are bound to.
pub trait AddressSource: Send + Sync + 'static {
    fn addresses(&self) -> Vec<IpAddr>;
}

/// A fixed list of addresses.
#[derive(Clone, Debug, Default)]
pub struct StaticAddresses(pub Vec<IpAddr>);

impl AddressSource for StaticAddresses {
    fn addresses(&self) -> Vec<IpAddr> {
        self.0.clone()
    }
}

impl<F> AddressSource for F
where
    F: Fn() -> Vec<IpAddr> + Send + Sync + 'static,
{
    fn addresses(&self) -> Vec<IpAddr> {
        self()
    }
}

type AddressPredicate = Box<dyn Fn(&IpAddr) -> bool + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State reachable from the failure monitor.
struct Shared {
    environment: Arc<Environment>,
    servers: Table<ServerEndpoint, Server>,
    fakes: Table<ServerEndpoint, Server>,
}

impl Shared {
    /// Binds and registers the server for `endpoint`.
    async fn create(&self, endpoint: ServerEndpoint) -> Result<ServerEndpoint, Error> {
        let environment = &self.environment;
        let fake = environment
            .config
            .nat
            .as_ref()
            .and_then(|nat| FakeEndpoint::new(endpoint, nat));
        let server = Arc::new(Server::bind(endpoint, fake, environment.clone())?);
        let endpoint = server.endpoint();
        if !self.servers.try_add(endpoint, server.clone()) {
            // A concurrent bind registered the endpoint first.
            server.stop().await;
            return Err(std::io::Error::from(std::io::ErrorKind::AddrInUse).into());
        }
        environment.metrics.servers.inc();
        info!(%endpoint, "added server");
        environment.handler.server_added(&endpoint);
        if let Some(fake) = fake {
            self.fakes.replace(fake.endpoint(), server);
            environment.handler.server_added(&fake.endpoint());
        }
        Ok(endpoint)
    }

    /// Stops and unregisters the server for `endpoint`, if any.
    async fn remove(&self, endpoint: &ServerEndpoint) {
        if let Some(server) = self.servers.remove(endpoint) {
            self.retire(endpoint, server).await;
        }
    }

    /// Stops every server whose endpoint matches `predicate`.
    async fn remove_where(&self, mut predicate: impl FnMut(&ServerEndpoint) -> bool) {
        for (endpoint, server) in self.servers.remove_where(|endpoint, _| predicate(endpoint)) {
            self.retire(&endpoint, server).await;
        }
    }

    /// Stops a server already taken out of the server table.
    async fn retire(&self, endpoint: &ServerEndpoint, server: Arc<Server>) {
        let handler = &self.environment.handler;
        if let Some(fake) = server.fake() {
            if self.fakes.remove_if_same(&fake.endpoint(), &server) {
                handler.server_removed(&fake.endpoint());
            }
        }
        server.stop().await;
        self.environment.metrics.servers.dec();
        info!(%endpoint, "removed server");
        handler.server_removed(endpoint);
    }

    /// Removes servers that report a socket failure.
    async fn monitor(self: Arc<Self>, mut failures: mpsc::UnboundedReceiver<ServerInfo>) {
        while let Some(info) = failures.recv().await {
            error!(%info, "server failed");
            self.remove(&info.endpoint).await;
            self.environment.handler.server_info(&info);
        }
    }
}

/// Owns the servers of a node.
///
/// Protocol ports are registered with [Manager::bind] (or
/// [Manager::bind_range]); [Manager::start] then creates one server per
/// interface address and port. Ports bound while running, and ports taken
/// with [Manager::bind_range], are served immediately.
pub struct Manager {
    shared: Arc<Shared>,
    source: Box<dyn AddressSource>,
    predicate: Option<AddressPredicate>,

    ports: Mutex<BTreeSet<ProtocolPort>>,
    addresses: Mutex<Vec<IpAddr>>,
    next_port: Mutex<u16>,
    running: AtomicBool,

    failures: Mutex<Option<mpsc::UnboundedReceiver<ServerInfo>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Creates a manager for `config`, registering its metrics with
    /// `registry`. Loads the TLS certificate if one is configured.
    pub fn new(
        config: Config,
        handler: Arc<dyn Handler>,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        config.validate()?;
        let context = Context::new(config.allocator(), registry)?;
        let tls = config.tls.as_ref().map(tls::load_server_config).transpose()?;
        let metrics = Metrics::new(registry);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        let source = StaticAddresses(config.addresses.clone());
        let next_port = config.min_port;
        let environment = Arc::new(Environment {
            context,
            handler,
            config,
            tls,
            failures: failures_tx,
            metrics,
        });
        Ok(Self {
            shared: Arc::new(Shared {
                environment,
                servers: Table::new(),
                fakes: Table::new(),
            }),
            source: Box::new(source),
            predicate: None,
            ports: Mutex::new(BTreeSet::new()),
            addresses: Mutex::new(Vec::new()),
            next_port: Mutex::new(next_port),
            running: AtomicBool::new(false),
            failures: Mutex::new(Some(failures_rx)),
            monitor: Mutex::new(None),
        })
    }

    /// Replaces the configured address list.
    pub fn with_address_source(mut self, source: impl AddressSource) -> Self {
        self.source = Box::new(source);
        self
    }

    /// Only serves addresses accepted by `predicate`.
    pub fn with_address_predicate(
        mut self,
        predicate: impl Fn(&IpAddr) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.shared.environment.context
    }

    pub fn config(&self) -> &Config {
        &self.shared.environment.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns the registered protocol ports.
    pub fn ports(&self) -> Vec<ProtocolPort> {
        lock(&self.ports).iter().copied().collect()
    }

    /// Returns the endpoints of the running servers.
    pub fn servers(&self) -> Vec<ServerEndpoint> {
        let mut servers = self.shared.servers.keys();
        servers.sort();
        servers
    }

    fn query_addresses(&self) -> Vec<IpAddr> {
        let mut addresses = self.source.addresses();
        if let Some(predicate) = &self.predicate {
            addresses.retain(|address| predicate(address));
        }
        addresses.sort();
        addresses.dedup();
        addresses
    }

    /// Creates a server for every pair of `addresses` and `ports` that has
    /// none. Without `ignore_errors` the first failure undoes the servers
    /// created by this call and is returned.
    async fn add_servers(
        &self,
        addresses: &[IpAddr],
        ports: &[ProtocolPort],
        ignore_errors: bool,
    ) -> Result<(), Error> {
        let mut created = Vec::new();
        for port in ports {
            for address in addresses {
                let endpoint =
                    ServerEndpoint::new(port.protocol, SocketAddr::new(*address, port.port));
                if self.shared.servers.contains(&endpoint) {
                    continue;
                }
                match self.shared.create(endpoint).await {
                    Ok(endpoint) => created.push(endpoint),
                    Err(err) if ignore_errors => {
                        warn!(?err, %endpoint, "failed to add server");
                        self.shared
                            .environment
                            .handler
                            .server_info(&ServerInfo::message(endpoint, err.to_string()));
                    }
                    Err(err) => {
                        for endpoint in &created {
                            self.shared.remove(endpoint).await;
                        }
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Registers `port`. While running, servers for it are created on every
    /// address; if any fails the port is unregistered again.
    pub async fn bind(&self, port: ProtocolPort) -> Result<(), Error> {
        if !self.is_running() {
            self.check_protocol(port.protocol)?;
            lock(&self.ports).insert(port);
            return Ok(());
        }
        let addresses = lock(&self.addresses).clone();
        self.bind_on(port, &addresses).await
    }

    fn check_protocol(&self, protocol: Protocol) -> Result<(), Error> {
        if protocol == Protocol::Tls && self.shared.environment.tls.is_none() {
            return Err(Error::MissingCertificate);
        }
        Ok(())
    }

    /// Registers `port` and creates its servers on `addresses`. The port is
    /// unregistered again if any server fails.
    async fn bind_on(&self, port: ProtocolPort, addresses: &[IpAddr]) -> Result<(), Error> {
        self.check_protocol(port.protocol)?;
        if !lock(&self.ports).insert(port) {
            return Ok(());
        }
        if let Err(err) = self.add_servers(addresses, &[port], false).await {
            lock(&self.ports).remove(&port);
            return Err(err);
        }
        Ok(())
    }

    fn next_port(&self) -> u16 {
        let config = self.config();
        let mut next = lock(&self.next_port);
        let port = *next;
        *next = if port >= config.max_port {
            config.min_port
        } else {
            port + 1
        };
        port
    }

    /// Binds the next free port of the configured range for `protocol`.
    ///
    /// Servers for the port are created right away, even before
    /// [Manager::start], so a port held by another socket is skipped.
    pub async fn bind_range(&self, protocol: Protocol) -> Result<ProtocolPort, Error> {
        self.check_protocol(protocol)?;
        let config = self.config();
        let attempts = usize::from(config.max_port - config.min_port) + 1;
        let addresses = if self.is_running() {
            lock(&self.addresses).clone()
        } else {
            self.query_addresses()
        };
        for _ in 0..attempts {
            let port = ProtocolPort::new(protocol, self.next_port());
            if lock(&self.ports).contains(&port) {
                continue;
            }
            match self.bind_on(port, &addresses).await {
                Ok(()) => return Ok(port),
                Err(err) if err.is_address_in_use() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::TooManyOpenSockets)
    }

    /// Unregisters `port` and stops its servers.
    pub async fn unbind(&self, port: ProtocolPort) {
        lock(&self.ports).remove(&port);
        self.shared
            .remove_where(|endpoint| endpoint.protocol_port() == port)
            .await;
    }

    /// Creates the servers of every registered port.
    ///
    /// Fails with [Error::SystemNotReady] when no interface address is
    /// available. With `ignore_errors`, servers that fail to bind are
    /// reported through `server_info` and skipped.
    pub async fn start(&self, ignore_errors: bool) -> Result<(), Error> {
        if self.is_running() {
            return Ok(());
        }
        let addresses = self.query_addresses();
        if addresses.is_empty() {
            return Err(Error::SystemNotReady);
        }
        *lock(&self.addresses) = addresses.clone();

        if let Some(failures) = lock(&self.failures).take() {
            let monitor = tokio::spawn(self.shared.clone().monitor(failures));
            *lock(&self.monitor) = Some(monitor);
        }

        let ports = self.ports();
        self.add_servers(&addresses, &ports, ignore_errors).await?;
        self.running.store(true, Ordering::Release);
        info!(servers = self.shared.servers.len(), "started");
        Ok(())
    }

    /// Stops every server.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for endpoint in self.shared.servers.keys() {
            self.shared.remove(&endpoint).await;
        }
        info!("stopped");
    }

    /// Sends `descriptor` through the server (or fake server) named by its
    /// local endpoint.
    pub async fn send(&self, descriptor: IoDescriptor) -> Result<(), Error> {
        let environment = &self.shared.environment;
        let Some(local) = descriptor.local() else {
            environment.context.recycle(descriptor);
            return Err(Error::NotConnected);
        };
        let server = self
            .shared
            .servers
            .get(&local)
            .or_else(|| self.shared.fakes.get(&local));
        match server {
            Some(server) => server.send(descriptor).await,
            None => {
                let result = Err(Error::NetworkDown(local));
                environment.complete_send(&local, descriptor, &result);
                result
            }
        }
    }

    /// Re-reads the interface addresses. New addresses get servers (errors
    /// are reported, not returned); servers of vanished addresses stop.
    pub async fn refresh_addresses(&self) -> Result<(), Error> {
        let addresses = self.query_addresses();
        *lock(&self.addresses) = addresses.clone();
        if !self.is_running() {
            return Ok(());
        }

        let ports = self.ports();
        self.add_servers(&addresses, &ports, true).await?;
        self.shared
            .remove_where(|endpoint| !addresses.contains(&endpoint.address.ip()))
            .await;
        Ok(())
    }

    /// Returns true if `ip` is a served interface address or the public NAT
    /// address.
    pub fn is_local_address(&self, ip: IpAddr) -> bool {
        if lock(&self.addresses).contains(&ip) {
            return true;
        }
        matches!(self.config().nat, Some(nat) if IpAddr::V4(nat.public) == ip)
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if let Some(monitor) = lock(&self.monitor).take() {
            monitor.abort();
        }
    }
}
