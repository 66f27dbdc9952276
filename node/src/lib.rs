//! Serve relay ports over TCP, UDP, and TLS.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin turnstone -- --config node.yaml --bind udp:3478 --bind tcp:3478 --metrics 9090
//! ```
//!
//! The configuration file holds the log level, the ports to serve, and the
//! transport settings:
//!
//! ```yaml
//! log_level: debug
//! bind:
//!   - udp:3478
//!   - tls:5349
//! transport:
//!   max_memory_mb: 64
//!   addresses: ["0.0.0.0"]
//!   tls:
//!     certificate: cert.pem
//!     private_key: key.pem
//! ```
//!
//! With `--echo`, every received payload is sent back to its sender.

use prometheus_client::{metrics::counter::Counter, registry::Registry};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use turnstone_transport::{
    ConnectionInfo, Error, Handler, IoDescriptor, Manager, ProtocolPort, ServerEndpoint,
    ServerInfo, Verdict,
};

/// Configuration for a node.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Ports served in addition to those given on the command line.
    #[serde(default)]
    pub bind: Vec<String>,
    #[serde(default)]
    pub transport: turnstone_transport::Config,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Returns the configured log level.
    pub fn level(&self) -> Result<Level, Error> {
        Level::from_str(&self.log_level)
            .map_err(|_| Error::InvalidConfig(format!("unknown log level: {}", self.log_level)))
    }

    /// Parses the configured ports followed by `extra`, dropping duplicates.
    pub fn ports<'a>(
        &'a self,
        extra: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<ProtocolPort>, Error> {
        let mut ports = Vec::new();
        for port in self.bind.iter().map(String::as_str).chain(extra) {
            let port = ProtocolPort::from_str(port)?;
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        Ok(ports)
    }
}

/// Logs transport events and optionally forwards received payloads to be
/// echoed.
pub struct Node {
    echo: Option<mpsc::UnboundedSender<IoDescriptor>>,
    received: Counter,
    connections: Counter,
}

impl Node {
    pub fn new(echo: Option<mpsc::UnboundedSender<IoDescriptor>>, registry: &mut Registry) -> Self {
        let received = Counter::default();
        let connections = Counter::default();
        registry.register("received", "Payloads received", received.clone());
        registry.register(
            "connections",
            "Stream connections established",
            connections.clone(),
        );
        Self {
            echo,
            received,
            connections,
        }
    }
}

impl Handler for Node {
    fn received(&self, server: &ServerEndpoint, descriptor: &mut Option<IoDescriptor>) -> Verdict {
        self.received.inc();
        if let Some(received) = descriptor.as_ref() {
            debug!(
                %server,
                remote = ?received.remote(),
                connection = %received.connection(),
                len = received.bytes_transferred(),
                "received"
            );
        }
        if let Some(echo) = &self.echo {
            if let Some(received) = descriptor.take() {
                // The manager is gone once the channel closes.
                let _ = echo.send(received);
            }
        }
        Verdict::Processed
    }

    fn connected(&self, connection: &ConnectionInfo) {
        self.connections.inc();
        debug!(
            id = %connection.id,
            remote = %connection.remote,
            server = %connection.server,
            "connected"
        );
    }

    fn ended(&self, connection: &ConnectionInfo) {
        debug!(id = %connection.id, remote = %connection.remote, "ended");
    }

    fn sent(&self, server: &ServerEndpoint, descriptor: &mut Option<IoDescriptor>) {
        if let Some(error) = descriptor.as_ref().and_then(|d| d.error()) {
            warn!(%server, ?error, "send failed");
        }
    }

    fn server_added(&self, server: &ServerEndpoint) {
        info!(%server, "serving");
    }

    fn server_removed(&self, server: &ServerEndpoint) {
        info!(%server, "no longer serving");
    }

    fn server_info(&self, info: &ServerInfo) {
        warn!(%info, "server info");
    }
}

/// Sends every descriptor received on `echoes` back to where it came from.
pub async fn echo(manager: Arc<Manager>, mut echoes: mpsc::UnboundedReceiver<IoDescriptor>) {
    while let Some(mut descriptor) = echoes.recv().await {
        descriptor.set_count(descriptor.bytes_transferred());
        if let Err(err) = manager.send(descriptor).await {
            debug!(?err, "echo failed");
        }
    }
}
