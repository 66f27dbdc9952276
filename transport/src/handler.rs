//! Events surfaced to the application.

use crate::{ConnectionId, IoDescriptor, ServerEndpoint};
use std::{fmt, io::ErrorKind, net::SocketAddr, sync::Arc};

/// Outcome of handing received bytes to the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The bytes were consumed; the connection stays open.
    Processed,
    /// The peer misbehaved; close the connection.
    Reject,
}

/// Identity of a stream connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub server: ServerEndpoint,
}

/// Payload of a [ServerInfo].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InfoKind {
    Io(ErrorKind),
    Message(String),
}

/// A non-fatal diagnostic about a server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub endpoint: ServerEndpoint,
    pub kind: InfoKind,
}

impl ServerInfo {
    pub fn io(endpoint: ServerEndpoint, kind: ErrorKind) -> Self {
        Self {
            endpoint,
            kind: InfoKind::Io(kind),
        }
    }

    pub fn message(endpoint: ServerEndpoint, message: impl Into<String>) -> Self {
        Self {
            endpoint,
            kind: InfoKind::Message(message.into()),
        }
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InfoKind::Io(kind) => write!(f, "{}: socket error: {kind}", self.endpoint),
            InfoKind::Message(message) => write!(f, "{}: {message}", self.endpoint),
        }
    }
}

/// Receives transport events.
///
/// Methods are invoked from I/O tasks and must not block. Descriptors are
/// offered as `&mut Option<IoDescriptor>`: a handler that wants to keep one
/// takes it (`Option::take`), otherwise it is recycled when the call returns.
pub trait Handler: Send + Sync + 'static {
    /// Delivers received bytes, in issue order per connection.
    fn received(&self, server: &ServerEndpoint, descriptor: &mut Option<IoDescriptor>) -> Verdict;

    /// A stream connection was accepted or established.
    fn connected(&self, _connection: &ConnectionInfo) {}

    /// A stream connection ended. Fires exactly once per connection.
    fn ended(&self, _connection: &ConnectionInfo) {}

    /// Called before the bytes of `descriptor` are written.
    fn before_send(&self, _server: &ServerEndpoint, _descriptor: &mut IoDescriptor) {}

    /// A send completed. [IoDescriptor::error] holds the outcome.
    fn sent(&self, _server: &ServerEndpoint, _descriptor: &mut Option<IoDescriptor>) {}

    fn server_added(&self, _server: &ServerEndpoint) {}

    fn server_removed(&self, _server: &ServerEndpoint) {}

    fn server_info(&self, _info: &ServerInfo) {}
}

/// Fans events out to several handlers, in registration order.
///
/// For `received` and `sent`, dispatch stops at the first handler that takes
/// the descriptor. A single rejection rejects the delivery.
#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn push(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Handler for Dispatcher {
    fn received(&self, server: &ServerEndpoint, descriptor: &mut Option<IoDescriptor>) -> Verdict {
        let mut verdict = Verdict::Processed;
        for handler in &self.handlers {
            if descriptor.is_none() {
                break;
            }
            if handler.received(server, descriptor) == Verdict::Reject {
                verdict = Verdict::Reject;
            }
        }
        verdict
    }

    fn connected(&self, connection: &ConnectionInfo) {
        for handler in &self.handlers {
            handler.connected(connection);
        }
    }

    fn ended(&self, connection: &ConnectionInfo) {
        for handler in &self.handlers {
            handler.ended(connection);
        }
    }

    fn before_send(&self, server: &ServerEndpoint, descriptor: &mut IoDescriptor) {
        for handler in &self.handlers {
            handler.before_send(server, descriptor);
        }
    }

    fn sent(&self, server: &ServerEndpoint, descriptor: &mut Option<IoDescriptor>) {
        for handler in &self.handlers {
            if descriptor.is_none() {
                break;
            }
            handler.sent(server, descriptor);
        }
    }

    fn server_added(&self, server: &ServerEndpoint) {
        for handler in &self.handlers {
            handler.server_added(server);
        }
    }

    fn server_removed(&self, server: &ServerEndpoint) {
        for handler in &self.handlers {
            handler.server_removed(server);
        }
    }

    fn server_info(&self, info: &ServerInfo) {
        for handler in &self.handlers {
            handler.server_info(info);
        }
    }
}
