//! A stream connection with ordered, pipelined receives.

use crate::{
    handler::ConnectionInfo,
    ring::ReceiveRing,
    security::SecurityContext,
    spinlock::SpinLock,
    stream_buffer::StreamBuffer,
    Context, Error, IoDescriptor, ServerEndpoint,
};
use socket2::SockRef;
use std::{
    fmt,
    io::{self, ErrorKind},
    net::{Shutdown, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
        Mutex, MutexGuard,
    },
};
use tokio::{net::TcpStream, sync::Semaphore};
use tracing::debug;
use turnstone_pool::SegmentAllocator;

/// Identifies a stream connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(i64);

impl ConnectionId {
    /// Send on the existing connection to the remote, or open one.
    pub const ANY_NEW: Self = Self(-1);
    /// Send on whatever connection exists to the remote.
    pub const ANY: Self = Self(-2);

    /// Returns a fresh process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicI64 = AtomicI64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns true for [ConnectionId::ANY_NEW] and [ConnectionId::ANY].
    pub const fn is_wildcard(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ANY_NEW => f.write_str("any-new"),
            Self::ANY => f.write_str("any"),
            Self(id) => write!(f, "{id}"),
        }
    }
}

/// Outcome of [Connection::issue_receive].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Issue {
    /// The descriptor holds a completion (data, end of stream, or an error)
    /// stamped with the next sequence number.
    Completed,
    /// No data was ready; no sequence number was consumed.
    WouldBlock,
    /// The connection is closed.
    Closed,
}

/// Plaintext recovered from one received chunk of a secured connection.
pub struct Unsealed {
    pub plaintext: Vec<IoDescriptor>,
    /// Handshake output is waiting to be flushed.
    pub token: bool,
}

/// An accepted or outbound stream connection.
///
/// Receives are issued under a spin lock that stamps each with the next
/// sequence number, and their completions are reordered through a
/// [ReceiveRing]. Receive credits (one per ring slot) bound how many
/// completions are in flight or waiting.
pub struct Connection {
    id: ConnectionId,
    server: ServerEndpoint,
    remote: SocketAddr,
    local: SocketAddr,
    accepted: bool,
    stream: TcpStream,

    closes: AtomicU32,
    closed: AtomicBool,
    issue: SpinLock<u64>,
    ring: ReceiveRing<IoDescriptor>,
    credits: Semaphore,

    secure: bool,
    security: Mutex<Option<Box<dyn SecurityContext>>>,
    writer: tokio::sync::Mutex<StreamBuffer>,
}

impl Connection {
    pub fn new(
        server: ServerEndpoint,
        stream: TcpStream,
        accepted: bool,
        queue_size: usize,
        security: Option<Box<dyn SecurityContext>>,
        allocator: SegmentAllocator,
    ) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        Ok(Self {
            id: ConnectionId::next(),
            server,
            remote,
            local,
            accepted,
            stream,
            closes: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            issue: SpinLock::new(0),
            ring: ReceiveRing::new(queue_size),
            credits: Semaphore::new(queue_size),
            secure: security.is_some(),
            security: Mutex::new(security),
            writer: tokio::sync::Mutex::new(StreamBuffer::new(allocator)),
        })
    }

    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    pub const fn server(&self) -> ServerEndpoint {
        self.server
    }

    pub const fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub const fn local(&self) -> SocketAddr {
        self.local
    }

    /// Returns true if the connection was accepted rather than dialed.
    pub const fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub const fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            remote: self.remote,
            server: self.server,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true while the socket still has a peer.
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.stream.peer_addr().is_ok()
    }

    /// Waits for a receive credit. Returns false once the connection closes.
    pub async fn acquire_credit(&self) -> bool {
        match self.credits.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Returns credits for completions that left the ring (or were never issued).
    pub fn return_credits(&self, n: usize) {
        if n > 0 && !self.is_closed() {
            self.credits.add_permits(n);
        }
    }

    /// Waits until the socket may have data.
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    /// Reads into the window of `descriptor` without blocking.
    ///
    /// Checking for close, reading and stamping the sequence number happen
    /// atomically with respect to [Connection::close], so sequence numbers
    /// are handed out in the order the reads were made.
    pub fn issue_receive(&self, descriptor: &mut IoDescriptor) -> Issue {
        let mut next = self.issue.lock();
        if self.is_closed() {
            return Issue::Closed;
        }
        let Some(window) = descriptor.window_mut() else {
            return Issue::WouldBlock;
        };
        match self.stream.try_read(window) {
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Issue::WouldBlock,
            Ok(0) => {
                descriptor.set_bytes_transferred(0);
                descriptor.set_error(Some(ErrorKind::UnexpectedEof));
            }
            Ok(read) => descriptor.set_bytes_transferred(read),
            Err(err) => descriptor.set_error(Some(err.kind())),
        }
        descriptor.set_sequence(*next);
        *next += 1;
        Issue::Completed
    }

    /// Deposits a completed receive for in-order delivery.
    pub fn deposit(&self, descriptor: IoDescriptor) -> Result<(), IoDescriptor> {
        self.ring.put(descriptor.sequence(), descriptor)
    }

    /// Delivers deposited receives in sequence order. See [ReceiveRing::drain].
    pub fn drain(&self, deliver: impl FnMut(u64, IoDescriptor) -> bool) -> usize {
        self.ring.drain(deliver)
    }

    /// Tears the connection down. Only the first caller does any work and
    /// gets true back: it recycles every descriptor still in the ring and
    /// drops the security context.
    pub fn close(&self, context: &Context) -> bool {
        if self.closes.fetch_add(1, Ordering::AcqRel) != 0 {
            return false;
        }
        {
            let _issue = self.issue.lock();
            self.closed.store(true, Ordering::Release);
        }
        self.credits.close();
        let pending = self.ring.close();
        debug!(id = %self.id, pending = pending.len(), "closed connection");
        for descriptor in pending {
            context.recycle(descriptor);
        }
        self.lock_security().take();
        true
    }

    /// Shuts down both directions of the socket.
    pub fn shutdown(&self) -> io::Result<()> {
        SockRef::from(&self.stream).shutdown(Shutdown::Both)
    }

    fn lock_security(&self) -> MutexGuard<'_, Option<Box<dyn SecurityContext>>> {
        self.security.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feeds a received chunk to the security context and collects the
    /// plaintext it releases into descriptors from `context`.
    pub fn unseal(&self, context: &Context, received: &IoDescriptor) -> Result<Unsealed, Error> {
        let mut security = self.lock_security();
        let security = security.as_mut().ok_or(Error::Closed)?;
        let progress = security.receive(received.transferred_data())?;

        let mut plaintext = Vec::new();
        loop {
            let mut out = context.descriptor();
            let read = out
                .allocate(context.allocator())
                .and_then(|()| match out.window_mut() {
                    Some(window) => security.read_plaintext(window),
                    None => Ok(0),
                });
            match read {
                Ok(0) => {
                    context.recycle(out);
                    break;
                }
                Ok(read) => {
                    out.set_bytes_transferred(read);
                    out.copy_addresses_from(received);
                    out.set_sequence(received.sequence());
                    plaintext.push(out);
                }
                Err(err) => {
                    context.recycle(out);
                    for descriptor in plaintext {
                        context.recycle(descriptor);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Unsealed {
            plaintext,
            token: progress.token,
        })
    }

    /// Writes `data` (sealed first on secured connections).
    pub async fn write(&self, data: &[u8]) -> Result<(), Error> {
        if !self.secure {
            let _writer = self.writer.lock().await;
            return self.write_all(data).await;
        }
        let mut out = self.writer.lock().await;
        out.clear();
        self.lock_security()
            .as_mut()
            .ok_or(Error::Closed)?
            .seal(data, &mut out)?;
        let result = self.write_all(out.as_slice()).await;
        out.clear();
        result
    }

    /// Writes handshake output the security context has queued.
    pub async fn flush_pending(&self) -> Result<(), Error> {
        let mut out = self.writer.lock().await;
        out.clear();
        let pending = match self.lock_security().as_mut() {
            Some(security) => security.pending_token(&mut out)?,
            None => 0,
        };
        if pending == 0 {
            return Ok(());
        }
        let result = self.write_all(out.as_slice()).await;
        out.clear();
        result
    }

    async fn write_all(&self, data: &[u8]) -> Result<(), Error> {
        let mut written = 0;
        while written < data.len() {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            self.stream.writable().await?;
            match self.stream.try_write(&data[written..]) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
