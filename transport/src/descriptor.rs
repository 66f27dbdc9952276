//! The unit of asynchronous I/O.

use crate::{connection::ConnectionId, Context, Error, ServerEndpoint};
use std::{
    io::ErrorKind,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};
use turnstone_pool::{Poolable, Segment, SegmentAllocator};

/// Window length of a freshly constructed descriptor.
pub const DEFAULT_SIZE: usize = 2048;

/// Kind of operation a descriptor was last used for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Operation {
    #[default]
    Idle,
    Accept,
    Connect,
    Receive,
    Send,
    Disconnect,
}

/// A poolable I/O record.
///
/// The usable window of the descriptor is `[offset, offset + count)` of its
/// segment. Receives fill the window from its start and record how many bytes
/// arrived in `transferred`; sends write the whole window.
///
/// The segment is owned: it is released when the descriptor is reset or
/// dropped, unless it was moved out with [IoDescriptor::detach].
#[derive(Debug)]
pub struct IoDescriptor {
    segment: Option<Segment>,
    offset: usize,
    count: usize,
    transferred: usize,
    local: Option<ServerEndpoint>,
    remote: Option<SocketAddr>,
    connection: ConnectionId,
    sequence: u64,
    operation: Operation,
    error: Option<ErrorKind>,
    user_token: Option<u64>,
    pooled: bool,
}

impl Default for IoDescriptor {
    fn default() -> Self {
        Self {
            segment: None,
            offset: 0,
            count: DEFAULT_SIZE,
            transferred: 0,
            local: None,
            remote: None,
            connection: ConnectionId::ANY_NEW,
            sequence: 0,
            operation: Operation::Idle,
            error: None,
            user_token: None,
            pooled: false,
        }
    }
}

impl Poolable for IoDescriptor {
    fn reset(&mut self) {
        let pooled = self.pooled;
        *self = Self::default();
        self.pooled = pooled;
    }

    fn set_pooled(&mut self, pooled: bool) {
        self.pooled = pooled;
    }
}

impl IoDescriptor {
    /// Returns true if every field holds its construction value.
    pub fn is_default(&self) -> bool {
        self.segment.is_none()
            && self.offset == 0
            && self.count == DEFAULT_SIZE
            && self.transferred == 0
            && self.local.is_none()
            && self.remote.is_none()
            && self.connection == ConnectionId::ANY_NEW
            && self.sequence == 0
            && self.operation == Operation::Idle
            && self.error.is_none()
            && self.user_token.is_none()
            && !self.pooled
    }

    /// Allocates a segment covering the window if none is attached.
    pub fn allocate(&mut self, allocator: &SegmentAllocator) -> Result<(), Error> {
        if self.segment.is_none() {
            self.segment = Some(allocator.allocate(self.offset + self.count)?);
        }
        Ok(())
    }

    /// Resizes the window to `count` bytes, moving to a larger segment if needed.
    ///
    /// With `keep_data`, the transferred bytes are carried over.
    pub fn reallocate(
        &mut self,
        allocator: &SegmentAllocator,
        count: usize,
        keep_data: bool,
    ) -> Result<(), Error> {
        let required = self.offset + count;
        let fits = self.segment.as_ref().is_some_and(|s| s.len() >= required);
        if !fits {
            let mut segment = allocator.allocate(required)?;
            if keep_data {
                if let Some(old) = &self.segment {
                    let end = self.offset + self.transferred.min(count);
                    segment[self.offset..end].copy_from_slice(&old[self.offset..end]);
                }
            }
            self.segment = Some(segment);
        }
        self.count = count;
        if keep_data {
            self.transferred = self.transferred.min(count);
        } else {
            self.transferred = 0;
        }
        Ok(())
    }

    /// Attaches `segment`, returning the one it replaces.
    ///
    /// The window grows to the end of the new segment.
    pub fn attach(&mut self, segment: Segment) -> Option<Segment> {
        self.count = segment.len().saturating_sub(self.offset);
        self.transferred = self.transferred.min(self.count);
        self.segment.replace(segment)
    }

    /// Moves the segment out of the descriptor.
    pub fn detach(&mut self) -> Option<Segment> {
        self.transferred = 0;
        self.segment.take()
    }

    /// Copies `data` to the start of the window and shrinks the window to it.
    pub fn copy_from(&mut self, allocator: &SegmentAllocator, data: &[u8]) -> Result<(), Error> {
        if data.len() > self.count {
            return Err(Error::BufferTooSmall {
                needed: data.len(),
                available: self.count,
            });
        }
        self.allocate(allocator)?;
        let offset = self.offset;
        let segment = self.segment.as_mut().ok_or(Error::Closed)?;
        let available = segment.len().saturating_sub(offset);
        let Some(target) = segment.get_mut(offset..offset + data.len()) else {
            return Err(Error::BufferTooSmall {
                needed: data.len(),
                available,
            });
        };
        target.copy_from_slice(data);
        self.count = data.len();
        self.transferred = data.len();
        Ok(())
    }

    /// Returns a copy from `context`'s pool with the same addressing and a new
    /// segment holding the same bytes.
    pub fn deep_copy(&self, context: &Context) -> Result<IoDescriptor, Error> {
        let mut copy = context.descriptor();
        copy.copy_addresses_from(self);
        copy.offset = self.offset;
        copy.count = self.count;
        copy.sequence = self.sequence;
        copy.operation = self.operation;
        copy.error = self.error;
        copy.user_token = self.user_token;
        if let Some(segment) = &self.segment {
            let mut clone = context.allocator().allocate(segment.len())?;
            let end = (self.offset + self.count.max(self.transferred)).min(segment.len());
            clone[..end].copy_from_slice(&segment[..end]);
            copy.segment = Some(clone);
            copy.transferred = self.transferred;
        }
        Ok(copy)
    }

    /// Copies the local endpoint, remote address, and connection id.
    pub fn copy_addresses_from(&mut self, other: &IoDescriptor) {
        self.local = other.local;
        self.remote = other.remote;
        self.connection = other.connection;
    }

    /// Sets the remote address to the unspecified address of the family.
    pub fn set_any_remote(&mut self, ipv6: bool) {
        self.remote = Some(if ipv6 {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        });
    }

    /// Grows the window to the end of the attached segment.
    pub fn set_max_count(&mut self) {
        if let Some(segment) = &self.segment {
            self.count = segment.len().saturating_sub(self.offset);
        }
    }

    /// Moves the start of the window, keeping its end. With a segment
    /// attached the offset is clamped to the segment.
    pub fn set_offset(&mut self, offset: usize) {
        let end = self.offset + self.count;
        self.offset = match &self.segment {
            Some(segment) => offset.min(segment.len()),
            None => offset,
        };
        self.count = end.saturating_sub(self.offset);
        self.transferred = 0;
        self.clamp_count();
    }

    /// Sets the window length. With a segment attached the window is clamped
    /// to the end of the segment.
    pub fn set_count(&mut self, count: usize) {
        self.count = count;
        self.clamp_count();
    }

    fn clamp_count(&mut self) {
        if let Some(segment) = &self.segment {
            self.count = self.count.min(segment.len().saturating_sub(self.offset));
        }
    }

    /// Returns the window as a mutable slice, if a segment is attached.
    pub fn window_mut(&mut self) -> Option<&mut [u8]> {
        let (offset, count) = (self.offset, self.count);
        self.segment
            .as_mut()
            .and_then(|segment| segment.get_mut(offset..offset + count))
    }

    /// Returns the received bytes.
    pub fn transferred_data(&self) -> &[u8] {
        self.segment
            .as_ref()
            .and_then(|segment| segment.get(self.offset..self.offset + self.transferred))
            .unwrap_or(&[])
    }

    /// Returns the bytes to send.
    pub fn outgoing_data(&self) -> &[u8] {
        self.segment
            .as_ref()
            .and_then(|segment| segment.get(self.offset..self.offset + self.count))
            .unwrap_or(&[])
    }

    pub fn segment(&self) -> Option<&Segment> {
        self.segment.as_ref()
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    pub const fn count(&self) -> usize {
        self.count
    }

    pub const fn bytes_transferred(&self) -> usize {
        self.transferred
    }

    pub fn set_bytes_transferred(&mut self, transferred: usize) {
        debug_assert!(transferred <= self.count);
        self.transferred = transferred;
    }

    pub const fn local(&self) -> Option<ServerEndpoint> {
        self.local
    }

    pub fn set_local(&mut self, local: ServerEndpoint) {
        self.local = Some(local);
    }

    pub const fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = Some(remote);
    }

    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn set_connection(&mut self, connection: ConnectionId) {
        self.connection = connection;
    }

    /// Returns the per-connection sequence number of a receive.
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub const fn operation(&self) -> Operation {
        self.operation
    }

    pub fn set_operation(&mut self, operation: Operation) {
        self.operation = operation;
    }

    /// Returns the error of the last operation, if it failed.
    pub const fn error(&self) -> Option<ErrorKind> {
        self.error
    }

    pub fn set_error(&mut self, error: Option<ErrorKind>) {
        self.error = error;
    }

    pub const fn user_token(&self) -> Option<u64> {
        self.user_token
    }

    pub fn set_user_token(&mut self, token: Option<u64>) {
        self.user_token = token;
    }

    /// Returns true while the descriptor sits in a pool.
    pub const fn is_pooled(&self) -> bool {
        self.pooled
    }
}
