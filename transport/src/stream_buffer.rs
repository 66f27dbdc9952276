//! Growable byte buffer backed by allocator segments.

use crate::Error;
use std::io::{self, Write};
use turnstone_pool::{Segment, SegmentAllocator};

/// Accumulates bytes in a [Segment], moving to a larger size class when full.
///
/// Used to stage outgoing TLS records and handshake tokens before a socket
/// write.
pub struct StreamBuffer {
    allocator: SegmentAllocator,
    segment: Option<Segment>,
    len: usize,
}

impl StreamBuffer {
    pub fn new(allocator: SegmentAllocator) -> Self {
        Self {
            allocator,
            segment: None,
            len: 0,
        }
    }

    /// Ensures room for `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) -> Result<(), Error> {
        let required = self.len + additional;
        let capacity = self.segment.as_ref().map_or(0, |s| s.len());
        if required <= capacity {
            return Ok(());
        }
        let mut grown = self.allocator.allocate(required.max(capacity * 2))?;
        if let Some(old) = self.segment.take() {
            grown[..self.len].copy_from_slice(&old[..self.len]);
        }
        self.segment = Some(grown);
        Ok(())
    }

    /// Appends `data`.
    pub fn append(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        self.reserve(data.len())?;
        let start = self.len;
        let segment = self.segment.as_mut().ok_or(Error::Closed)?;
        segment[start..start + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// Drops the first `n` bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        if let Some(segment) = self.segment.as_mut() {
            segment.copy_within(n..self.len, 0);
        }
        self.len -= n;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Releases the backing segment.
    pub fn free(&mut self) {
        self.len = 0;
        self.segment = None;
    }

    pub fn as_slice(&self) -> &[u8] {
        self.segment
            .as_ref()
            .map_or(&[][..], |segment| &segment[..self.len])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.segment.as_ref().map_or(0, |s| s.len())
    }
}

impl Write for StreamBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf)
            .map_err(|err| io::Error::new(io::ErrorKind::OutOfMemory, err))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
