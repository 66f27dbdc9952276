//! Accept backlog accounting.
//!
//! A stream server keeps `min` accepts outstanding. Relisting a socket after a
//! graceful disconnect may raise the count up to `max`; acceptors above `min`
//! retire as soon as their accept completes, so the backlog drifts back to
//! `min` once the load subsides.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::info;

/// Outstanding accept counter.
pub struct AcceptBacklog {
    min: usize,
    max: usize,
    outstanding: AtomicUsize,
}

impl AcceptBacklog {
    pub const fn new(min: usize, max: usize) -> Self {
        Self {
            min,
            max,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Claims one accept if fewer than `min` are outstanding.
    pub fn reserve_to_min(&self) -> bool {
        self.reserve_below(self.min)
    }

    /// Claims one accept if fewer than `max` are outstanding.
    pub fn reserve_to_max(&self) -> bool {
        self.reserve_below(self.max)
    }

    fn reserve_below(&self, limit: usize) -> bool {
        let mut current = self.outstanding.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return false;
            }
            match self.outstanding.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Records a completed accept. Returns true if the acceptor should issue
    /// another accept, false if it has been retired.
    pub fn on_accepted(&self) -> bool {
        let mut current = self.outstanding.load(Ordering::Acquire);
        loop {
            if current <= self.min {
                return true;
            }
            match self.outstanding.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return false,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases an accept whose acceptor stopped.
    pub fn release(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub const fn min(&self) -> usize {
        self.min
    }

    pub const fn max(&self) -> usize {
        self.max
    }
}

/// Whether disconnected sockets may be relisted.
///
/// Starts enabled when the backlog range allows growth and is switched off for
/// good the first time the platform reports the operation unsupported.
pub struct SocketReuse {
    enabled: AtomicBool,
}

impl SocketReuse {
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Disables reuse. Returns true for the call that switched it off.
    pub fn disable(&self) -> bool {
        let switched = self.enabled.swap(false, Ordering::AcqRel);
        if switched {
            info!("socket reuse unsupported, disabled");
        }
        switched
    }
}
