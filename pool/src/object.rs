//! Recycling pools for reusable objects.
//!
//! Both pools are built on [crate::stack] and never block: [SafePool::get] and
//! [FastPool::get] always return an object, constructing one when nothing is
//! stored. They differ in how they bound the number of pooled objects:
//!
//! - [SafePool] stores up to `capacity` returned objects and drops any surplus.
//!   More than `capacity` objects may exist at once; the extras are simply not
//!   recycled.
//! - [FastPool] hands out at most `capacity` objects bound to a slot (see
//!   [Tracked]). Objects created beyond that carry no slot and are dropped when
//!   returned.
//!
//! Objects are [Poolable::reset] on return, before any other caller can observe
//! them.

use crate::stack::{IndexStack, Links, LockFreeStack};
use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

/// An object that can be recycled by a pool.
pub trait Poolable {
    /// Restores the object to its construction state.
    fn reset(&mut self);

    /// Records whether the object is currently stored in a pool.
    fn set_pooled(&mut self, _pooled: bool) {}
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// A pool that recycles up to `capacity` objects.
pub struct SafePool<T> {
    stored: LockFreeStack<T>,
    factory: Factory<T>,
    created: AtomicUsize,
}

impl<T: Poolable> SafePool<T> {
    /// Creates an empty pool. Objects are built by `factory` on demand.
    pub fn new(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            stored: LockFreeStack::new(capacity),
            factory: Box::new(factory),
            created: AtomicUsize::new(0),
        }
    }

    /// Takes a stored object or constructs a new one.
    pub fn get(&self) -> T {
        if let Some(mut value) = self.stored.pop() {
            value.set_pooled(false);
            return value;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        (self.factory)()
    }

    /// Resets `value` and stores it, dropping it if the pool is full.
    pub fn put(&self, mut value: T) {
        value.reset();
        value.set_pooled(true);
        if let Err(mut surplus) = self.stored.push(value) {
            surplus.set_pooled(false);
        }
    }

    /// Returns the number of objects constructed by the pool.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Returns the number of objects the pool can store.
    pub fn capacity(&self) -> usize {
        self.stored.capacity()
    }
}

/// An object handed out by a [FastPool].
///
/// Carries the slot reserved for it, if any. The slot cannot be changed, so an
/// object can only ever be stored back where it belongs.
#[derive(Debug)]
pub struct Tracked<T> {
    slot: Option<u32>,
    value: T,
}

impl<T> Tracked<T> {
    /// Returns the slot bound to the object, or `None` if it will not be
    /// recycled.
    pub const fn slot(&self) -> Option<u32> {
        self.slot
    }

    /// Returns true if the object will be recycled when returned.
    pub const fn is_poolable(&self) -> bool {
        self.slot.is_some()
    }

    /// Detaches the object from the pool.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Tracked<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// A pool whose objects carry their own slot, enforcing `capacity` exactly.
pub struct FastPool<T> {
    links: Links,
    values: Box<[UnsafeCell<Option<T>>]>,
    stored: IndexStack,
    factory: Factory<T>,
    created: AtomicUsize,
    overflow: AtomicUsize,
}

// SAFETY: slot `i` is only written by the holder of the unique `Tracked` bound to
// it and only read by the thread that popped `i` from `stored`.
unsafe impl<T: Send> Send for FastPool<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for FastPool<T> {}

impl<T: Poolable> FastPool<T> {
    /// Creates an empty pool with room for `capacity` slotted objects.
    pub fn new(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            links: Links::new(capacity),
            values: (0..capacity).map(|_| UnsafeCell::new(None)).collect(),
            stored: IndexStack::new(),
            factory: Box::new(factory),
            created: AtomicUsize::new(0),
            overflow: AtomicUsize::new(0),
        }
    }

    fn take(&self) -> Option<Tracked<T>> {
        let slot = self.stored.pop(&self.links)?;

        // SAFETY: `slot` was popped from `stored`, so no other thread can reach it.
        let mut value = unsafe { (*self.values[slot as usize].get()).take() }?;
        value.set_pooled(false);
        Some(Tracked {
            slot: Some(slot),
            value,
        })
    }

    fn reserve(&self) -> Option<u32> {
        let capacity = self.values.len();
        self.created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |created| {
                (created < capacity).then_some(created + 1)
            })
            .ok()
            .map(|slot| slot as u32)
    }

    /// Takes a stored object or constructs a new one.
    ///
    /// Once `capacity` slotted objects exist, new objects carry no slot.
    pub fn get(&self) -> Tracked<T> {
        if let Some(tracked) = self.take() {
            return tracked;
        }
        let slot = self.reserve();
        if slot.is_none() {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        Tracked {
            slot,
            value: (self.factory)(),
        }
    }

    /// Like [FastPool::get] but returns `None` instead of constructing an
    /// object without a slot.
    pub fn get_if_space_available(&self) -> Option<Tracked<T>> {
        if let Some(tracked) = self.take() {
            return Some(tracked);
        }
        let slot = self.reserve()?;
        Some(Tracked {
            slot: Some(slot),
            value: (self.factory)(),
        })
    }

    /// Resets and stores a slotted object; drops one without a slot.
    pub fn put(&self, tracked: Tracked<T>) {
        let Tracked { slot, mut value } = tracked;
        let Some(slot) = slot else {
            return;
        };
        value.reset();
        value.set_pooled(true);

        // SAFETY: only the unique `Tracked` bound to `slot` may store into it,
        // and its slot is empty while the object is checked out.
        unsafe { *self.values[slot as usize].get() = Some(value) };
        self.stored.push(&self.links, slot);
    }

    /// Returns the number of slotted objects constructed.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Returns the number of objects constructed without a slot.
    pub fn overflow(&self) -> usize {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Returns the number of slots.
    pub fn capacity(&self) -> usize {
        self.values.len()
    }
}

impl<T> Drop for FastPool<T> {
    fn drop(&mut self) {
        for value in self.values.iter_mut() {
            value.get_mut().take();
        }
    }
}
