//! Lock-free free-lists over a fixed array of slots.
//!
//! Every stack keeps its head in a single [AtomicU64] that packs a slot index
//! together with a generation counter as `(generation << 32) | index`. Both
//! [IndexStack::push] and [IndexStack::pop] bump the generation on success, so a
//! thread holding a stale snapshot of the head cannot win a compare-and-swap
//! after the same index has been popped and pushed back (the ABA problem).
//!
//! Several stacks may share one [Links] array as long as every index is a member
//! of at most one of them at a time.

use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

/// Index marking the end of a chain (and an empty stack).
pub const NIL: u32 = u32::MAX;

/// Packs a generation counter and a slot index into one word.
#[inline]
pub const fn pack(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

/// Splits a packed word into `(generation, index)`.
#[inline]
pub const fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// The `next` links of a slot array.
pub struct Links {
    next: Box<[AtomicU32]>,
}

impl Links {
    /// Creates `len` unlinked slots.
    ///
    /// # Panics
    ///
    /// Panics if `len` does not fit below [NIL].
    pub fn new(len: usize) -> Self {
        assert!(len < NIL as usize, "too many slots");
        Self {
            next: (0..len).map(|_| AtomicU32::new(NIL)).collect(),
        }
    }

    /// Returns the number of slots.
    pub fn len(&self) -> usize {
        self.next.len()
    }

    /// Returns true if there are no slots.
    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }

    #[inline]
    fn get(&self, index: u32) -> u32 {
        self.next[index as usize].load(Ordering::Relaxed)
    }

    #[inline]
    fn set(&self, index: u32, next: u32) {
        self.next[index as usize].store(next, Ordering::Relaxed);
    }
}

/// A Treiber stack of slot indices.
pub struct IndexStack {
    head: AtomicU64,
}

impl Default for IndexStack {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexStack {
    /// Creates an empty stack.
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(0, NIL)),
        }
    }

    /// Creates a stack holding every index of `links`, lowest index on top.
    ///
    /// Overwrites the links, so no other stack may hold any of them.
    pub fn filled(links: &Links) -> Self {
        let len = links.len() as u32;
        for index in 0..len {
            let next = if index + 1 < len { index + 1 } else { NIL };
            links.set(index, next);
        }
        let head = if len == 0 { NIL } else { 0 };
        Self {
            head: AtomicU64::new(pack(0, head)),
        }
    }

    /// Removes the index on top of the stack.
    pub fn pop(&self, links: &Links) -> Option<u32> {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (generation, index) = unpack(current);
            if index == NIL {
                return None;
            }

            // The link may be stale if another thread wins the race, in which
            // case the generation check below rejects it.
            let next = links.get(index);
            match self.head.compare_exchange_weak(
                current,
                pack(generation.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => current = actual,
            }
        }
    }

    /// Places `index` on top of the stack.
    ///
    /// The caller must own `index` (it must not be a member of any stack sharing
    /// `links`).
    pub fn push(&self, links: &Links, index: u32) {
        debug_assert!((index as usize) < links.len(), "index out of range");
        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            let (generation, head) = unpack(current);
            links.set(index, head);
            match self.head.compare_exchange_weak(
                current,
                pack(generation.wrapping_add(1), index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns true if the stack held no index when observed.
    pub fn is_empty(&self) -> bool {
        unpack(self.head.load(Ordering::Acquire)).1 == NIL
    }

    /// Returns the current generation of the head.
    pub fn generation(&self) -> u32 {
        unpack(self.head.load(Ordering::Acquire)).0
    }
}

/// A bounded lock-free stack of values.
///
/// Built from two [IndexStack]s over the same slots: `empty` holds the indices
/// of vacant slots and `full` the indices of occupied ones. Popping an index
/// from either stack grants exclusive access to its slot until it is pushed
/// onto the other.
pub struct LockFreeStack<T> {
    links: Links,
    values: Box<[UnsafeCell<Option<T>>]>,
    empty: IndexStack,
    full: IndexStack,
}

// SAFETY: a slot is only touched by the thread that popped its index, so values
// move between threads but are never shared.
unsafe impl<T: Send> Send for LockFreeStack<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> LockFreeStack<T> {
    /// Creates a stack that can hold up to `capacity` values.
    pub fn new(capacity: usize) -> Self {
        let links = Links::new(capacity);
        let empty = IndexStack::filled(&links);
        Self {
            values: (0..capacity).map(|_| UnsafeCell::new(None)).collect(),
            links,
            empty,
            full: IndexStack::new(),
        }
    }

    /// Pushes a value, handing it back if every slot is occupied.
    pub fn push(&self, value: T) -> Result<(), T> {
        let Some(index) = self.empty.pop(&self.links) else {
            return Err(value);
        };

        // SAFETY: `index` was popped from `empty`, so no other thread can reach
        // this slot until it is pushed onto `full`.
        unsafe { *self.values[index as usize].get() = Some(value) };
        self.full.push(&self.links, index);
        Ok(())
    }

    /// Pops the most recently pushed value still present.
    pub fn pop(&self) -> Option<T> {
        let index = self.full.pop(&self.links)?;

        // SAFETY: `index` was popped from `full`, so this thread owns the slot.
        let value = unsafe { (*self.values[index as usize].get()).take() };
        self.empty.push(&self.links, index);
        value
    }

    /// Returns the maximum number of values held at once.
    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no value was present when observed.
    pub fn is_empty(&self) -> bool {
        self.full.is_empty()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        for value in self.values.iter_mut() {
            value.get_mut().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Arc, thread};

    #[test]
    fn test_pack_roundtrip() {
        let word = pack(7, 42);
        assert_eq!(word, (7u64 << 32) | 42);
        assert_eq!(unpack(word), (7, 42));
        assert_eq!(unpack(pack(u32::MAX, NIL)), (u32::MAX, NIL));
    }

    #[test]
    fn test_index_stack_lifo() {
        let links = Links::new(4);
        let stack = IndexStack::new();
        assert!(stack.is_empty());
        assert_eq!(stack.pop(&links), None);

        stack.push(&links, 1);
        stack.push(&links, 3);
        stack.push(&links, 0);
        assert_eq!(stack.pop(&links), Some(0));
        assert_eq!(stack.pop(&links), Some(3));
        assert_eq!(stack.pop(&links), Some(1));
        assert_eq!(stack.pop(&links), None);
    }

    #[test]
    fn test_generation_advances_on_push_and_pop() {
        let links = Links::new(2);
        let stack = IndexStack::new();
        let start = stack.generation();
        stack.push(&links, 0);
        assert_eq!(stack.generation(), start + 1);
        stack.pop(&links);
        assert_eq!(stack.generation(), start + 2);

        // An empty pop leaves the head untouched.
        stack.pop(&links);
        assert_eq!(stack.generation(), start + 2);
    }

    #[test]
    fn test_stale_head_is_rejected() {
        let links = Links::new(2);
        let stack = IndexStack::filled(&links);
        let snapshot = stack.head.load(Ordering::Acquire);

        // Pop and push the same index back: the index matches the snapshot but
        // the generation does not.
        let index = stack.pop(&links).unwrap();
        stack.push(&links, index);
        assert_eq!(unpack(snapshot).1, unpack(stack.head.load(Ordering::Acquire)).1);
        assert!(stack
            .head
            .compare_exchange(snapshot, pack(0, NIL), Ordering::AcqRel, Ordering::Acquire)
            .is_err());
    }

    #[test]
    fn test_filled_holds_every_index() {
        let links = Links::new(5);
        let stack = IndexStack::filled(&links);
        let mut seen = Vec::new();
        while let Some(index) = stack.pop(&links) {
            seen.push(index);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_value_stack_capacity() {
        let stack = LockFreeStack::new(2);
        assert!(stack.push("a").is_ok());
        assert!(stack.push("b").is_ok());
        assert_eq!(stack.push("c"), Err("c"));
        assert_eq!(stack.pop(), Some("b"));
        assert!(stack.push("c").is_ok());
        assert_eq!(stack.pop(), Some("c"));
        assert_eq!(stack.pop(), Some("a"));
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_value_stack_drops_remaining() {
        let marker = Arc::new(());
        {
            let stack = LockFreeStack::new(4);
            stack.push(marker.clone()).unwrap();
            stack.push(marker.clone()).unwrap();
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_concurrent_push_pop_conserves_items() {
        cfg_if::cfg_if! {
            if #[cfg(miri)] {
                let (threads, items, rounds) = (4, 16, 50);
            } else {
                let (threads, items, rounds) = (8, 256, 5_000);
            }
        }

        let stack = Arc::new(LockFreeStack::new(items));
        for item in 0..items {
            stack.push(item).unwrap();
        }

        let mut handles = Vec::new();
        for seed in 0..threads {
            let stack = stack.clone();
            handles.push(thread::spawn(move || {
                use rand::{rngs::StdRng, Rng, SeedableRng};
                let mut rng = StdRng::seed_from_u64(seed as u64);
                let mut held = Vec::new();
                for _ in 0..rounds {
                    if held.is_empty() || rng.gen_bool(0.5) {
                        if let Some(item) = stack.pop() {
                            held.push(item);
                        }
                    } else if let Some(item) = held.pop() {
                        stack.push(item).unwrap();
                    }
                }
                for item in held {
                    stack.push(item).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = HashSet::new();
        while let Some(item) = stack.pop() {
            assert!(seen.insert(item), "item {item} duplicated");
        }
        assert_eq!(seen.len(), items);
    }
}
