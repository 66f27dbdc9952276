//! Reorders receive completions into issue order.
//!
//! Every receive on a connection is stamped with the next sequence number when
//! it is issued. Completions may arrive in any order: each is deposited into
//! slot `sequence % capacity` and [ReceiveRing::drain] hands values to the
//! consumer only while the slot under the delivery cursor is occupied.
//!
//! Slots are allocated once with the ring. Each carries a state byte that moves
//! `EMPTY -> WRITING -> FULL -> TAKING -> EMPTY`; the thread that wins a
//! transition out of `EMPTY` or `FULL` owns the slot's value until it stores
//! the next state.
//!
//! The issuer must keep at most `capacity` values either in flight or waiting in
//! the ring, otherwise a slot could be claimed by two sequence numbers.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const FULL: u8 = 2;
const TAKING: u8 = 3;

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn is_full(&self) -> bool {
        self.state.load(Ordering::SeqCst) == FULL
    }

    /// Stores `value`, handing it back if the slot is occupied.
    fn store(&self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        // SAFETY: winning EMPTY -> WRITING grants exclusive access to the cell.
        unsafe { (*self.value.get()).write(value) };
        self.state.store(FULL, Ordering::SeqCst);
        Ok(())
    }

    /// Moves the value out if the slot is full.
    fn take(&self) -> Option<T> {
        self.state
            .compare_exchange(FULL, TAKING, Ordering::SeqCst, Ordering::Relaxed)
            .ok()?;
        // SAFETY: winning FULL -> TAKING grants exclusive access to an
        // initialized cell; the value is moved out before the slot is released.
        let value = unsafe { (*self.value.get()).assume_init_read() };
        self.state.store(EMPTY, Ordering::Release);
        Some(value)
    }
}

/// A fixed-capacity sequence number ring.
pub struct ReceiveRing<T> {
    slots: Box<[Slot<T>]>,
    cursor: AtomicU64,
    draining: AtomicBool,
    closed: AtomicBool,
}

// SAFETY: a value is only touched by the thread that owns its slot state, so
// values move between threads but are never shared.
unsafe impl<T: Send> Send for ReceiveRing<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for ReceiveRing<T> {}

impl<T> ReceiveRing<T> {
    /// Creates a ring of `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        Self {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            cursor: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    fn slot(&self, sequence: u64) -> &Slot<T> {
        &self.slots[(sequence % self.slots.len() as u64) as usize]
    }

    /// Deposits the completion of receive `sequence`.
    ///
    /// Hands the value back if the ring is (or concurrently becomes) closed,
    /// or if the slot of `sequence` is still occupied.
    pub fn put(&self, sequence: u64, value: T) -> Result<(), T> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(value);
        }
        let slot = self.slot(sequence);
        slot.store(value)?;

        // A close that started before the value landed may have missed it;
        // whoever takes the value out owns it.
        if self.closed.load(Ordering::SeqCst) {
            if let Some(value) = slot.take() {
                return Err(value);
            }
        }
        Ok(())
    }

    /// Delivers values to `deliver` in sequence order, starting at the cursor,
    /// until the next slot is empty or `deliver` returns false.
    ///
    /// Only one caller drains at a time: a caller that finds another draining
    /// returns immediately, and the active drainer picks up its deposit.
    /// Returns the number of values delivered.
    pub fn drain(&self, mut deliver: impl FnMut(u64, T) -> bool) -> usize {
        let mut delivered = 0;
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return delivered;
            }

            let mut stopped = false;
            while !self.closed.load(Ordering::SeqCst) {
                let sequence = self.cursor.load(Ordering::Relaxed);
                let Some(value) = self.slot(sequence).take() else {
                    break;
                };
                self.cursor.store(sequence + 1, Ordering::Release);
                delivered += 1;
                if !deliver(sequence, value) {
                    stopped = true;
                    break;
                }
            }
            self.draining.store(false, Ordering::SeqCst);

            // A deposit may have landed between the empty check and the release
            // of the drain flag.
            if stopped || self.closed.load(Ordering::SeqCst) {
                return delivered;
            }
            let sequence = self.cursor.load(Ordering::Acquire);
            if !self.slot(sequence).is_full() {
                return delivered;
            }
        }
    }

    /// Closes the ring and returns every value still deposited.
    ///
    /// Later deposits are handed back to their callers.
    pub fn close(&self) -> Vec<T> {
        self.closed.store(true, Ordering::SeqCst);
        self.slots.iter().filter_map(Slot::take).collect()
    }

    /// Returns the sequence number of the next value to deliver.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T> Drop for ReceiveRing<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if *slot.state.get_mut() == FULL {
                // SAFETY: a FULL slot holds an initialized value and `&mut self`
                // rules out concurrent access.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{seq::SliceRandom, SeedableRng};
    use std::{
        sync::{Arc, Mutex},
        thread,
    };

    fn collect(ring: &ReceiveRing<&'static str>, out: &mut Vec<&'static str>) -> usize {
        ring.drain(|_, value| {
            out.push(value);
            true
        })
    }

    #[test]
    fn test_reorders_completions() {
        let ring = ReceiveRing::new(4);
        let mut out = Vec::new();

        ring.put(2, "c").unwrap();
        assert_eq!(collect(&ring, &mut out), 0);
        ring.put(0, "a").unwrap();
        assert_eq!(collect(&ring, &mut out), 1);
        ring.put(1, "b").unwrap();
        assert_eq!(collect(&ring, &mut out), 2);

        assert_eq!(out, vec!["a", "b", "c"]);
        assert_eq!(ring.cursor(), 3);
    }

    #[test]
    fn test_wraps_around() {
        let ring = ReceiveRing::new(2);
        let mut out = Vec::new();
        for (sequence, value) in [(1, "b"), (0, "a")] {
            ring.put(sequence, value).unwrap();
        }
        collect(&ring, &mut out);
        for (sequence, value) in [(3, "d"), (2, "c")] {
            ring.put(sequence, value).unwrap();
        }
        collect(&ring, &mut out);
        assert_eq!(out, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_deliver_can_stop() {
        let ring = ReceiveRing::new(4);
        for (sequence, value) in [(0, 10), (1, 11), (2, 12)] {
            ring.put(sequence, value).unwrap();
        }
        let delivered = ring.drain(|_, value| value != 11);
        assert_eq!(delivered, 2);
        assert_eq!(ring.cursor(), 2);
        assert_eq!(ring.close(), vec![12]);
    }

    #[test]
    fn test_close_returns_pending_and_rejects_late_puts() {
        let ring = ReceiveRing::new(4);
        ring.put(1, 1).unwrap();
        ring.put(3, 3).unwrap();
        let mut drained = ring.close();
        drained.sort();
        assert_eq!(drained, vec![1, 3]);
        assert!(ring.is_closed());
        assert_eq!(ring.put(0, 0), Err(0));
        assert_eq!(ring.drain(|_, _| true), 0);
    }

    #[test]
    fn test_occupied_slot_hands_value_back() {
        let ring = ReceiveRing::new(2);
        ring.put(0, "a").unwrap();
        // Sequence 2 maps to the slot still holding sequence 0.
        assert_eq!(ring.put(2, "c"), Err("c"));
        assert_eq!(ring.close(), vec!["a"]);
    }

    #[test]
    fn test_drop_releases_values() {
        let marker = Arc::new(());
        {
            let ring = ReceiveRing::new(2);
            ring.put(1, marker.clone()).unwrap();
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_adversarial_completion_order() {
        cfg_if::cfg_if! {
            if #[cfg(miri)] {
                let (receives, threads) = (16u64, 2);
            } else {
                let (receives, threads) = (512u64, 8);
            }
        }
        for seed in 0..8 {
            let ring = Arc::new(ReceiveRing::new(receives as usize));
            let observed = Arc::new(Mutex::new(Vec::new()));

            let mut order: Vec<u64> = (0..receives).collect();
            order.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));
            let chunks: Vec<Vec<u64>> = order
                .chunks(order.len() / threads)
                .map(<[u64]>::to_vec)
                .collect();

            let handles: Vec<_> = chunks
                .into_iter()
                .map(|chunk| {
                    let ring = ring.clone();
                    let observed = observed.clone();
                    thread::spawn(move || {
                        for sequence in chunk {
                            // The payload of receive `n` is `n`.
                            ring.put(sequence, sequence).unwrap();
                            ring.drain(|_, payload| {
                                observed.lock().unwrap().push(payload);
                                true
                            });
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            ring.drain(|_, payload| {
                observed.lock().unwrap().push(payload);
                true
            });

            let observed = observed.lock().unwrap();
            assert_eq!(*observed, (0..receives).collect::<Vec<_>>());
        }
    }
}
