//! A bounded lock-free FIFO of `u64` values.
//!
//! Michael-Scott queue over a fixed node array. `head` and `tail` are packed
//! `(generation << 32) | index` words like the heads in [crate::stack], and so
//! are the `next` links of the nodes. A dummy node is always present: `head`
//! points at it and the first value lives in the node after it. Vacant nodes are
//! kept on an [IndexStack].
//!
//! Values are stored in atomics so a dequeuer may read one before it knows
//! whether its compare-and-swap will succeed.

use crate::stack::{pack, unpack, IndexStack, Links, NIL};
use std::sync::atomic::{AtomicU64, Ordering};

struct Node {
    next: AtomicU64,
    value: AtomicU64,
}

/// A bounded multi-producer multi-consumer FIFO.
pub struct LockFreeQueue {
    nodes: Box<[Node]>,
    links: Links,
    vacant: IndexStack,
    head: AtomicU64,
    tail: AtomicU64,
}

impl LockFreeQueue {
    /// Creates a queue holding at most `capacity` values.
    pub fn new(capacity: usize) -> Self {
        // One extra node serves as the initial dummy.
        let nodes: Box<[Node]> = (0..=capacity)
            .map(|_| Node {
                next: AtomicU64::new(pack(0, NIL)),
                value: AtomicU64::new(0),
            })
            .collect();
        let links = Links::new(capacity + 1);
        let vacant = IndexStack::new();
        for index in (1..=capacity as u32).rev() {
            vacant.push(&links, index);
        }
        Self {
            nodes,
            links,
            vacant,
            head: AtomicU64::new(pack(0, 0)),
            tail: AtomicU64::new(pack(0, 0)),
        }
    }

    /// Appends a value, handing it back if the queue is full.
    pub fn enqueue(&self, value: u64) -> Result<(), u64> {
        let Some(index) = self.vacant.pop(&self.links) else {
            return Err(value);
        };
        let node = &self.nodes[index as usize];
        node.value.store(value, Ordering::Relaxed);
        let (generation, _) = unpack(node.next.load(Ordering::Relaxed));
        node.next
            .store(pack(generation.wrapping_add(1), NIL), Ordering::Release);

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let (tail_generation, tail_index) = unpack(tail);
            let last = &self.nodes[tail_index as usize];
            let next = last.next.load(Ordering::Acquire);
            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }

            let (next_generation, next_index) = unpack(next);
            if next_index == NIL {
                if last
                    .next
                    .compare_exchange(
                        next,
                        pack(next_generation.wrapping_add(1), index),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    let _ = self.tail.compare_exchange(
                        tail,
                        pack(tail_generation.wrapping_add(1), index),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    return Ok(());
                }
            } else {
                // Tail is lagging, help it along.
                let _ = self.tail.compare_exchange(
                    tail,
                    pack(tail_generation.wrapping_add(1), next_index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }

    /// Removes the oldest value.
    pub fn dequeue(&self) -> Option<u64> {
        self.dequeue_if(|_| true)
    }

    /// Removes the oldest value only if `predicate` accepts it.
    ///
    /// Returns `None` (leaving the queue untouched) if the queue is empty or the
    /// predicate rejects the value currently at the front.
    pub fn dequeue_if(&self, mut predicate: impl FnMut(u64) -> bool) -> Option<u64> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let (head_generation, head_index) = unpack(head);
            let (tail_generation, tail_index) = unpack(tail);
            let next = self.nodes[head_index as usize].next.load(Ordering::Acquire);
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            let (_, next_index) = unpack(next);
            if head_index == tail_index {
                if next_index == NIL {
                    return None;
                }
                let _ = self.tail.compare_exchange(
                    tail,
                    pack(tail_generation.wrapping_add(1), next_index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            if next_index == NIL {
                continue;
            }

            let value = self.nodes[next_index as usize].value.load(Ordering::Acquire);
            if !predicate(value) {
                // Only trust the rejection if the front did not move meanwhile.
                if head == self.head.load(Ordering::Acquire) {
                    return None;
                }
                continue;
            }
            if self
                .head
                .compare_exchange(
                    head,
                    pack(head_generation.wrapping_add(1), next_index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // The old dummy is ours; `next_index` is the new dummy.
                self.vacant.push(&self.links, head_index);
                return Some(value);
            }
        }
    }

    /// Returns true if the queue held no value when observed.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let (_, head_index) = unpack(head);
        unpack(self.nodes[head_index as usize].next.load(Ordering::Acquire)).1 == NIL
    }

    /// Returns the maximum number of values held at once.
    pub fn capacity(&self) -> usize {
        self.nodes.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        thread,
    };

    #[test]
    fn test_fifo_order() {
        let queue = LockFreeQueue::new(4);
        assert!(queue.is_empty());
        for value in [10, 20, 30] {
            queue.enqueue(value).unwrap();
        }
        assert_eq!(queue.dequeue(), Some(10));
        queue.enqueue(40).unwrap();
        assert_eq!(queue.dequeue(), Some(20));
        assert_eq!(queue.dequeue(), Some(30));
        assert_eq!(queue.dequeue(), Some(40));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_returns_value() {
        let queue = LockFreeQueue::new(2);
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        assert_eq!(queue.enqueue(3), Err(3));

        // Dequeuing frees a node for the next enqueue.
        assert_eq!(queue.dequeue(), Some(1));
        queue.enqueue(3).unwrap();
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
    }

    #[test]
    fn test_dequeue_if_rejects_without_removing() {
        let queue = LockFreeQueue::new(4);
        queue.enqueue(5).unwrap();
        queue.enqueue(6).unwrap();

        assert_eq!(queue.dequeue_if(|value| value > 5), None);
        assert_eq!(queue.dequeue_if(|value| value == 5), Some(5));
        assert_eq!(queue.dequeue_if(|value| value > 5), Some(6));
        assert_eq!(queue.dequeue_if(|_| true), None);
    }

    #[test]
    fn test_concurrent_producers_keep_per_producer_order() {
        cfg_if::cfg_if! {
            if #[cfg(miri)] {
                let per_producer = 32u64;
            } else {
                let per_producer = 10_000u64;
            }
        }
        let producers = 4u64;
        let queue = Arc::new(LockFreeQueue::new(64));

        let mut handles = Vec::new();
        for producer in 0..producers {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                for sequence in 0..per_producer {
                    let mut value = (producer << 32) | sequence;
                    while let Err(rejected) = queue.enqueue(value) {
                        value = rejected;
                        thread::yield_now();
                    }
                }
            }));
        }

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut last = vec![None; producers as usize];
                let mut received = 0;
                while received < producers * per_producer {
                    let Some(value) = queue.dequeue() else {
                        thread::yield_now();
                        continue;
                    };
                    let (producer, sequence) = ((value >> 32) as usize, value & 0xFFFF_FFFF);
                    if let Some(previous) = last[producer] {
                        assert!(sequence > previous, "producer {producer} out of order");
                    }
                    last[producer] = Some(sequence);
                    received += 1;
                }
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        consumer.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_consumers_take_each_value_once() {
        cfg_if::cfg_if! {
            if #[cfg(miri)] {
                let per_producer = 32u64;
            } else {
                let per_producer = 10_000u64;
            }
        }
        let producers = 4u64;
        let total = producers * per_producer;
        let queue = Arc::new(LockFreeQueue::new(32));
        let taken = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for producer in 0..producers {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                for sequence in 0..per_producer {
                    let mut value = (producer << 32) | sequence;
                    while let Err(rejected) = queue.enqueue(value) {
                        value = rejected;
                        thread::yield_now();
                    }
                }
            }));
        }

        // Two consumers take anything; two only take even sequence numbers and
        // leave odd ones at the front for the others.
        let consumers: Vec<_> = (0..4)
            .map(|consumer| {
                let queue = queue.clone();
                let taken = taken.clone();
                thread::spawn(move || {
                    let mut values = Vec::new();
                    while taken.load(Ordering::Acquire) < total {
                        let value = if consumer % 2 == 0 {
                            queue.dequeue()
                        } else {
                            queue.dequeue_if(|value| value % 2 == 0)
                        };
                        match value {
                            Some(value) => {
                                if consumer % 2 == 1 {
                                    assert_eq!(value % 2, 0, "predicate bypassed");
                                }
                                values.push(value);
                                taken.fetch_add(1, Ordering::AcqRel);
                            }
                            None => thread::yield_now(),
                        }
                    }
                    values
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        let mut seen = HashSet::new();
        for consumer in consumers {
            for value in consumer.join().unwrap() {
                assert!(seen.insert(value), "value {value:#x} dequeued twice");
            }
        }
        assert_eq!(seen.len() as u64, total);
        for producer in 0..producers {
            for sequence in 0..per_producer {
                assert!(seen.contains(&((producer << 32) | sequence)));
            }
        }
        assert!(queue.is_empty());
    }
}
