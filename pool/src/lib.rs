//! Lock-free building blocks for recycling memory and objects.
//!
//! # Overview
//!
//! - [stack]: a generation-tagged Treiber stack of slot indices and a bounded
//!   value stack built on it.
//! - [queue]: a bounded Michael-Scott FIFO with conditional dequeue.
//! - [allocator]: a size-classed [SegmentAllocator] that carves owned
//!   [Segment]s out of large arenas.
//! - [object]: [SafePool] and [FastPool] for recycling reusable objects.
//!
//! Nothing in this crate takes a lock. Operations retry bounded
//! compare-and-swap loops; the only wait is a cooperative yield while another
//! thread opens a new arena.

pub mod allocator;
pub mod object;
pub mod queue;
pub mod stack;

pub use allocator::{AllocError, AllocatorConfig, Segment, SegmentAllocator, KB, MB};
pub use object::{FastPool, Poolable, SafePool, Tracked};
pub use queue::LockFreeQueue;
pub use stack::{IndexStack, Links, LockFreeStack};
