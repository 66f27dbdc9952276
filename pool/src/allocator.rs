//! Size-classed segment allocator.
//!
//! Hands out [Segment]s carved from a small number of large, zeroed arenas.
//! Arenas are never moved or resized; the first is committed when the allocator
//! is created and the rest ("extra" arenas) are opened on demand until the
//! configured memory ceiling is reached.
//!
//! # Size Classes
//!
//! Segments come in power-of-two size classes from `min_size` to `max_size`.
//! With the defaults (1 KiB to 256 KiB) there are 9 classes. Requests are
//! rounded up to the next class and requests above `max_size` fail with
//! [AllocError::Oversized].
//!
//! # Allocation Paths
//!
//! - Recycle: pop a previously freed segment from the class free-list.
//! - Bump: atomically advance the `(arena << 32) | offset` cursor. When the
//!   current arena cannot fit the class, the thread that moves the cursor to the
//!   next arena opens it while racing threads yield.
//!
//! Freeing (dropping) a segment pushes its address onto the free-list of its
//! class. Segments are never merged or split, so a freed segment is only reused
//! by requests of the same class.

use crate::stack::{pack, unpack, IndexStack, Links};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{
    alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout},
    fmt,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    thread,
};
use thiserror::Error;
use tracing::debug;

/// One kibibyte.
pub const KB: usize = 1024;

/// One mebibyte.
pub const MB: usize = 1024 * KB;

/// Errors returned by the [SegmentAllocator].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("requested {requested} bytes exceeds maximum segment size {max}")]
    Oversized { requested: usize, max: usize },
    #[error("memory ceiling reached")]
    Exhausted,
    #[error("invalid allocator config: {0}")]
    InvalidConfig(&'static str),
}

/// Returns the alignment of every arena.
const fn arena_alignment() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
            128
        } else {
            64
        }
    }
}

/// Configuration for a [SegmentAllocator].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Smallest size class. Must be a power of two.
    pub min_size: usize,
    /// Largest size class. Must be a power of two and >= `min_size`.
    pub max_size: usize,
    /// Size of the arena committed at creation.
    pub initial_arena: usize,
    /// Size of every arena opened after the first.
    pub extra_arena: usize,
    /// Upper bound on committed memory.
    pub ceiling: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::with_ceiling_mb(256)
    }
}

impl AllocatorConfig {
    /// Derives arena sizes from a ceiling: the initial arena takes an eighth of
    /// it and extra arenas a sixteenth each.
    pub const fn with_ceiling_mb(ceiling_mb: usize) -> Self {
        Self::with_arenas_mb(ceiling_mb, ceiling_mb / 8, ceiling_mb / 16)
    }

    /// Uses explicit arena sizes (in MiB).
    ///
    /// Sizes that do not fit in `usize` saturate and are rejected by
    /// [AllocatorConfig::validate].
    pub const fn with_arenas_mb(ceiling_mb: usize, initial_mb: usize, extra_mb: usize) -> Self {
        Self {
            min_size: KB,
            max_size: 256 * KB,
            initial_arena: initial_mb.saturating_mul(MB),
            extra_arena: extra_mb.saturating_mul(MB),
            ceiling: ceiling_mb.saturating_mul(MB),
        }
    }

    /// Checks that the configuration describes a usable allocator.
    pub fn validate(&self) -> Result<(), AllocError> {
        if !self.min_size.is_power_of_two() {
            return Err(AllocError::InvalidConfig("min_size must be a power of two"));
        }
        if !self.max_size.is_power_of_two() {
            return Err(AllocError::InvalidConfig("max_size must be a power of two"));
        }
        if self.max_size < self.min_size {
            return Err(AllocError::InvalidConfig("max_size must be >= min_size"));
        }
        if self.initial_arena < self.max_size {
            return Err(AllocError::InvalidConfig("initial arena must fit max_size"));
        }
        if self.initial_arena > self.ceiling {
            return Err(AllocError::InvalidConfig("initial arena exceeds ceiling"));
        }
        if self.ceiling > self.initial_arena && self.extra_arena < self.max_size {
            return Err(AllocError::InvalidConfig("extra arena must fit max_size"));
        }
        if self.initial_arena > u32::MAX as usize || self.extra_arena > u32::MAX as usize {
            return Err(AllocError::InvalidConfig("arena larger than 4 GiB"));
        }
        if self.ceiling / self.min_size >= u32::MAX as usize {
            return Err(AllocError::InvalidConfig("too many segments"));
        }
        Ok(())
    }

    /// Returns the number of arenas the ceiling allows.
    pub fn arena_count(&self) -> usize {
        if self.extra_arena == 0 {
            return 1;
        }
        1 + (self.ceiling - self.initial_arena) / self.extra_arena
    }

    /// Returns the number of size classes.
    pub fn num_classes(&self) -> usize {
        (self.max_size / self.min_size).trailing_zeros() as usize + 1
    }

    /// Returns the class index for `size`, or `None` if it is too large.
    pub fn class_index(&self, size: usize) -> Option<usize> {
        if size > self.max_size {
            return None;
        }
        if size <= self.min_size {
            return Some(0);
        }
        let class = size.next_power_of_two();
        Some((class / self.min_size).trailing_zeros() as usize)
    }

    /// Returns the segment length of class `index`.
    pub const fn class_size(&self, index: usize) -> usize {
        self.min_size << index
    }
}

/// A zeroed, aligned backing block.
struct Arena {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the arena owns its memory; disjoint ranges of it are handed out as
// segments which enforce exclusive access.
unsafe impl Send for Arena {}
// SAFETY: see above.
unsafe impl Sync for Arena {}

impl Arena {
    fn new(layout: Layout) -> Self {
        // SAFETY: layout has a non-zero size (validated against max_size).
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }

    #[inline]
    const fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Label for allocator metrics, identifying the size class.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SizeClassLabel {
    size_class: u64,
}

struct Metrics {
    /// Segments currently held outside the allocator.
    allocated: Family<SizeClassLabel, Gauge>,
    /// Allocations served from a free-list.
    recycled_total: Family<SizeClassLabel, Counter>,
    /// Arenas committed so far.
    arenas: Gauge,
    /// Allocations that hit the ceiling.
    exhausted_total: Counter,
    /// Requests above the largest class.
    oversized_total: Counter,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            allocated: Family::default(),
            recycled_total: Family::default(),
            arenas: Gauge::default(),
            exhausted_total: Counter::default(),
            oversized_total: Counter::default(),
        };
        registry.register(
            "segments_allocated",
            "Number of segments currently allocated",
            metrics.allocated.clone(),
        );
        registry.register(
            "segments_recycled",
            "Total number of allocations served from a free-list",
            metrics.recycled_total.clone(),
        );
        registry.register(
            "arenas",
            "Number of arenas committed",
            metrics.arenas.clone(),
        );
        registry.register(
            "exhausted",
            "Total number of allocations that hit the memory ceiling",
            metrics.exhausted_total.clone(),
        );
        registry.register(
            "oversized",
            "Total number of requests above the largest size class",
            metrics.oversized_total.clone(),
        );
        metrics
    }
}

struct Inner {
    config: AllocatorConfig,
    initial_layout: Layout,
    extra_layout: Option<Layout>,
    arenas: Box<[OnceLock<Arena>]>,
    /// Bump cursor, packed as `(arena << 32) | offset`.
    cursor: AtomicU64,
    /// Packed `(arena << 32) | offset` of the segment each free node describes.
    nodes: Box<[AtomicU64]>,
    links: Links,
    spare: IndexStack,
    ready: Box<[IndexStack]>,
    metrics: Metrics,
}

impl Inner {
    fn layout(&self, arena: usize) -> Option<Layout> {
        if arena == 0 {
            Some(self.initial_layout)
        } else {
            self.extra_layout
        }
    }

    fn recycle(&self, class: usize) -> Option<(u32, u32)> {
        let node = self.ready[class].pop(&self.links)?;
        let address = self.nodes[node as usize].load(Ordering::Acquire);
        self.spare.push(&self.links, node);
        Some(unpack(address))
    }

    fn bump(&self, size: usize) -> Result<(u32, u32), AllocError> {
        let mut current = self.cursor.load(Ordering::Acquire);
        loop {
            let (arena, offset) = unpack(current);
            let Some(slot) = self.arenas.get(arena as usize) else {
                return Err(AllocError::Exhausted);
            };
            let Some(store) = slot.get() else {
                // Another thread moved the cursor here and is still opening it.
                thread::yield_now();
                current = self.cursor.load(Ordering::Acquire);
                continue;
            };

            let end = offset as usize + size;
            if end <= store.len() {
                match self.cursor.compare_exchange_weak(
                    current,
                    pack(arena, end as u32),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok((arena, offset)),
                    Err(actual) => current = actual,
                }
                continue;
            }

            let next = arena + 1;
            let Some(layout) = self.layout(next as usize) else {
                return Err(AllocError::Exhausted);
            };
            if next as usize >= self.arenas.len() {
                return Err(AllocError::Exhausted);
            }
            match self.cursor.compare_exchange(
                current,
                pack(next, 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let _ = self.arenas[next as usize].set(Arena::new(layout));
                    self.metrics.arenas.inc();
                    debug!(arena = next, size = layout.size(), "opened arena");
                    current = pack(next, 0);
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn segment(self: &Arc<Self>, arena: u32, offset: u32, class: usize) -> Segment {
        let len = self.config.class_size(class);
        let store = self.arenas[arena as usize]
            .get()
            .unwrap_or_else(|| unreachable!("segment in unopened arena"));
        debug_assert!(offset as usize + len <= store.len());

        // SAFETY: offset + len lies within the arena (checked when the range was
        // bumped), so the pointer stays in bounds.
        let ptr = unsafe { NonNull::new_unchecked(store.ptr.as_ptr().add(offset as usize)) };
        self.metrics
            .allocated
            .get_or_create(&SizeClassLabel {
                size_class: len as u64,
            })
            .inc();
        Segment {
            ptr,
            len,
            arena,
            offset,
            class: class as u8,
            owner: self.clone(),
        }
    }

    fn release(&self, arena: u32, offset: u32, class: usize) {
        self.metrics
            .allocated
            .get_or_create(&SizeClassLabel {
                size_class: self.config.class_size(class) as u64,
            })
            .dec();

        // There is a node for every min_size bytes below the ceiling, so a
        // spare one always exists.
        let Some(node) = self.spare.pop(&self.links) else {
            debug_assert!(false, "no spare free-list node");
            return;
        };
        self.nodes[node as usize].store(pack(arena, offset), Ordering::Release);
        self.ready[class].push(&self.links, node);
    }
}

/// A size-classed allocator of [Segment]s.
///
/// Cloning is cheap and yields a handle to the same arenas.
#[derive(Clone)]
pub struct SegmentAllocator {
    inner: Arc<Inner>,
}

impl SegmentAllocator {
    /// Creates an allocator and commits its initial arena.
    pub fn new(config: AllocatorConfig, registry: &mut Registry) -> Result<Self, AllocError> {
        config.validate()?;
        let alignment = arena_alignment();
        let initial_layout = Layout::from_size_align(config.initial_arena, alignment)
            .map_err(|_| AllocError::InvalidConfig("initial arena layout"))?;
        let extra_layout = if config.arena_count() > 1 {
            Some(
                Layout::from_size_align(config.extra_arena, alignment)
                    .map_err(|_| AllocError::InvalidConfig("extra arena layout"))?,
            )
        } else {
            None
        };

        let arenas: Box<[OnceLock<Arena>]> =
            (0..config.arena_count()).map(|_| OnceLock::new()).collect();
        let _ = arenas[0].set(Arena::new(initial_layout));

        let node_count = config.ceiling / config.min_size;
        let links = Links::new(node_count);
        let spare = IndexStack::filled(&links);
        let metrics = Metrics::new(registry);
        metrics.arenas.set(1);

        debug!(
            ceiling = config.ceiling,
            initial = config.initial_arena,
            extra = config.extra_arena,
            arenas = arenas.len(),
            "created segment allocator"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                initial_layout,
                extra_layout,
                arenas,
                cursor: AtomicU64::new(pack(0, 0)),
                nodes: (0..node_count).map(|_| AtomicU64::new(0)).collect(),
                links,
                spare,
                ready: (0..config.num_classes()).map(|_| IndexStack::new()).collect(),
                metrics,
                config,
            }),
        })
    }

    /// Allocates a segment of at least `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<Segment, AllocError> {
        let config = &self.inner.config;
        let Some(class) = config.class_index(size) else {
            self.inner.metrics.oversized_total.inc();
            return Err(AllocError::Oversized {
                requested: size,
                max: config.max_size,
            });
        };

        if let Some((arena, offset)) = self.inner.recycle(class) {
            self.inner
                .metrics
                .recycled_total
                .get_or_create(&SizeClassLabel {
                    size_class: config.class_size(class) as u64,
                })
                .inc();
            return Ok(self.inner.segment(arena, offset, class));
        }

        match self.inner.bump(config.class_size(class)) {
            Ok((arena, offset)) => Ok(self.inner.segment(arena, offset, class)),
            Err(err) => {
                self.inner.metrics.exhausted_total.inc();
                Err(err)
            }
        }
    }

    /// Returns a segment to its free-list.
    ///
    /// Equivalent to dropping it.
    pub fn free(&self, segment: Segment) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &segment.owner),
            "segment freed to a foreign allocator"
        );
        drop(segment);
    }

    /// Returns the configuration.
    pub fn config(&self) -> &AllocatorConfig {
        &self.inner.config
    }

    /// Returns the class length a request of `size` bytes would receive.
    pub fn class_size_for(&self, size: usize) -> Option<usize> {
        let config = &self.inner.config;
        config.class_index(size).map(|class| config.class_size(class))
    }

    /// Returns the bump cursor as `(arena, offset)`.
    pub fn cursor(&self) -> (u32, u32) {
        unpack(self.inner.cursor.load(Ordering::Acquire))
    }

    /// Returns the number of bytes committed to arenas.
    pub fn committed(&self) -> usize {
        self.inner
            .arenas
            .iter()
            .filter_map(OnceLock::get)
            .map(Arena::len)
            .sum()
    }
}

/// An owned slice of an arena.
///
/// Not cloneable: exactly one holder exists until the segment is dropped, at
/// which point it returns to the free-list of its size class.
pub struct Segment {
    ptr: NonNull<u8>,
    len: usize,
    arena: u32,
    offset: u32,
    class: u8,
    owner: Arc<Inner>,
}

// SAFETY: a segment has exclusive access to its byte range.
unsafe impl Send for Segment {}
// SAFETY: shared references only permit reads.
unsafe impl Sync for Segment {}

impl Segment {
    /// Returns the length of the segment (its class size).
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the segment has no bytes (never the case for classes).
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the index of the arena holding the segment.
    pub const fn arena(&self) -> u32 {
        self.arena
    }

    /// Returns the offset of the segment within its arena.
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Returns true if both segments come from the same allocator.
    pub fn same_allocator(&self, allocator: &SegmentAllocator) -> bool {
        Arc::ptr_eq(&self.owner, &allocator.inner)
    }
}

impl Deref for Segment {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes and the arena outlives the segment
        // (the segment holds a strong reference to it).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for Segment {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl AsRef<[u8]> for Segment {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for Segment {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("arena", &self.arena)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.owner
            .release(self.arena, self.offset, self.class as usize);
    }
}
