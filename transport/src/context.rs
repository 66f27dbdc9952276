//! Buffers and descriptors shared by every server of a [crate::Manager].

use crate::{descriptor::DEFAULT_SIZE, Error, IoDescriptor};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::debug;
use turnstone_pool::{AllocatorConfig, SafePool, SegmentAllocator};

/// Owns the segment allocator and the descriptor pool.
///
/// Created once per manager and shared by reference with its servers. Dropping
/// the last reference releases the pooled descriptors; arenas are freed once
/// every outstanding segment has been dropped as well.
pub struct Context {
    allocator: SegmentAllocator,
    descriptors: SafePool<IoDescriptor>,
}

impl Context {
    /// Creates the allocator and a descriptor pool sized to its ceiling.
    pub fn new(config: AllocatorConfig, registry: &mut Registry) -> Result<Arc<Self>, Error> {
        let allocator = SegmentAllocator::new(
            config.clone(),
            registry.sub_registry_with_prefix("allocator"),
        )?;
        let capacity = config.ceiling / DEFAULT_SIZE;
        debug!(capacity, "created descriptor pool");
        Ok(Arc::new(Self {
            allocator,
            descriptors: SafePool::new(capacity, IoDescriptor::default),
        }))
    }

    /// Returns the segment allocator.
    pub fn allocator(&self) -> &SegmentAllocator {
        &self.allocator
    }

    /// Takes a descriptor in its default state.
    pub fn descriptor(&self) -> IoDescriptor {
        self.descriptors.get()
    }

    /// Resets a descriptor (releasing its segment) and returns it to the pool.
    pub fn recycle(&self, descriptor: IoDescriptor) {
        self.descriptors.put(descriptor);
    }

    /// Returns the number of descriptors constructed so far.
    pub fn descriptors_created(&self) -> usize {
        self.descriptors.created()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use turnstone_pool::MB;

    /// Creates a small context for tests.
    pub(crate) fn test_context() -> Arc<Context> {
        let config = AllocatorConfig::with_arenas_mb(4, 1, 1);
        Context::new(config, &mut Registry::default()).unwrap()
    }

    #[test]
    fn test_recycled_descriptors_are_reset() {
        let context = test_context();
        let mut descriptor = context.descriptor();
        descriptor.copy_from(context.allocator(), b"hello").unwrap();
        descriptor.set_sequence(9);
        context.recycle(descriptor);

        let descriptor = context.descriptor();
        assert!(descriptor.is_default());
        assert_eq!(context.descriptors_created(), 1);
    }

    #[test]
    fn test_pool_capacity_follows_ceiling() {
        let context = test_context();
        assert_eq!(context.allocator().config().ceiling, 4 * MB);
        assert_eq!(context.descriptors.capacity(), 4 * MB / DEFAULT_SIZE);
    }
}
