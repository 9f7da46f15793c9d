//! # Counter Storage
//!
//! Pooled storage for in-order counters.
//!
//! ## Tag Layout
//!
//! ```text
//!   partition 0          partition 1          ...
//! ┌─────────┬─────────┬─────────┬─────────┬─────
//! │ slot 0  │ slot 1  │ slot 0  │ slot 1  │
//! │ +0      │ +8      │ +16     │ +24     │
//! └─────────┴─────────┴─────────┴─────────┴─────
//! ```
//!
//! Slot 1 is only used by 32-bit counters, which alternate between the two
//! slots each time they wrap.

use alloc::sync::Arc;

use magma_core::{ByteSize, GpuAddr, Result};

use crate::allocator::{AllocFlags, PageAllocator};
use crate::tag::{TagNode, TagPool, TagPoolStats};

/// Size of one counter slot
pub const COUNTER_SLOT_SIZE: u64 = 8;

/// Offset of the alternate slot used after a 32-bit wrap
pub const OVERFLOW_SLOT_OFFSET: u64 = 8;

/// Distance between the slots of two partitions
pub const PARTITION_STRIDE: u64 = 16;

const TAG_ALIGNMENT: u64 = 64;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Counter storage configuration
#[derive(Debug, Clone)]
pub struct CounterStorageConfig {
    /// Largest partition count any counter will use
    pub partition_count: u32,
    /// Allocate a host-visible mirror for every tag
    pub duplicated_host_storage: bool,
    /// Page size of both pools
    pub page_size: ByteSize,
}

impl CounterStorageConfig {
    /// Bytes needed for one counter
    pub const fn tag_size(&self) -> u64 {
        let partitions = if self.partition_count == 0 {
            1
        } else {
            self.partition_count as u64
        };
        ByteSize::from_bytes(partitions * PARTITION_STRIDE)
            .align_up(TAG_ALIGNMENT)
            .as_bytes()
    }
}

// =============================================================================
// COUNTER TAG
// =============================================================================

/// Storage of one counter: device region plus optional host mirror
#[derive(Debug, Clone)]
pub struct CounterTag {
    /// Region written by the device
    pub device: TagNode,
    /// Host-visible mirror
    pub host: Option<TagNode>,
}

impl CounterTag {
    /// Base device address
    #[inline]
    pub fn device_addr(&self) -> GpuAddr {
        self.device.gpu_addr()
    }

    /// Base address of the host mirror
    #[inline]
    pub fn host_addr(&self) -> Option<GpuAddr> {
        self.host.as_ref().map(TagNode::gpu_addr)
    }
}

// =============================================================================
// ALLOCATOR
// =============================================================================

/// Per-device allocator of counter storage
#[derive(Debug)]
pub struct CounterStorageAllocator {
    device: TagPool,
    host: Option<TagPool>,
}

impl CounterStorageAllocator {
    /// Create the device pool, plus the host pool for duplicated storage
    pub fn new(allocator: Arc<dyn PageAllocator>, config: &CounterStorageConfig) -> Result<Self> {
        let tag_size = config.tag_size();
        let device = TagPool::new(
            allocator.clone(),
            AllocFlags::DEVICE_COUNTER,
            tag_size,
            config.page_size,
            "inorder_counters",
        )?;
        let host = if config.duplicated_host_storage {
            Some(TagPool::new(
                allocator,
                AllocFlags::HOST_COUNTER,
                tag_size,
                config.page_size,
                "inorder_host_counters",
            )?)
        } else {
            None
        };
        Ok(Self { device, host })
    }

    /// Whether tags carry a host mirror
    #[inline]
    pub fn has_host_storage(&self) -> bool {
        self.host.is_some()
    }

    /// Size of every tag
    #[inline]
    pub fn tag_size(&self) -> u64 {
        self.device.tag_size()
    }

    /// Take storage for one counter
    pub fn get_tag(&self) -> Result<CounterTag> {
        let device = self.device.get_tag()?;
        let host = match &self.host {
            Some(pool) => match pool.get_tag() {
                Ok(node) => Some(node),
                Err(err) => {
                    log::warn!("counter host mirror exhausted: {}", err);
                    self.device.return_tag(device);
                    return Err(err);
                }
            },
            None => None,
        };
        Ok(CounterTag { device, host })
    }

    /// Give counter storage back
    pub fn return_tag(&self, tag: CounterTag) {
        self.device.return_tag(tag.device);
        if let (Some(pool), Some(node)) = (&self.host, tag.host) {
            pool.return_tag(node);
        }
    }

    /// Device pool statistics
    pub fn device_stats(&self) -> TagPoolStats {
        self.device.stats()
    }

    /// Host pool statistics
    pub fn host_stats(&self) -> Option<TagPoolStats> {
        self.host.as_ref().map(TagPool::stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SysmemAllocator;
    use magma_core::Error;

    fn config(partition_count: u32, duplicated: bool) -> CounterStorageConfig {
        CounterStorageConfig {
            partition_count,
            duplicated_host_storage: duplicated,
            page_size: ByteSize::KIB_4,
        }
    }

    #[test]
    fn test_tag_size_covers_partitions() {
        assert_eq!(config(1, false).tag_size(), 64);
        assert_eq!(config(4, false).tag_size(), 64);
        assert_eq!(config(8, false).tag_size(), 128);
    }

    #[test]
    fn test_live_tags_are_distinct() {
        let allocator = Arc::new(SysmemAllocator::new(ByteSize::KIB_4));
        let storage = CounterStorageAllocator::new(allocator, &config(2, false)).unwrap();
        let a = storage.get_tag().unwrap();
        let b = storage.get_tag().unwrap();
        assert_ne!(a.device_addr(), b.device_addr());
        assert!(a.host.is_none());

        let addr = a.device_addr();
        storage.return_tag(a);
        let c = storage.get_tag().unwrap();
        assert_eq!(c.device_addr(), addr);
    }

    #[test]
    fn test_duplicated_storage_pairs_tags() {
        let allocator = Arc::new(SysmemAllocator::new(ByteSize::KIB_4));
        let storage = CounterStorageAllocator::new(allocator, &config(1, true)).unwrap();
        let tag = storage.get_tag().unwrap();
        let host = tag.host.as_ref().unwrap();
        assert!(host.allocation().is_host_coherent());
        assert_ne!(tag.host_addr(), Some(tag.device_addr()));
        assert_eq!(storage.host_stats().unwrap().live, 1);

        storage.return_tag(tag);
        assert_eq!(storage.device_stats().live, 0);
        assert_eq!(storage.host_stats().unwrap().live, 0);
    }

    #[test]
    fn test_host_failure_returns_device_tag() {
        // One page only: the device pool takes it, the host pool fails.
        let allocator = Arc::new(SysmemAllocator::with_limit(ByteSize::KIB_4, ByteSize::KIB_4));
        let storage = CounterStorageAllocator::new(allocator, &config(1, true)).unwrap();
        assert!(matches!(storage.get_tag(), Err(Error::OutOfMemory)));
        assert_eq!(storage.device_stats().live, 0);
    }
}
