//! # Tag Pools
//!
//! Fixed-size sub-allocations carved from whole pages.
//!
//! A tag is never freed on its own: it goes back to the pool's free list and
//! is handed out again, zeroed, to the next caller. Pages are released when
//! the pool is dropped.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use magma_core::{ByteSize, Error, GpuAddr, Result};

use crate::allocator::{AllocDesc, AllocFlags, Allocation, PageAllocator};
use crate::mapping::CpuMapping;

// =============================================================================
// TAG NODE
// =============================================================================

/// A fixed-size region inside a pool page
#[derive(Debug, Clone)]
pub struct TagNode {
    page: Allocation,
    offset: u64,
    size: u64,
}

impl TagNode {
    /// Page the tag lives in
    #[inline]
    pub fn allocation(&self) -> &Allocation {
        &self.page
    }

    /// Offset of the tag inside its page
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Tag size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// GPU address of the first byte of the tag
    #[inline]
    pub fn gpu_addr(&self) -> GpuAddr {
        self.page.gpu_addr() + self.offset
    }

    /// Host view restricted to the tag
    pub fn mapping(&self) -> Option<CpuMapping> {
        self.page
            .mapping()
            .and_then(|page| page.subview(self.offset, self.size).ok())
    }
}

// =============================================================================
// TAG POOL
// =============================================================================

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPoolStats {
    /// Pages allocated
    pub pages: u32,
    /// Tags handed out
    pub issued: u64,
    /// Tags returned
    pub returned: u64,
    /// Tags currently live
    pub live: u32,
    /// Tags on the free list
    pub free: u32,
}

struct TagPoolState {
    free: Vec<TagNode>,
    pages: Vec<Allocation>,
    stats: TagPoolStats,
}

/// Free-list pool of equally sized tags
pub struct TagPool {
    allocator: Arc<dyn PageAllocator>,
    flags: AllocFlags,
    tag_size: u64,
    page_size: ByteSize,
    name: &'static str,
    state: Mutex<TagPoolState>,
}

impl TagPool {
    /// Create an empty pool; pages are allocated on demand
    pub fn new(
        allocator: Arc<dyn PageAllocator>,
        flags: AllocFlags,
        tag_size: u64,
        page_size: ByteSize,
        name: &'static str,
    ) -> Result<Self> {
        if tag_size == 0 || tag_size % 8 != 0 || tag_size > page_size.as_bytes() {
            log::warn!("{}: tag size {} does not fit a {} page", name, tag_size, page_size);
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            allocator,
            flags,
            tag_size,
            page_size,
            name,
            state: Mutex::new(TagPoolState {
                free: Vec::new(),
                pages: Vec::new(),
                stats: TagPoolStats::default(),
            }),
        })
    }

    /// Size of every tag handed out
    #[inline]
    pub fn tag_size(&self) -> u64 {
        self.tag_size
    }

    /// Take a tag, growing the pool by one page when the free list is empty
    pub fn get_tag(&self) -> Result<TagNode> {
        let mut state = self.state.lock();

        if let Some(node) = state.free.pop() {
            if let Some(mapping) = node.mapping() {
                mapping.zero();
            }
            state.stats.issued += 1;
            state.stats.live += 1;
            state.stats.free -= 1;
            return Ok(node);
        }

        let page = self.allocator.allocate(&AllocDesc {
            size: self.page_size,
            alignment: self.page_size.as_bytes(),
            flags: self.flags,
            name: self.name,
        })?;
        let count = page.size().as_bytes() / self.tag_size;
        log::debug!(
            "{}: new page at {}, {} tags of {} bytes",
            self.name,
            page.gpu_addr(),
            count,
            self.tag_size
        );

        // Lowest offsets are handed out first.
        for index in (1..count).rev() {
            state.free.push(TagNode {
                page: page.clone(),
                offset: index * self.tag_size,
                size: self.tag_size,
            });
        }
        let node = TagNode {
            page: page.clone(),
            offset: 0,
            size: self.tag_size,
        };

        state.pages.push(page);
        state.stats.pages += 1;
        state.stats.issued += 1;
        state.stats.live += 1;
        state.stats.free += (count - 1) as u32;
        Ok(node)
    }

    /// Give a tag back to the pool
    pub fn return_tag(&self, node: TagNode) {
        let mut state = self.state.lock();
        state.stats.returned += 1;
        state.stats.live = state.stats.live.saturating_sub(1);
        state.stats.free += 1;
        state.free.push(node);
    }

    /// Statistics snapshot
    pub fn stats(&self) -> TagPoolStats {
        self.state.lock().stats.clone()
    }
}

impl Drop for TagPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for page in state.pages.drain(..) {
            if let Err(err) = self.allocator.free(&page) {
                log::warn!("{}: failed to release page {}: {}", self.name, page.gpu_addr(), err);
            }
        }
    }
}

impl fmt::Debug for TagPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagPool")
            .field("name", &self.name)
            .field("tag_size", &self.tag_size)
            .field("page_size", &self.page_size)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SysmemAllocator;

    fn pool(tag_size: u64) -> (Arc<SysmemAllocator>, TagPool) {
        let allocator = Arc::new(SysmemAllocator::new(ByteSize::KIB_4));
        let pool = TagPool::new(
            allocator.clone(),
            AllocFlags::DEVICE_COUNTER,
            tag_size,
            ByteSize::KIB_4,
            "test_tags",
        )
        .unwrap();
        (allocator, pool)
    }

    #[test]
    fn test_tags_carved_from_one_page() {
        let (_, pool) = pool(64);
        let a = pool.get_tag().unwrap();
        let b = pool.get_tag().unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 64);
        assert_eq!(b.gpu_addr(), a.gpu_addr() + 64);

        let stats = pool.stats();
        assert_eq!(stats.pages, 1);
        assert_eq!(stats.live, 2);
        assert_eq!(stats.free, 4096 / 64 - 2);
    }

    #[test]
    fn test_new_page_when_exhausted() {
        let (_, pool) = pool(2048);
        let a = pool.get_tag().unwrap();
        let b = pool.get_tag().unwrap();
        let c = pool.get_tag().unwrap();
        assert_eq!(a.allocation().handle(), b.allocation().handle());
        assert_ne!(a.allocation().handle(), c.allocation().handle());
        assert_eq!(pool.stats().pages, 2);
    }

    #[test]
    fn test_returned_tag_is_reused_zeroed() {
        let (_, pool) = pool(64);
        let a = pool.get_tag().unwrap();
        let addr = a.gpu_addr();
        a.mapping().unwrap().write_u64(8, 99).unwrap();
        pool.return_tag(a);

        let again = pool.get_tag().unwrap();
        assert_eq!(again.gpu_addr(), addr);
        assert_eq!(again.mapping().unwrap().read_u64(8).unwrap(), 0);
        assert_eq!(pool.stats().returned, 1);
    }

    #[test]
    fn test_tag_larger_than_page_rejected() {
        let allocator = Arc::new(SysmemAllocator::new(ByteSize::KIB_4));
        let result = TagPool::new(
            allocator,
            AllocFlags::DEVICE_COUNTER,
            8192,
            ByteSize::KIB_4,
            "too_big",
        );
        assert!(matches!(result, Err(Error::InvalidArgument)));
    }

    #[test]
    fn test_pages_released_on_drop() {
        let (allocator, pool) = pool(64);
        let _tag = pool.get_tag().unwrap();
        drop(pool);
        assert_eq!(allocator.stats().bytes_live, 0);
    }

    #[test]
    fn test_allocator_exhaustion_propagates() {
        let allocator = Arc::new(SysmemAllocator::with_limit(ByteSize::KIB_4, ByteSize::KIB_4));
        let pool = TagPool::new(
            allocator,
            AllocFlags::DEVICE_COUNTER,
            4096,
            ByteSize::KIB_4,
            "tiny",
        )
        .unwrap();
        let _first = pool.get_tag().unwrap();
        assert!(matches!(pool.get_tag(), Err(Error::OutOfMemory)));
    }
}
