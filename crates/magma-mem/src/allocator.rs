//! # Page Allocation
//!
//! The seam between counter storage and the driver's general allocation
//! subsystem, plus a system-memory implementation of it.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use magma_core::{BufferHandle, ByteSize, Error, GpuAddr, Result};

use crate::mapping::CpuMapping;

// =============================================================================
// ALLOCATION FLAGS
// =============================================================================

bitflags! {
    /// Placement and visibility of an allocation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// Placed in device-local memory
        const DEVICE_LOCAL  = 1 << 0;
        /// Host can map the allocation
        const HOST_VISIBLE  = 1 << 1;
        /// Host view is coherent with device writes
        const HOST_COHERENT = 1 << 2;
    }
}

impl AllocFlags {
    /// Device counter storage
    pub const DEVICE_COUNTER: Self = Self::DEVICE_LOCAL.union(Self::HOST_VISIBLE);
    /// Host mirror of counter storage
    pub const HOST_COUNTER: Self = Self::HOST_VISIBLE.union(Self::HOST_COHERENT);
}

// =============================================================================
// ALLOCATION
// =============================================================================

/// Allocation request
#[derive(Debug, Clone)]
pub struct AllocDesc {
    /// Size in bytes
    pub size: ByteSize,
    /// Required GPU VA alignment
    pub alignment: u64,
    /// Placement flags
    pub flags: AllocFlags,
    /// Debug name
    pub name: &'static str,
}

/// A GPU-visible allocation
#[derive(Debug, Clone)]
pub struct Allocation {
    handle: BufferHandle,
    gpu_addr: GpuAddr,
    size: ByteSize,
    flags: AllocFlags,
    mapping: Option<CpuMapping>,
}

impl Allocation {
    /// Describe an allocation made by an allocator
    pub fn new(
        handle: BufferHandle,
        gpu_addr: GpuAddr,
        size: ByteSize,
        flags: AllocFlags,
        mapping: Option<CpuMapping>,
    ) -> Self {
        Self {
            handle,
            gpu_addr,
            size,
            flags,
            mapping,
        }
    }

    /// Residency handle
    #[inline]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// GPU virtual address of the first byte
    #[inline]
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Size
    #[inline]
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Placement flags
    #[inline]
    pub fn flags(&self) -> AllocFlags {
        self.flags
    }

    /// Host view, if the allocation is mapped
    #[inline]
    pub fn mapping(&self) -> Option<&CpuMapping> {
        self.mapping.as_ref()
    }

    /// Whether host reads observe device writes without a download
    #[inline]
    pub fn is_host_coherent(&self) -> bool {
        self.flags.contains(AllocFlags::HOST_COHERENT)
    }
}

// =============================================================================
// PAGE ALLOCATOR TRAIT
// =============================================================================

/// Allocator of page-granular GPU memory
pub trait PageAllocator: Send + Sync {
    /// Allocate memory
    fn allocate(&self, desc: &AllocDesc) -> Result<Allocation>;

    /// Release memory previously returned by `allocate`
    fn free(&self, allocation: &Allocation) -> Result<()>;

    /// Allocation granularity
    fn page_size(&self) -> ByteSize;
}

// =============================================================================
// SYSTEM MEMORY ALLOCATOR
// =============================================================================

/// Allocator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Total allocations
    pub allocs: u64,
    /// Total frees
    pub frees: u64,
    /// Bytes currently allocated
    pub bytes_live: u64,
}

/// System-memory backed allocator with a linear GPU VA space
#[derive(Debug)]
pub struct SysmemAllocator {
    next_va: AtomicU64,
    next_handle: AtomicU64,
    page_size: ByteSize,
    limit: Option<u64>,
    state: Mutex<SysmemState>,
}

#[derive(Debug, Default)]
struct SysmemState {
    live: Vec<(BufferHandle, u64)>,
    stats: AllocatorStats,
}

impl SysmemAllocator {
    /// Default base of the GPU VA range handed out
    pub const VA_BASE: u64 = 0x0000_0001_0000_0000;

    /// Create an allocator without a capacity limit
    pub fn new(page_size: ByteSize) -> Self {
        Self {
            next_va: AtomicU64::new(Self::VA_BASE),
            next_handle: AtomicU64::new(1),
            page_size,
            limit: None,
            state: Mutex::new(SysmemState::default()),
        }
    }

    /// Create an allocator that fails once `limit` bytes are live
    pub fn with_limit(page_size: ByteSize, limit: ByteSize) -> Self {
        Self {
            limit: Some(limit.as_bytes()),
            ..Self::new(page_size)
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> AllocatorStats {
        self.state.lock().stats.clone()
    }
}

impl PageAllocator for SysmemAllocator {
    fn allocate(&self, desc: &AllocDesc) -> Result<Allocation> {
        if desc.size.as_bytes() == 0 || !desc.alignment.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        let size = desc.size.align_up(self.page_size.as_bytes());

        let mut state = self.state.lock();
        if let Some(limit) = self.limit {
            if state.stats.bytes_live + size.as_bytes() > limit {
                log::warn!("sysmem: {} exhausted ({} requested)", desc.name, size);
                return Err(Error::OutOfMemory);
            }
        }

        let alignment = desc.alignment.max(self.page_size.as_bytes());
        let va = self
            .next_va
            .fetch_add(size.as_bytes() + alignment, Ordering::Relaxed);
        let gpu_addr = GpuAddr::new(va).align_up(alignment);
        let handle = BufferHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));

        state.live.push((handle, size.as_bytes()));
        state.stats.allocs += 1;
        state.stats.bytes_live += size.as_bytes();

        log::debug!("sysmem: {} {:?} at {} ({})", desc.name, handle, gpu_addr, size);
        Ok(Allocation::new(
            handle,
            gpu_addr,
            size,
            desc.flags,
            Some(CpuMapping::zeroed(size)),
        ))
    }

    fn free(&self, allocation: &Allocation) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .live
            .iter()
            .position(|(handle, _)| *handle == allocation.handle())
            .ok_or(Error::NotFound)?;
        let (_, bytes) = state.live.swap_remove(index);
        state.stats.frees += 1;
        state.stats.bytes_live -= bytes;
        Ok(())
    }

    fn page_size(&self) -> ByteSize {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(size: ByteSize) -> AllocDesc {
        AllocDesc {
            size,
            alignment: 8,
            flags: AllocFlags::DEVICE_COUNTER,
            name: "test",
        }
    }

    #[test]
    fn test_allocations_do_not_overlap() {
        let allocator = SysmemAllocator::new(ByteSize::KIB_4);
        let a = allocator.allocate(&desc(ByteSize::KIB_4)).unwrap();
        let b = allocator.allocate(&desc(ByteSize::KIB_4)).unwrap();
        assert!(b.gpu_addr().raw() >= a.gpu_addr().raw() + a.size().as_bytes());
        assert!(a.gpu_addr().is_aligned(4096));
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn test_limit_reports_out_of_memory() {
        let allocator = SysmemAllocator::with_limit(ByteSize::KIB_4, ByteSize::from_kib(8));
        allocator.allocate(&desc(ByteSize::KIB_4)).unwrap();
        allocator.allocate(&desc(ByteSize::KIB_4)).unwrap();
        assert!(matches!(
            allocator.allocate(&desc(ByteSize::KIB_4)),
            Err(Error::OutOfMemory)
        ));
    }

    #[test]
    fn test_free_updates_stats() {
        let allocator = SysmemAllocator::new(ByteSize::KIB_4);
        let a = allocator.allocate(&desc(ByteSize::from_bytes(100))).unwrap();
        assert_eq!(a.size(), ByteSize::KIB_4);
        allocator.free(&a).unwrap();
        assert!(matches!(allocator.free(&a), Err(Error::NotFound)));

        let stats = allocator.stats();
        assert_eq!(stats.allocs, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.bytes_live, 0);
    }

    #[test]
    fn test_coherency_follows_flags() {
        let allocator = SysmemAllocator::new(ByteSize::KIB_4);
        let device = allocator.allocate(&desc(ByteSize::KIB_4)).unwrap();
        let host = allocator
            .allocate(&AllocDesc {
                flags: AllocFlags::HOST_COUNTER,
                ..desc(ByteSize::KIB_4)
            })
            .unwrap();
        assert!(!device.is_host_coherent());
        assert!(host.is_host_coherent());
        assert!(host.mapping().is_some());
    }
}
