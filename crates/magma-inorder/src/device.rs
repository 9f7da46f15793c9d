//! # Device Context
//!
//! Capabilities, the submission-layer seam and the per-device state shared
//! by every in-order command list: counter storage, the synchronized
//! dispatch token and queue id assignment.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Once;

use magma_core::{ByteSize, ClockSource, CommandListHandle, Error, GpuAddr, InOrderConfig, Result};
use magma_mem::{
    AllocDesc, AllocFlags, Allocation, CounterStorageAllocator, CounterStorageConfig,
    PageAllocator,
};

use crate::event::SignalScope;
use crate::host_sync::SyncStatus;

/// Largest partition (tile) count a device may report
pub const MAX_PARTITIONS: usize = 16;

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Device capabilities consulted by the in-order core
#[derive(Debug, Clone)]
pub struct DeviceCaps {
    /// Number of partitions (tiles) the device can split work across
    pub partition_count: u32,
    /// Semaphores and stores can operate on 64-bit values
    pub wide_counter_support: bool,
    /// Completion writes observed by the host need a data-cache flush
    pub host_scope_flush: bool,
    /// Per-partition memory holding the partition index
    pub work_partition_addr: GpuAddr,
}

impl DeviceCaps {
    /// Single-tile device with 64-bit counters
    pub const fn single_tile() -> Self {
        Self {
            partition_count: 1,
            wide_counter_support: true,
            host_scope_flush: false,
            work_partition_addr: GpuAddr::null(),
        }
    }

    /// Multi-tile device with 64-bit counters
    pub const fn multi_tile(partition_count: u32, work_partition_addr: GpuAddr) -> Self {
        Self {
            partition_count,
            wide_counter_support: true,
            host_scope_flush: false,
            work_partition_addr,
        }
    }

    /// Whether a completion with the given scope needs a flush before the write
    #[inline]
    pub fn requires_completion_flush(&self, scope: SignalScope) -> bool {
        self.host_scope_flush && scope.contains(SignalScope::HOST)
    }
}

// =============================================================================
// SUBMISSION LAYER
// =============================================================================

bitflags! {
    /// Submission modifiers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SubmitFlags: u32 {
        /// Batch may be scheduled out of order by the direct-submission scheduler
        const RELAXED_ORDERING = 1 << 0;
        /// Batch comes from an immediate list
        const IMMEDIATE        = 1 << 1;
    }
}

/// Interface to the submission queue and kernel-mode driver
pub trait SubmissionLayer: Send + Sync {
    /// Submit recorded dwords starting at GPU address `base`, returning the task count
    fn submit(&self, commands: &[u32], base: GpuAddr, flags: SubmitFlags) -> Result<u64>;

    /// Make an allocation resident for subsequent submissions
    fn make_resident(&self, allocation: &Allocation) -> Result<()>;

    /// Block on the kernel-mode fence until `task_count` retires
    fn wait_for_task_count(&self, task_count: u64, timeout_ns: u64) -> Result<SyncStatus>;

    /// Refresh the host view of a non-coherent allocation
    fn download_allocation(&self, allocation: &Allocation) -> Result<()>;

    /// Whether the device has hung
    fn is_gpu_hang_detected(&self) -> bool;

    /// Whether the scheduler supports out-of-order completion
    fn supports_relaxed_ordering(&self) -> bool;

    /// Number of producing clients registered with the scheduler
    fn registered_clients(&self) -> u32;

    /// Wait in the kernel until the qword at `addr` reaches `value`
    fn wait_user_fence(&self, addr: GpuAddr, value: u64, timeout_ns: u64) -> Result<bool>;

    /// Release temporary allocations retired by `task_count`
    fn release_completed_allocations(&self, task_count: u64);
}

// =============================================================================
// DEVICE
// =============================================================================

/// Sync-dispatch token size: partition count dword + owner queue dword
const SYNC_TOKEN_SIZE: ByteSize = ByteSize::from_bytes(8);

/// Per-device state of the in-order core
pub struct Device {
    caps: DeviceCaps,
    config: InOrderConfig,
    page_allocator: Arc<dyn PageAllocator>,
    submission: Arc<dyn SubmissionLayer>,
    clock: Arc<dyn ClockSource>,
    counters: Arc<CounterStorageAllocator>,
    sync_token: Once<Allocation>,
    next_queue_id: AtomicU32,
    next_list_id: AtomicU64,
}

impl Device {
    /// Create the device context
    pub fn new(
        caps: DeviceCaps,
        config: InOrderConfig,
        page_allocator: Arc<dyn PageAllocator>,
        submission: Arc<dyn SubmissionLayer>,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Arc<Self>> {
        if caps.partition_count == 0 || caps.partition_count as usize > MAX_PARTITIONS {
            return Err(Error::InvalidArgument);
        }
        let counters = CounterStorageAllocator::new(
            page_allocator.clone(),
            &CounterStorageConfig {
                partition_count: caps.partition_count,
                duplicated_host_storage: config.duplicated_host_storage,
                page_size: config.counter_page_size,
            },
        )?;
        log::debug!(
            "inorder: device with {} partition(s), {} counters",
            caps.partition_count,
            if config.use_wide_counter(caps.wide_counter_support) {
                "64-bit"
            } else {
                "32-bit"
            }
        );
        Ok(Arc::new(Self {
            caps,
            config,
            page_allocator,
            submission,
            clock,
            counters: Arc::new(counters),
            sync_token: Once::new(),
            next_queue_id: AtomicU32::new(0),
            next_list_id: AtomicU64::new(1),
        }))
    }

    /// Capabilities
    #[inline]
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Configuration
    #[inline]
    pub fn config(&self) -> &InOrderConfig {
        &self.config
    }

    /// Submission layer
    #[inline]
    pub fn submission(&self) -> &Arc<dyn SubmissionLayer> {
        &self.submission
    }

    /// Page allocator
    #[inline]
    pub fn page_allocator(&self) -> &Arc<dyn PageAllocator> {
        &self.page_allocator
    }

    /// Clock used by host waits
    #[inline]
    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    /// Counter storage allocator
    #[inline]
    pub fn counter_allocator(&self) -> &Arc<CounterStorageAllocator> {
        &self.counters
    }

    /// Whether counters are 64 bits wide
    #[inline]
    pub fn use_wide_counter(&self) -> bool {
        self.config.use_wide_counter(self.caps.wide_counter_support)
    }

    /// Whether a list spanning `partition_count` partitions signals atomically
    ///
    /// Atomic signalling advances the counter by the partition count per
    /// signal, which only fits the 64-bit counter range.
    pub fn atomic_signalling_for(&self, partition_count: u32) -> bool {
        self.config.atomic_signalling && partition_count > 1 && self.use_wide_counter()
    }

    /// Synchronized dispatch token, allocated on first use
    pub fn sync_dispatch_token(&self) -> Result<&Allocation> {
        self.sync_token.try_call_once(|| {
            let token = self.page_allocator.allocate(&AllocDesc {
                size: SYNC_TOKEN_SIZE,
                alignment: 8,
                flags: AllocFlags::DEVICE_COUNTER,
                name: "sync_dispatch_token",
            })?;
            log::debug!("inorder: sync dispatch token at {}", token.gpu_addr());
            Ok(token)
        })
    }

    /// Assign the next synchronized dispatch queue id
    pub(crate) fn assign_sync_dispatch_queue_id(&self) -> u32 {
        self.next_queue_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a command list handle
    pub(crate) fn next_list_handle(&self) -> CommandListHandle {
        CommandListHandle::new(self.next_list_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(token) = self.sync_token.get() {
            if let Err(err) = self.page_allocator.free(token) {
                log::warn!("inorder: failed to release sync dispatch token: {}", err);
            }
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("caps", &self.caps)
            .field("config", &self.config)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}
