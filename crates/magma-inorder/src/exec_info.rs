//! # In-Order Execution Info
//!
//! The counter-based synchronization primitive shared by a command list and
//! every event it signals.
//!
//! ## Counter Semantics
//!
//! ```text
//!   append 1      append 2      append 3
//!  ──────────── ──────────── ────────────►  device order
//!   signals 1     signals 2     signals 3   (increment 1)
//!
//!   waiter for "append 2" ─► wait until memory[base + offset] >= 2
//! ```
//!
//! The host-side `counter_value` is the value the most recently recorded
//! signal will write. Device memory catches up as work retires.
//!
//! 32-bit counters cannot grow past `u32::MAX`. When a signal reaches that
//! bound the counter moves to the alternate slot eight bytes away and
//! restarts from the overflow, counted from one. 64-bit counters never wrap.
//!
//! Every wrap and every reset starts a new epoch. Values recorded in an
//! older epoch no longer compare against the live counter.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use arrayvec::ArrayVec;

use magma_core::{Error, GpuAddr, Result};
use magma_mem::{
    Allocation, CounterStorageAllocator, CounterTag, CpuMapping, OVERFLOW_SLOT_OFFSET,
    PARTITION_STRIDE,
};

use crate::device::MAX_PARTITIONS;

/// Largest value a 32-bit counter slot holds before wrapping
pub const NARROW_COUNTER_LIMIT: u64 = u32::MAX as u64;

// =============================================================================
// DESCRIPTOR
// =============================================================================

/// Creation parameters of an `InOrderExecInfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InOrderExecInfoDesc {
    /// Partitions writing the counter
    pub partition_count: u32,
    /// 64-bit counter
    pub wide_counter: bool,
    /// Signal with one atomic increment executed by every partition
    pub atomic_signalling: bool,
    /// Owned by a replayable list
    pub regular: bool,
}

impl InOrderExecInfoDesc {
    /// Single partition, 64-bit, immediate
    pub const fn new() -> Self {
        Self {
            partition_count: 1,
            wide_counter: true,
            atomic_signalling: false,
            regular: false,
        }
    }
}

impl Default for InOrderExecInfoDesc {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of advancing the counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUpdate {
    /// Counter advanced in place
    Advanced {
        /// New counter value
        value: u64,
    },
    /// 32-bit counter wrapped to the alternate slot
    Wrapped {
        /// Value the old slot reaches before the wrap
        saturated: u64,
        /// Counter value in the new slot
        restart: u64,
        /// Slot offset before the wrap
        previous_offset: u32,
        /// Slot offset after the wrap
        offset: u32,
    },
}

/// Host-readable view of a counter
#[derive(Debug, Clone)]
pub struct CounterView {
    /// Allocation to download before reading, if not coherent
    pub allocation: Option<Allocation>,
    /// Mapping of the counter base
    pub mapping: CpuMapping,
    /// Whether the view is the single-slot host mirror
    pub host_mirror: bool,
}

// =============================================================================
// STORAGE
// =============================================================================

#[derive(Debug)]
enum CounterStorage {
    /// Tag from the device pool, returned on drop
    Pooled {
        tag: Option<CounterTag>,
        allocator: Arc<CounterStorageAllocator>,
    },
    /// Caller-provided memory, never released here
    External {
        device_addr: GpuAddr,
        host: Option<CpuMapping>,
    },
}

// =============================================================================
// IN-ORDER EXEC INFO
// =============================================================================

/// Counter state of one in-order command list
#[derive(Debug)]
pub struct InOrderExecInfo {
    storage: CounterStorage,
    counter_value: AtomicU64,
    allocation_offset: AtomicU32,
    regular_submission_counter: AtomicU64,
    epoch: AtomicU64,
    partition_count: u32,
    wide_counter: bool,
    atomic_signalling: bool,
    regular: bool,
}

impl InOrderExecInfo {
    /// Create counter state backed by a pooled tag
    pub fn new(
        allocator: &Arc<CounterStorageAllocator>,
        desc: InOrderExecInfoDesc,
    ) -> Result<Arc<Self>> {
        Self::validate(&desc)?;
        let tag = allocator.get_tag()?;
        log::debug!(
            "inorder: counter at {} ({} partition(s), {})",
            tag.device_addr(),
            desc.partition_count,
            if desc.regular { "regular" } else { "immediate" }
        );
        Ok(Arc::new(Self::with_storage(
            CounterStorage::Pooled {
                tag: Some(tag),
                allocator: Arc::clone(allocator),
            },
            desc,
        )))
    }

    /// Create counter state over caller-provided memory
    ///
    /// Used by standalone counter-based events; `value` is the initial
    /// target the memory must reach.
    pub fn external(
        device_addr: GpuAddr,
        host: Option<CpuMapping>,
        value: u64,
        desc: InOrderExecInfoDesc,
    ) -> Result<Arc<Self>> {
        Self::validate(&desc)?;
        if device_addr.is_null() || !device_addr.is_aligned(8) {
            return Err(Error::InvalidArgument);
        }
        let info = Self::with_storage(CounterStorage::External { device_addr, host }, desc);
        info.counter_value.store(value, Ordering::Release);
        Ok(Arc::new(info))
    }

    fn validate(desc: &InOrderExecInfoDesc) -> Result<()> {
        if desc.partition_count == 0 || desc.partition_count as usize > MAX_PARTITIONS {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn with_storage(storage: CounterStorage, desc: InOrderExecInfoDesc) -> Self {
        Self {
            storage,
            counter_value: AtomicU64::new(0),
            allocation_offset: AtomicU32::new(0),
            regular_submission_counter: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            partition_count: desc.partition_count,
            wide_counter: desc.wide_counter,
            atomic_signalling: desc.atomic_signalling && desc.partition_count > 1,
            regular: desc.regular,
        }
    }

    // =========================================================================
    // Counter
    // =========================================================================

    /// Value the most recent signal writes
    #[inline]
    pub fn counter_value(&self) -> u64 {
        self.counter_value.load(Ordering::Acquire)
    }

    /// Amount every signal advances the counter by
    #[inline]
    pub fn increment_value(&self) -> u64 {
        if self.atomic_signalling {
            self.partition_count as u64
        } else {
            1
        }
    }

    /// Value the next signal writes into the current slot
    pub fn next_signal_value(&self) -> u64 {
        let next = self.counter_value().saturating_add(self.increment_value());
        if self.wide_counter {
            next
        } else {
            next.min(NARROW_COUNTER_LIMIT)
        }
    }

    /// Advance the counter by `n`, wrapping 32-bit counters at their limit
    pub fn add_counter_value(&self, n: u64) -> CounterUpdate {
        let next = self.counter_value().saturating_add(n);
        if self.wide_counter || next < NARROW_COUNTER_LIMIT {
            self.counter_value.store(next, Ordering::Release);
            return CounterUpdate::Advanced { value: next };
        }

        let restart = next - NARROW_COUNTER_LIMIT + 1;
        let previous_offset = self.allocation_offset();
        let offset = if previous_offset == 0 {
            OVERFLOW_SLOT_OFFSET as u32
        } else {
            0
        };
        self.allocation_offset.store(offset, Ordering::Release);
        self.counter_value.store(restart, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        log::debug!(
            "inorder: counter wrapped at {}, slot {} -> {}, restart {}",
            next,
            previous_offset,
            offset,
            restart
        );
        CounterUpdate::Wrapped {
            saturated: next.min(NARROW_COUNTER_LIMIT),
            restart,
            previous_offset,
            offset,
        }
    }

    /// Current slot offset
    #[inline]
    pub fn allocation_offset(&self) -> u32 {
        self.allocation_offset.load(Ordering::Acquire)
    }

    /// Move the counter to another slot
    #[inline]
    pub fn set_allocation_offset(&self, offset: u32) {
        self.allocation_offset.store(offset, Ordering::Release);
    }

    /// Wrap and reset generation
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Put back a counter position taken before a failed recording
    pub(crate) fn restore(&self, counter_value: u64, allocation_offset: u32, epoch: u64) {
        self.counter_value.store(counter_value, Ordering::Release);
        self.allocation_offset.store(allocation_offset, Ordering::Release);
        self.epoch.store(epoch, Ordering::Release);
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Number of times the owning replayable list was enqueued
    #[inline]
    pub fn regular_submission_counter(&self) -> u64 {
        self.regular_submission_counter.load(Ordering::Acquire)
    }

    /// Record `n` more enqueues of the owning replayable list
    #[inline]
    pub fn add_regular_submission_counter(&self, n: u64) {
        self.regular_submission_counter.fetch_add(n, Ordering::AcqRel);
    }

    /// Take back `n` enqueues that never reached the device
    #[inline]
    pub(crate) fn sub_regular_submission_counter(&self, n: u64) {
        self.regular_submission_counter.fetch_sub(n, Ordering::AcqRel);
    }

    /// Device value a signal recorded with `base` reaches in the latest replay
    pub fn effective_wait_value(&self, base: u64) -> u64 {
        let submissions = self.regular_submission_counter();
        if self.regular && submissions > 1 {
            base + self.counter_value() * (submissions - 1)
        } else {
            base
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Partitions writing the counter
    #[inline]
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Slots a waiter has to check
    #[inline]
    pub fn num_partitions_to_wait(&self) -> u32 {
        if self.atomic_signalling {
            1
        } else {
            self.partition_count
        }
    }

    /// Whether signals are single atomic increments
    #[inline]
    pub fn is_atomic_device_signalling(&self) -> bool {
        self.atomic_signalling
    }

    /// Whether writes are mirrored into host storage
    #[inline]
    pub fn is_host_storage_duplicated(&self) -> bool {
        self.host_tag().is_some()
    }

    /// Whether the counter is 64 bits wide
    #[inline]
    pub fn is_wide_counter(&self) -> bool {
        self.wide_counter
    }

    /// Whether the owning list is replayable
    #[inline]
    pub fn is_regular(&self) -> bool {
        self.regular
    }

    /// Whether the storage is caller provided
    #[inline]
    pub fn is_external(&self) -> bool {
        matches!(self.storage, CounterStorage::External { .. })
    }

    // =========================================================================
    // Addresses
    // =========================================================================

    fn device_tag(&self) -> Option<&CounterTag> {
        match &self.storage {
            CounterStorage::Pooled { tag, .. } => tag.as_ref(),
            CounterStorage::External { .. } => None,
        }
    }

    fn host_tag(&self) -> Option<&magma_mem::TagNode> {
        self.device_tag().and_then(|tag| tag.host.as_ref())
    }

    /// Base address of the device counter
    pub fn base_device_address(&self) -> GpuAddr {
        match &self.storage {
            CounterStorage::Pooled { tag, .. } => {
                tag.as_ref().map(CounterTag::device_addr).unwrap_or_default()
            }
            CounterStorage::External { device_addr, .. } => *device_addr,
        }
    }

    /// Base address of the host mirror
    pub fn base_host_address(&self) -> Option<GpuAddr> {
        self.host_tag().map(magma_mem::TagNode::gpu_addr)
    }

    /// Address of the current slot of partition 0
    #[inline]
    pub fn device_counter_address(&self) -> GpuAddr {
        self.base_device_address() + self.allocation_offset() as u64
    }

    /// Address of the current slot of the host mirror
    #[inline]
    pub fn host_counter_address(&self) -> Option<GpuAddr> {
        self.base_host_address()
            .map(|addr| addr + self.allocation_offset() as u64)
    }

    /// Addresses of the slots at `offset`, one per partition a waiter checks
    pub fn partition_slots(&self, offset: u32) -> ArrayVec<GpuAddr, MAX_PARTITIONS> {
        let base = self.base_device_address() + offset as u64;
        (0..self.num_partitions_to_wait())
            .map(|partition| base + partition as u64 * PARTITION_STRIDE)
            .collect()
    }

    /// Device allocation backing the counter
    pub fn device_allocation(&self) -> Option<&Allocation> {
        self.device_tag().map(|tag| tag.device.allocation())
    }

    /// Host mirror allocation
    pub fn host_allocation(&self) -> Option<&Allocation> {
        self.host_tag().map(magma_mem::TagNode::allocation)
    }

    /// Host view of the device counter
    pub fn device_mapping(&self) -> Option<CpuMapping> {
        match &self.storage {
            CounterStorage::Pooled { tag, .. } => tag.as_ref().and_then(|tag| tag.device.mapping()),
            CounterStorage::External { host, .. } => host.clone(),
        }
    }

    /// Host view of the mirror
    pub fn host_mapping(&self) -> Option<CpuMapping> {
        self.host_tag().and_then(magma_mem::TagNode::mapping)
    }

    /// View a host waiter polls: the mirror when present, else device storage
    pub fn counter_view(&self) -> Option<CounterView> {
        if let (Some(allocation), Some(mapping)) = (self.host_allocation(), self.host_mapping()) {
            return Some(CounterView {
                allocation: Some(allocation.clone()),
                mapping,
                host_mirror: true,
            });
        }
        self.device_mapping().map(|mapping| CounterView {
            allocation: self.device_allocation().cloned(),
            mapping,
            host_mirror: false,
        })
    }

    /// Whether every slot of `view` at `offset` holds at least `value`
    pub fn is_counter_reached(&self, view: &CounterView, offset: u32, value: u64) -> Result<bool> {
        let slots = if view.host_mirror {
            1
        } else {
            self.num_partitions_to_wait()
        };
        for partition in 0..slots {
            let slot = offset as u64 + partition as u64 * PARTITION_STRIDE;
            let raw = view.mapping.read_u64(slot)?;
            let current = if self.wide_counter {
                raw
            } else {
                raw & NARROW_COUNTER_LIMIT
            };
            if current < value {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Zero the counter, slot offset, replay count and pooled storage
    ///
    /// Starts a new epoch.
    pub fn reset(&self) {
        self.counter_value.store(0, Ordering::Release);
        self.allocation_offset.store(0, Ordering::Release);
        self.regular_submission_counter.store(0, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if !self.is_external() {
            if let Some(mapping) = self.device_mapping() {
                mapping.zero();
            }
            if let Some(mapping) = self.host_mapping() {
                mapping.zero();
            }
        }
    }
}

impl Drop for InOrderExecInfo {
    fn drop(&mut self) {
        if let CounterStorage::Pooled { tag, allocator } = &mut self.storage {
            if let Some(tag) = tag.take() {
                log::debug!("inorder: returning counter {}", tag.device_addr());
                allocator.return_tag(tag);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use magma_core::ByteSize;

    fn info(fixture: &Fixture, desc: InOrderExecInfoDesc) -> Arc<InOrderExecInfo> {
        InOrderExecInfo::new(fixture.device.counter_allocator(), desc).unwrap()
    }

    #[test]
    fn test_counter_advances_by_increment() {
        let fixture = Fixture::single_tile();
        let info = info(&fixture, InOrderExecInfoDesc::new());
        assert_eq!(info.counter_value(), 0);
        assert_eq!(info.increment_value(), 1);
        for expected in 1..=5 {
            let update = info.add_counter_value(info.increment_value());
            assert_eq!(update, CounterUpdate::Advanced { value: expected });
        }
        assert_eq!(info.counter_value(), 5);
    }

    #[test]
    fn test_atomic_multi_partition_increment() {
        let fixture = Fixture::multi_tile(4);
        let info = info(
            &fixture,
            InOrderExecInfoDesc {
                partition_count: 4,
                atomic_signalling: true,
                ..InOrderExecInfoDesc::new()
            },
        );
        assert!(info.is_atomic_device_signalling());
        assert_eq!(info.increment_value(), 4);
        assert_eq!(info.num_partitions_to_wait(), 1);
        assert_eq!(info.partition_slots(0).len(), 1);
    }

    #[test]
    fn test_non_atomic_partitions_have_own_slots() {
        let fixture = Fixture::multi_tile(2);
        let info = info(
            &fixture,
            InOrderExecInfoDesc {
                partition_count: 2,
                ..InOrderExecInfoDesc::new()
            },
        );
        let slots = info.partition_slots(0);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1], slots[0] + PARTITION_STRIDE);
        assert_eq!(info.increment_value(), 1);
    }

    #[test]
    fn test_narrow_counter_wraps_between_slots() {
        let fixture = Fixture::single_tile();
        let info = info(
            &fixture,
            InOrderExecInfoDesc {
                wide_counter: false,
                ..InOrderExecInfoDesc::new()
            },
        );
        info.add_counter_value(NARROW_COUNTER_LIMIT - 1);
        assert_eq!(info.allocation_offset(), 0);
        assert_eq!(info.epoch(), 0);

        let update = info.add_counter_value(1);
        assert_eq!(
            update,
            CounterUpdate::Wrapped {
                saturated: NARROW_COUNTER_LIMIT,
                restart: 1,
                previous_offset: 0,
                offset: 8,
            }
        );
        assert_eq!(info.counter_value(), 1);
        assert_eq!(info.device_counter_address(), info.base_device_address() + 8);
        assert_eq!(info.epoch(), 1);

        info.add_counter_value(NARROW_COUNTER_LIMIT - 2);
        assert!(matches!(
            info.add_counter_value(1),
            CounterUpdate::Wrapped { offset: 0, .. }
        ));
        assert_eq!(info.allocation_offset(), 0);
        assert_eq!(info.epoch(), 2);
    }

    #[test]
    fn test_wide_counter_never_wraps() {
        let fixture = Fixture::single_tile();
        let info = info(&fixture, InOrderExecInfoDesc::new());
        info.add_counter_value(NARROW_COUNTER_LIMIT);
        assert_eq!(
            info.add_counter_value(1),
            CounterUpdate::Advanced {
                value: NARROW_COUNTER_LIMIT + 1
            }
        );
        assert_eq!(info.allocation_offset(), 0);
    }

    #[test]
    fn test_effective_wait_value_for_replays() {
        let fixture = Fixture::single_tile();
        let info = info(
            &fixture,
            InOrderExecInfoDesc {
                regular: true,
                ..InOrderExecInfoDesc::new()
            },
        );
        info.add_counter_value(4);
        assert_eq!(info.effective_wait_value(3), 3);
        info.add_regular_submission_counter(1);
        assert_eq!(info.effective_wait_value(3), 3);
        info.add_regular_submission_counter(2);
        assert_eq!(info.effective_wait_value(3), 3 + 2 * 4);
    }

    #[test]
    fn test_tag_returned_on_last_drop() {
        let fixture = Fixture::single_tile();
        let allocator = fixture.device.counter_allocator().clone();
        let first = info(&fixture, InOrderExecInfoDesc::new());
        let addr = first.base_device_address();
        let shared = Arc::clone(&first);
        drop(first);
        assert_eq!(allocator.device_stats().live, 1);
        drop(shared);
        assert_eq!(allocator.device_stats().live, 0);

        let second = info(&fixture, InOrderExecInfoDesc::new());
        assert_eq!(second.base_device_address(), addr);
    }

    #[test]
    fn test_duplicated_storage_exposes_host_view() {
        let fixture = Fixture::with(
            crate::device::DeviceCaps::single_tile(),
            magma_core::InOrderConfig::new().with_duplicated_host_storage(true),
        );
        let info = info(&fixture, InOrderExecInfoDesc::new());
        assert!(info.is_host_storage_duplicated());
        let view = info.counter_view().unwrap();
        assert!(view.host_mirror);
        assert!(view.allocation.unwrap().is_host_coherent());
        assert_ne!(info.base_host_address(), Some(info.base_device_address()));
    }

    #[test]
    fn test_counter_reached_checks_every_partition() {
        let fixture = Fixture::multi_tile(2);
        let info = info(
            &fixture,
            InOrderExecInfoDesc {
                partition_count: 2,
                ..InOrderExecInfoDesc::new()
            },
        );
        let view = info.counter_view().unwrap();
        view.mapping.write_u64(0, 3).unwrap();
        assert!(!info.is_counter_reached(&view, 0, 3).unwrap());
        view.mapping.write_u64(PARTITION_STRIDE, 3).unwrap();
        assert!(info.is_counter_reached(&view, 0, 3).unwrap());
    }

    #[test]
    fn test_reset_zeroes_state_and_memory() {
        let fixture = Fixture::single_tile();
        let info = info(&fixture, InOrderExecInfoDesc::new());
        info.add_counter_value(7);
        info.set_allocation_offset(8);
        info.add_regular_submission_counter(2);
        info.device_mapping().unwrap().write_u64(0, 7).unwrap();

        info.reset();
        assert_eq!(info.counter_value(), 0);
        assert_eq!(info.allocation_offset(), 0);
        assert_eq!(info.regular_submission_counter(), 0);
        assert_eq!(info.device_mapping().unwrap().read_u64(0).unwrap(), 0);
        assert_eq!(info.epoch(), 1);
    }

    #[test]
    fn test_restore_rewinds_counter_position() {
        let fixture = Fixture::single_tile();
        let info = info(
            &fixture,
            InOrderExecInfoDesc {
                wide_counter: false,
                regular: true,
                ..InOrderExecInfoDesc::new()
            },
        );
        info.add_counter_value(NARROW_COUNTER_LIMIT - 2);
        let (value, offset, epoch) = (info.counter_value(), info.allocation_offset(), info.epoch());

        info.add_counter_value(5);
        assert_eq!(info.allocation_offset(), 8);
        info.restore(value, offset, epoch);
        assert_eq!(info.counter_value(), NARROW_COUNTER_LIMIT - 2);
        assert_eq!(info.allocation_offset(), 0);
        assert_eq!(info.epoch(), 0);

        info.add_regular_submission_counter(2);
        info.sub_regular_submission_counter(1);
        assert_eq!(info.regular_submission_counter(), 1);
    }

    #[test]
    fn test_external_storage() {
        let mapping = CpuMapping::zeroed(ByteSize::from_bytes(64));
        let info = InOrderExecInfo::external(
            GpuAddr::new(0x5000),
            Some(mapping.clone()),
            10,
            InOrderExecInfoDesc::new(),
        )
        .unwrap();
        assert!(info.is_external());
        assert_eq!(info.counter_value(), 10);
        assert_eq!(info.base_device_address(), GpuAddr::new(0x5000));
        assert!(info.device_allocation().is_none());

        let view = info.counter_view().unwrap();
        mapping.write_u64(0, 10).unwrap();
        assert!(info.is_counter_reached(&view, 0, 10).unwrap());

        assert!(matches!(
            InOrderExecInfo::external(GpuAddr::null(), None, 1, InOrderExecInfoDesc::new()),
            Err(Error::InvalidArgument)
        ));
    }
}
