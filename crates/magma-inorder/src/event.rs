//! # Events
//!
//! Completion objects and their binding to in-order counters.
//!
//! ## Counter-Based Modes
//!
//! ```text
//!                    promote (immediate in-order list)
//!  InitiallyDisabled ───────────────────────────────► ImplicitlyEnabled
//!         │                                                │
//!         │ demote                                 demote  │
//!         ▼                                                ▼
//!  ImplicitlyDisabled ◄────────────────────────────────────┘
//!
//!  ExplicitlyEnabled   (counter-based pool, never changes)
//! ```
//!
//! A counter-based event completes when the counter it is bound to reaches
//! the bound value. Other events own a qword completion field written with
//! [`EVENT_SIGNALED`].

use alloc::sync::Arc;
use core::fmt;

use bitflags::bitflags;
use spin::Mutex;

use magma_core::{ByteSize, Error, GpuAddr, Result};
use magma_mem::{AllocDesc, AllocFlags, Allocation, CpuMapping};

use crate::device::Device;
use crate::exec_info::{InOrderExecInfo, InOrderExecInfoDesc};
use crate::host_sync::{self, SyncStatus};

/// Completion field value of a signalled event
pub const EVENT_SIGNALED: u64 = 1;

/// Completion field value of a cleared event
pub const EVENT_CLEARED: u64 = 0;

/// Bytes reserved per event in a pool
const EVENT_SLOT_SIZE: u64 = 64;

// =============================================================================
// FLAGS
// =============================================================================

bitflags! {
    /// List kinds a counter-based event may be signalled from
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CounterBasedFlags: u32 {
        /// Immediate lists
        const IMMEDIATE     = 1 << 0;
        /// Replayable lists
        const NON_IMMEDIATE = 1 << 1;
    }
}

bitflags! {
    /// Visibility scope of an event signal
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SignalScope: u32 {
        /// Observed by the host
        const HOST   = 1 << 0;
        /// Observed by the device
        const DEVICE = 1 << 1;
    }
}

bitflags! {
    /// Event pool properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventPoolFlags: u32 {
        /// Shareable with other processes
        const IPC          = 1 << 0;
        /// Events record timestamps
        const TIMESTAMP    = 1 << 1;
        /// Completion fields are host visible
        const HOST_VISIBLE = 1 << 2;
    }
}

/// Counter-based completion state of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterBasedMode {
    /// Regular event that may still be promoted
    InitiallyDisabled,
    /// Created counter-based
    ExplicitlyEnabled,
    /// Promoted by an in-order append
    ImplicitlyEnabled,
    /// Demoted, never promoted again
    ImplicitlyDisabled,
}

impl CounterBasedMode {
    /// Whether completion is judged by a counter
    #[inline]
    pub fn is_counter_based(self) -> bool {
        matches!(self, Self::ExplicitlyEnabled | Self::ImplicitlyEnabled)
    }
}

// =============================================================================
// BINDING
// =============================================================================

/// Counter an event is bound to
#[derive(Debug, Clone)]
pub struct InOrderBinding {
    /// Owning counter
    pub info: Arc<InOrderExecInfo>,
    /// Counter value the signal wrote when recorded
    pub signal_value: u64,
    /// Slot offset when recorded
    pub allocation_offset: u32,
    /// Counter epoch when recorded
    pub epoch: u64,
}

impl InOrderBinding {
    /// Value a waiter compares against
    #[inline]
    pub fn wait_value(&self) -> u64 {
        self.info.effective_wait_value(self.signal_value)
    }

    /// Address a waiter compares
    #[inline]
    pub fn wait_addr(&self) -> GpuAddr {
        self.info.base_device_address() + self.allocation_offset as u64
    }
}

// =============================================================================
// EVENT POOL
// =============================================================================

/// Event pool creation parameters
#[derive(Debug, Clone)]
pub struct EventPoolDesc {
    /// Number of events
    pub count: u32,
    /// Pool properties
    pub flags: EventPoolFlags,
    /// Raw `CounterBasedFlags` bits for counter-based pools
    pub counter_based: Option<u32>,
}

impl EventPoolDesc {
    /// Regular pool of `count` host-visible events
    pub const fn new(count: u32) -> Self {
        Self {
            count,
            flags: EventPoolFlags::HOST_VISIBLE,
            counter_based: None,
        }
    }

    /// Counter-based pool with raw flag bits
    pub const fn counter_based(count: u32, bits: u32) -> Self {
        Self {
            count,
            flags: EventPoolFlags::HOST_VISIBLE,
            counter_based: Some(bits),
        }
    }
}

/// Pool of events sharing one completion allocation
pub struct EventPool {
    device: Arc<Device>,
    storage: Allocation,
    count: u32,
    flags: EventPoolFlags,
    counter_based: Option<CounterBasedFlags>,
}

impl EventPool {
    /// Create a pool
    pub fn new(device: &Arc<Device>, desc: &EventPoolDesc) -> Result<Arc<Self>> {
        if desc.count == 0 {
            return Err(Error::InvalidArgument);
        }
        let counter_based = match desc.counter_based {
            Some(_) if desc.flags.contains(EventPoolFlags::IPC) => {
                log::warn!("inorder: ipc counter-based event pools are not supported");
                return Err(Error::UnsupportedFeature);
            }
            Some(0) => Some(CounterBasedFlags::IMMEDIATE),
            Some(bits) => Some(CounterBasedFlags::from_bits(bits).ok_or(Error::InvalidArgument)?),
            None => None,
        };

        let storage = device.page_allocator().allocate(&AllocDesc {
            size: ByteSize::from_bytes(desc.count as u64 * EVENT_SLOT_SIZE),
            alignment: EVENT_SLOT_SIZE,
            flags: AllocFlags::HOST_COUNTER,
            name: "event_pool",
        })?;

        Ok(Arc::new(Self {
            device: Arc::clone(device),
            storage,
            count: desc.count,
            flags: desc.flags,
            counter_based,
        }))
    }

    /// Number of events
    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Pool properties
    #[inline]
    pub fn flags(&self) -> EventPoolFlags {
        self.flags
    }

    /// Counter-based flags of a counter-based pool
    #[inline]
    pub fn counter_based_flags(&self) -> Option<CounterBasedFlags> {
        self.counter_based
    }

    /// Create the event at `index`
    pub fn create_event(self: &Arc<Self>, index: u32, desc: EventDesc) -> Result<Arc<Event>> {
        if index >= self.count {
            return Err(Error::InvalidArgument);
        }
        let offset = index as u64 * EVENT_SLOT_SIZE;
        let mapping = self
            .storage
            .mapping()
            .map(|mapping| mapping.subview(offset, EVENT_SLOT_SIZE))
            .transpose()?;
        if let Some(mapping) = &mapping {
            mapping.write_u64(0, EVENT_CLEARED)?;
        }

        let mode = if self.counter_based.is_some() {
            CounterBasedMode::ExplicitlyEnabled
        } else {
            CounterBasedMode::InitiallyDisabled
        };
        Ok(Arc::new(Event {
            device: Arc::clone(&self.device),
            _pool: Some(Arc::clone(self)),
            completion: Some(Completion {
                allocation: self.storage.clone(),
                addr: self.storage.gpu_addr() + offset,
                mapping,
            }),
            scope: desc.signal_scope,
            counter_based_flags: self.counter_based.unwrap_or(CounterBasedFlags::empty()),
            ipc: self.flags.contains(EventPoolFlags::IPC),
            state: Mutex::new(EventState::new(mode)),
        }))
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        if let Err(err) = self.device.page_allocator().free(&self.storage) {
            log::warn!("inorder: failed to release event pool storage: {}", err);
        }
    }
}

impl fmt::Debug for EventPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPool")
            .field("count", &self.count)
            .field("flags", &self.flags)
            .field("counter_based", &self.counter_based)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// EVENT
// =============================================================================

/// Event creation parameters
#[derive(Debug, Clone, Copy)]
pub struct EventDesc {
    /// Visibility scope of the signal
    pub signal_scope: SignalScope,
}

impl Default for EventDesc {
    fn default() -> Self {
        Self {
            signal_scope: SignalScope::DEVICE,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Completion {
    pub(crate) allocation: Allocation,
    pub(crate) addr: GpuAddr,
    pub(crate) mapping: Option<CpuMapping>,
}

#[derive(Debug, Clone)]
struct EventState {
    mode: CounterBasedMode,
    binding: Option<InOrderBinding>,
    used_on_non_in_order: bool,
    completed: bool,
}

impl EventState {
    const fn new(mode: CounterBasedMode) -> Self {
        Self {
            mode,
            binding: None,
            used_on_non_in_order: false,
            completed: false,
        }
    }

    fn demote(&mut self) {
        if self.mode != CounterBasedMode::ExplicitlyEnabled {
            self.mode = CounterBasedMode::ImplicitlyDisabled;
            self.binding = None;
        }
    }
}

/// Saved counter-based state of an event
#[derive(Debug, Clone)]
pub(crate) struct EventSnapshot(EventState);

/// Completion object signalled by appends and waited on by appends or the host
pub struct Event {
    device: Arc<Device>,
    _pool: Option<Arc<EventPool>>,
    completion: Option<Completion>,
    scope: SignalScope,
    counter_based_flags: CounterBasedFlags,
    ipc: bool,
    state: Mutex<EventState>,
}

impl Event {
    /// Create a counter-based event over caller-provided counter memory
    ///
    /// The event completes once the qword at `device_addr` reaches `value`.
    pub fn create_counter_based(
        device: &Arc<Device>,
        device_addr: GpuAddr,
        host: Option<CpuMapping>,
        value: u64,
        flags: CounterBasedFlags,
    ) -> Result<Arc<Self>> {
        let info = InOrderExecInfo::external(
            device_addr,
            host,
            value,
            InOrderExecInfoDesc {
                wide_counter: device.use_wide_counter(),
                ..InOrderExecInfoDesc::new()
            },
        )?;
        let mut state = EventState::new(CounterBasedMode::ExplicitlyEnabled);
        state.binding = Some(InOrderBinding {
            epoch: info.epoch(),
            info,
            signal_value: value,
            allocation_offset: 0,
        });
        Ok(Arc::new(Self {
            device: Arc::clone(device),
            _pool: None,
            completion: None,
            scope: SignalScope::HOST | SignalScope::DEVICE,
            counter_based_flags: if flags.is_empty() {
                CounterBasedFlags::IMMEDIATE
            } else {
                flags
            },
            ipc: false,
            state: Mutex::new(state),
        }))
    }

    /// Current counter-based mode
    pub fn counter_based_mode(&self) -> CounterBasedMode {
        self.state.lock().mode
    }

    /// Whether completion is judged by a counter
    pub fn is_counter_based(&self) -> bool {
        self.counter_based_mode().is_counter_based()
    }

    /// Whether the event came from a counter-based pool
    pub fn is_explicitly_counter_based(&self) -> bool {
        self.counter_based_mode() == CounterBasedMode::ExplicitlyEnabled
    }

    /// Counter-based flags
    #[inline]
    pub fn counter_based_flags(&self) -> CounterBasedFlags {
        self.counter_based_flags
    }

    /// Visibility scope of the signal
    #[inline]
    pub fn signal_scope(&self) -> SignalScope {
        self.scope
    }

    /// Whether the event is shareable with other processes
    #[inline]
    pub fn is_ipc(&self) -> bool {
        self.ipc
    }

    /// Counter binding, if any
    pub fn in_order_binding(&self) -> Option<InOrderBinding> {
        self.state.lock().binding.clone()
    }

    /// Device address and value a waiter compares against
    pub fn counter_based_address_and_value(&self) -> Result<(GpuAddr, u64)> {
        let state = self.state.lock();
        if !state.mode.is_counter_based() {
            return Err(Error::InvalidArgument);
        }
        let binding = state.binding.as_ref().ok_or(Error::InvalidArgument)?;
        Ok((binding.wait_addr(), binding.wait_value()))
    }

    /// Address of the completion field
    pub fn completion_addr(&self) -> Option<GpuAddr> {
        self.completion.as_ref().map(|completion| completion.addr)
    }

    pub(crate) fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    // =========================================================================
    // Mode transitions
    // =========================================================================

    /// Promote to implicit counter-based mode if still eligible
    pub(crate) fn try_promote(&self) -> bool {
        let mut state = self.state.lock();
        match state.mode {
            CounterBasedMode::ExplicitlyEnabled | CounterBasedMode::ImplicitlyEnabled => true,
            CounterBasedMode::InitiallyDisabled if !state.used_on_non_in_order && !self.ipc => {
                state.mode = CounterBasedMode::ImplicitlyEnabled;
                log::debug!("inorder: event promoted to counter-based");
                true
            }
            _ => false,
        }
    }

    /// Leave counter-based mode for good (explicit events are unaffected)
    pub(crate) fn demote(&self) {
        let mut state = self.state.lock();
        if state.mode == CounterBasedMode::ImplicitlyEnabled {
            log::debug!("inorder: event demoted from counter-based");
        }
        state.demote();
    }

    /// Record use on a list without in-order execution
    pub(crate) fn mark_used_on_non_in_order(&self) {
        let mut state = self.state.lock();
        state.used_on_non_in_order = true;
        state.demote();
    }

    /// Bind to a counter value
    pub(crate) fn bind(&self, info: &Arc<InOrderExecInfo>, signal_value: u64, allocation_offset: u32) {
        let mut state = self.state.lock();
        state.binding = Some(InOrderBinding {
            info: Arc::clone(info),
            signal_value,
            allocation_offset,
            epoch: info.epoch(),
        });
        state.completed = false;
    }

    /// Forget the cached completion
    pub(crate) fn invalidate(&self) {
        self.state.lock().completed = false;
    }

    /// Save the counter-based state
    pub(crate) fn snapshot(&self) -> EventSnapshot {
        EventSnapshot(self.state.lock().clone())
    }

    /// Put back a state saved with `snapshot`
    pub(crate) fn restore(&self, snapshot: EventSnapshot) {
        *self.state.lock() = snapshot.0;
    }

    // =========================================================================
    // Host operations
    // =========================================================================

    /// Signal from the host
    pub fn host_signal(&self) -> Result<()> {
        self.leave_counter_mode()?;
        self.write_completion(EVENT_SIGNALED)?;
        self.state.lock().completed = true;
        Ok(())
    }

    /// Reset from the host
    pub fn host_reset(&self) -> Result<()> {
        self.leave_counter_mode()?;
        self.write_completion(EVENT_CLEARED)?;
        self.state.lock().completed = false;
        Ok(())
    }

    fn leave_counter_mode(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.mode == CounterBasedMode::ExplicitlyEnabled {
            return Err(Error::UnsupportedFeature);
        }
        state.demote();
        Ok(())
    }

    fn write_completion(&self, value: u64) -> Result<()> {
        let mapping = self
            .completion
            .as_ref()
            .and_then(|completion| completion.mapping.as_ref())
            .ok_or(Error::NotMapped)?;
        mapping.write_u64(0, value)
    }

    /// Non-blocking completion check
    pub fn query_status(&self) -> Result<SyncStatus> {
        self.host_synchronize(0)
    }

    /// Wait for completion from the host
    pub fn host_synchronize(&self, timeout_ns: u64) -> Result<SyncStatus> {
        let (mode, binding, completed) = {
            let state = self.state.lock();
            (state.mode, state.binding.clone(), state.completed)
        };
        if completed {
            return Ok(SyncStatus::Ready);
        }

        let status = if mode.is_counter_based() {
            let Some(binding) = binding else {
                return Ok(SyncStatus::NotReady);
            };
            host_sync::wait_for_counter(
                &self.device,
                &binding.info,
                binding.allocation_offset,
                binding.wait_value(),
                timeout_ns,
            )?
        } else {
            let completion = self.completion.as_ref().ok_or(Error::NotMapped)?;
            let mapping = completion.mapping.as_ref().ok_or(Error::NotMapped)?;
            host_sync::wait_for_value(
                &self.device,
                Some(&completion.allocation),
                mapping,
                0,
                EVENT_SIGNALED,
                timeout_ns,
            )?
        };

        if status.is_ready() {
            self.state.lock().completed = true;
        }
        Ok(status)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("scope", &self.scope)
            .field("counter_based_flags", &self.counter_based_flags)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
