//! # Append Operations
//!
//! Every append funnels into one sequence. In-order lists run:
//!
//! ```text
//!   validate events
//!   resolve signal event (promote / demote)
//!   collect waits (elide own-counter dependencies)
//!   [relaxed prologue] [own-counter wait] dependency waits
//!   [sync dispatch acquire]
//!   payload ─┬─ dispatch post-sync writes the counter
//!            └─ [flush] counter store / atomic increment
//!   [counter wrap]
//!   [sync dispatch release]
//!   bind counter-based event | event completion write
//!   flush (immediate lists)
//! ```
//!
//! Lists without in-order execution skip the counter entirely and signal
//! events through their completion field.
//!
//! A recording that fails leaves no trace: the stream, patch sites and
//! counter position return to where the append started. When the buffer
//! ran out the list makes room and records again.

use alloc::sync::Arc;

use magma_cmd::{
    CompareOp, Dispatch, Flush, FlushFlags, MemCopy, MemFill, SemaphoreWait, StoreDataImm,
    StoreFlags, Timestamp,
};
use magma_core::{Error, GpuAddr, Result};

use crate::cmdlist::CommandList;
use crate::event::{Event, EventSnapshot, EVENT_CLEARED};
use crate::exec_info::InOrderExecInfo;
use crate::patch::PatchKind;

/// Kernel id of the builtin copy kernel
pub const BUILTIN_COPY_KERNEL: u32 = 0xFFFF_0000;

/// Kernel id of the builtin fill kernel
pub const BUILTIN_FILL_KERNEL: u32 = 0xFFFF_0001;

/// Bytes each work group of a builtin kernel handles
const BUILTIN_GROUP_BYTES: u64 = 256;

/// Kernel launch parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLaunch {
    /// Kernel id
    pub kernel_id: u32,
    /// Work group counts
    pub groups: [u32; 3],
}

impl KernelLaunch {
    /// Launch `kernel_id` over `groups`
    pub const fn new(kernel_id: u32, groups: [u32; 3]) -> Self {
        Self { kernel_id, groups }
    }

    fn builtin(kernel_id: u32, size: u64) -> Self {
        let groups = size.div_ceil(BUILTIN_GROUP_BYTES).clamp(1, u32::MAX as u64) as u32;
        Self::new(kernel_id, [groups, 1, 1])
    }
}

// =============================================================================
// PAYLOAD
// =============================================================================

/// Position of a list and its signal event before an append
struct RecordMark<'a> {
    dwords: usize,
    patches: usize,
    counter: Option<(u64, u32, u64)>,
    signal: Option<(&'a Event, EventSnapshot)>,
}

impl<'a> RecordMark<'a> {
    fn take(list: &CommandList, signal: Option<&'a Event>) -> Self {
        Self {
            dwords: list.stream.len(),
            patches: list.patches.len(),
            counter: list
                .info
                .as_ref()
                .map(|info| (info.counter_value(), info.allocation_offset(), info.epoch())),
            signal: signal.map(|event| (event, event.snapshot())),
        }
    }

    fn rewind(self, list: &mut CommandList) {
        list.stream.truncate(self.dwords);
        list.patches.truncate(self.patches);
        if let (Some(info), Some((value, offset, epoch))) = (&list.info, self.counter) {
            info.restore(value, offset, epoch);
        }
        if let Some((event, snapshot)) = self.signal {
            event.restore(snapshot);
        }
    }
}

/// Work recorded between the dependency waits and the signal
#[derive(Debug, Clone, Copy)]
pub(crate) enum Payload<'a> {
    Kernel(&'a KernelLaunch),
    MemCopy { dst: GpuAddr, src: GpuAddr, size: u64 },
    MemFill { dst: GpuAddr, size: u64, pattern: u32 },
    Timestamp(GpuAddr),
    MemoryWait { addr: GpuAddr, value: u64, compare: CompareOp },
    EventReset(&'a Event),
    RangesFlush,
    Barrier,
    Marker,
}

impl Payload<'_> {
    /// Whether the payload records a compute walker
    fn is_dispatch(&self, copy_only: bool) -> bool {
        match self {
            Self::Kernel(_) => true,
            Self::MemCopy { .. } | Self::MemFill { .. } => !copy_only,
            _ => false,
        }
    }

    /// Whether the engine orders the payload after earlier work of the list
    fn is_engine_ordered(&self) -> bool {
        matches!(self, Self::Kernel(_) | Self::MemCopy { .. } | Self::MemFill { .. })
    }

    /// Stall emitted by the payload itself
    fn stall(&self, in_order: bool) -> FlushFlags {
        match self {
            Self::RangesFlush => FlushFlags::DC_FLUSH | FlushFlags::CS_STALL,
            Self::Barrier if !in_order => FlushFlags::CS_STALL,
            _ => FlushFlags::empty(),
        }
    }
}

/// Flush needed before a store that follows `dispatch` work or must reach the host
fn completion_flush(dispatch: bool, host_flush: bool) -> FlushFlags {
    let mut flags = FlushFlags::empty();
    if dispatch {
        flags |= FlushFlags::CS_STALL;
    }
    if host_flush {
        flags |= FlushFlags::DC_FLUSH | FlushFlags::CS_STALL;
    }
    flags
}

impl CommandList {
    // =========================================================================
    // Public appends
    // =========================================================================

    /// Launch a kernel
    pub fn append_launch_kernel(
        &mut self,
        launch: &KernelLaunch,
        signal: Option<&Event>,
        waits: &[&Event],
    ) -> Result<()> {
        self.append(Payload::Kernel(launch), signal, waits, true)
    }

    /// Copy `size` bytes from `src` to `dst`
    pub fn append_memory_copy(
        &mut self,
        dst: GpuAddr,
        src: GpuAddr,
        size: u64,
        signal: Option<&Event>,
        waits: &[&Event],
    ) -> Result<()> {
        if dst.is_null() || src.is_null() {
            return Err(Error::InvalidArgument);
        }
        self.append(Payload::MemCopy { dst, src, size }, signal, waits, true)
    }

    /// Fill `size` bytes at `dst` with `pattern`
    pub fn append_memory_fill(
        &mut self,
        dst: GpuAddr,
        size: u64,
        pattern: u32,
        signal: Option<&Event>,
        waits: &[&Event],
    ) -> Result<()> {
        if dst.is_null() {
            return Err(Error::InvalidArgument);
        }
        self.append(Payload::MemFill { dst, size, pattern }, signal, waits, true)
    }

    /// Execution barrier
    ///
    /// In-order lists are already ordered: without waits the barrier records
    /// nothing and a counter-based signal event binds to the current counter.
    pub fn append_barrier(&mut self, signal: Option<&Event>, waits: &[&Event]) -> Result<()> {
        self.ensure_open()?;
        if let (Some(info), true) = (self.info.clone(), waits.is_empty()) {
            self.validate_events(signal, waits)?;
            let Some(event) = signal else {
                return Ok(());
            };
            if self.resolve_signal_event(event) {
                event.bind(&info, info.counter_value(), info.allocation_offset());
                return Ok(());
            }
            return self.append(Payload::Marker, signal, waits, true);
        }
        self.append(Payload::Barrier, signal, waits, true)
    }

    /// Barrier that also flushes caches for the given ranges
    pub fn append_memory_ranges_barrier(
        &mut self,
        ranges: &[(GpuAddr, u64)],
        signal: Option<&Event>,
        waits: &[&Event],
    ) -> Result<()> {
        if ranges.iter().any(|(addr, _)| addr.is_null()) {
            return Err(Error::InvalidArgument);
        }
        self.append(Payload::RangesFlush, signal, waits, true)
    }

    /// Reset an event on the device timeline
    pub fn append_event_reset(&mut self, event: &Event) -> Result<()> {
        if event.is_explicitly_counter_based() {
            return Err(Error::UnsupportedFeature);
        }
        self.ensure_open()?;
        event.demote();
        self.append(Payload::EventReset(event), None, &[], true)
    }

    /// Signal an event once earlier work of the list completed
    pub fn append_signal_event(&mut self, event: &Event) -> Result<()> {
        self.append(Payload::Marker, Some(event), &[], true)
    }

    /// Write the GPU timestamp to `dst`
    pub fn append_write_global_timestamp(
        &mut self,
        dst: GpuAddr,
        signal: Option<&Event>,
        waits: &[&Event],
    ) -> Result<()> {
        if dst.is_null() || !dst.is_aligned(8) {
            return Err(Error::InvalidArgument);
        }
        self.append(Payload::Timestamp(dst), signal, waits, true)
    }

    /// Wait for events without recording work
    pub fn append_wait_on_events(&mut self, waits: &[&Event]) -> Result<()> {
        if waits.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let signal_counter = self.desc.is_immediate();
        self.append(Payload::Marker, None, waits, signal_counter)
    }

    /// Wait until the qword at `addr` satisfies `compare` against `value`
    pub fn append_wait_on_memory(
        &mut self,
        addr: GpuAddr,
        value: u64,
        compare: CompareOp,
        signal: Option<&Event>,
    ) -> Result<()> {
        if addr.is_null() {
            return Err(Error::InvalidArgument);
        }
        self.append(Payload::MemoryWait { addr, value, compare }, signal, &[], true)
    }

    // =========================================================================
    // Append sequence
    // =========================================================================

    pub(crate) fn append(
        &mut self,
        payload: Payload<'_>,
        signal: Option<&Event>,
        waits: &[&Event],
        signal_counter: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        if matches!(payload, Payload::Kernel(_)) && self.desc.copy_only {
            return Err(Error::InvalidArgument);
        }
        self.validate_events(signal, waits)?;
        self.recycle_stream();

        let relaxed = loop {
            match self.record(payload, signal, waits, signal_counter) {
                Err(Error::CommandBufferFull) => self.make_room()?,
                other => break other?,
            }
        };

        if self.desc.is_immediate() {
            self.flush_immediate(relaxed)?;
        }
        Ok(())
    }

    /// Record one append, rewinding the list if any emission fails
    fn record(
        &mut self,
        payload: Payload<'_>,
        signal: Option<&Event>,
        waits: &[&Event],
        signal_counter: bool,
    ) -> Result<bool> {
        let mark = RecordMark::take(self, signal);
        let result = match self.info.clone() {
            Some(info) => self.append_in_order(&info, payload, signal, waits, signal_counter),
            None => self
                .append_out_of_order(payload, signal, waits)
                .map(|()| false),
        };
        if let Err(err) = &result {
            log::debug!(
                "inorder: append failed ({}), rewinding {} dword(s)",
                err,
                self.stream.len() - mark.dwords
            );
            mark.rewind(self);
        }
        result
    }

    fn append_in_order(
        &mut self,
        info: &Arc<InOrderExecInfo>,
        payload: Payload<'_>,
        signal: Option<&Event>,
        waits: &[&Event],
        signal_counter: bool,
    ) -> Result<bool> {
        let copy_only = self.desc.copy_only;
        let counter_signal_event = signal.is_some_and(|event| self.resolve_signal_event(event));
        let targets = self.collect_waits(waits);

        let relaxed = self.use_relaxed_ordering(!targets.is_empty());
        if relaxed {
            self.emit_relaxed_prologue()?;
        }
        let own_wait = signal_counter
            && (!payload.is_engine_ordered() || relaxed)
            && (info.counter_value() > 0 || info.is_regular());
        if own_wait {
            let value = info.counter_value();
            self.emit_counter_wait(info, info.allocation_offset(), value, value, relaxed)?;
        }
        self.emit_waits(&targets, relaxed)?;

        let dispatch = payload.is_dispatch(copy_only);
        if dispatch {
            self.emit_sync_dispatch_prologue()?;
        }

        let host_flush = signal
            .is_some_and(|event| self.device.caps().requires_completion_flush(event.signal_scope()));
        let mut stall = payload.stall(true);

        if signal_counter {
            let value = info.next_signal_value();
            let inline = dispatch
                && !host_flush
                && !info.is_atomic_device_signalling()
                && !info.is_host_storage_duplicated();
            if inline {
                let mut flags = StoreFlags::empty();
                if info.is_wide_counter() {
                    flags |= StoreFlags::QWORD;
                }
                if info.partition_count() > 1 {
                    flags |= StoreFlags::PARTITION_OFFSET;
                }
                let post_sync = (info.device_counter_address(), value, flags);
                if let Some(offset) = self.emit_payload(payload, Some(post_sync))? {
                    if self.records_patches_for(info) {
                        self.patches
                            .add(PatchKind::WalkerPostSync { offset }, value, info);
                    }
                }
            } else {
                self.emit_payload(payload, None)?;
                let flush = completion_flush(dispatch, host_flush).difference(stall);
                if !flush.is_empty() {
                    self.stream.emit(Flush::new(flush))?;
                    stall |= flush;
                }
                self.emit_counter_signal(info, value)?;
            }
            self.advance_counter(info)?;
        } else {
            self.emit_payload(payload, None)?;
        }

        if dispatch {
            self.emit_sync_dispatch_epilogue()?;
        }

        if let Some(event) = signal {
            if counter_signal_event {
                event.bind(info, info.counter_value(), info.allocation_offset());
            } else {
                let flush = completion_flush(dispatch, host_flush).difference(stall);
                self.emit_event_completion(event, flush)?;
            }
        }
        Ok(relaxed)
    }

    fn append_out_of_order(
        &mut self,
        payload: Payload<'_>,
        signal: Option<&Event>,
        waits: &[&Event],
    ) -> Result<()> {
        if let Some(event) = signal {
            event.mark_used_on_non_in_order();
        }
        let targets = self.collect_waits(waits);
        self.emit_waits(&targets, false)?;
        self.emit_payload(payload, None)?;

        if let Some(event) = signal {
            let host_flush = self
                .device
                .caps()
                .requires_completion_flush(event.signal_scope());
            let flush = completion_flush(payload.is_dispatch(self.desc.copy_only), host_flush)
                .difference(payload.stall(false));
            self.emit_event_completion(event, flush)?;
        }
        Ok(())
    }

    /// Record the payload, returning the offset of its walker
    fn emit_payload(
        &mut self,
        payload: Payload<'_>,
        post_sync: Option<(GpuAddr, u64, StoreFlags)>,
    ) -> Result<Option<usize>> {
        let launch = match payload {
            Payload::Kernel(launch) => *launch,
            Payload::MemCopy { dst, src, size } => {
                if self.desc.copy_only {
                    self.stream.emit(MemCopy::new(src, dst, size))?;
                    return Ok(None);
                }
                KernelLaunch::builtin(BUILTIN_COPY_KERNEL, size)
            }
            Payload::MemFill { dst, size, pattern } => {
                if self.desc.copy_only {
                    self.stream.emit(MemFill::new(dst, size, pattern))?;
                    return Ok(None);
                }
                KernelLaunch::builtin(BUILTIN_FILL_KERNEL, size)
            }
            Payload::Timestamp(dst) => {
                self.stream.emit(Timestamp::new(dst))?;
                return Ok(None);
            }
            Payload::MemoryWait {
                addr,
                value,
                compare,
            } => {
                self.stream
                    .emit(SemaphoreWait::new(addr, value, compare).qword())?;
                return Ok(None);
            }
            Payload::EventReset(event) => {
                if let Some(completion) = event.completion() {
                    let allocation = completion.allocation.clone();
                    let addr = completion.addr;
                    self.track(&allocation);
                    self.stream
                        .emit(StoreDataImm::new(addr, EVENT_CLEARED).qword())?;
                }
                event.invalidate();
                return Ok(None);
            }
            Payload::RangesFlush | Payload::Barrier => {
                let flush = payload.stall(self.desc.in_order);
                if !flush.is_empty() {
                    self.stream.emit(Flush::new(flush))?;
                }
                return Ok(None);
            }
            Payload::Marker => return Ok(None),
        };

        let mut walker = Dispatch::new(launch.kernel_id, launch.groups);
        if let Some((addr, value, flags)) = post_sync {
            walker = walker.with_post_sync(addr, value, flags);
        }
        self.stream.emit(walker).map(Some)
    }
}
