//! # Dependency Emission
//!
//! Waits, counter signals and event completion writes of an append.
//!
//! ## Wait Forms
//!
//! ```text
//!   32-bit counter     SEMAPHORE_WAIT  slot >= value            (per partition)
//!
//!   64-bit counter     LRI  GPR0.lo = value.lo
//!                      LRI  GPR0.hi = value.hi
//!                      SEMAPHORE_WAIT  slot >= GPR0 (qword)     (per partition)
//!
//!   relaxed ordering   COND_BB  slot < value ─► scheduler (GPR0)
//! ```
//!
//! Atomic signalling leaves a single slot to wait on regardless of the
//! partition count.

use alloc::sync::Arc;
use alloc::vec::Vec;

use magma_cmd::register::{high_dword, CS_GPR_R0};
use magma_cmd::{
    AtomicOp, CompareOp, Flush, FlushFlags, LoadRegisterImm, SemaphoreWait, StoreDataImm,
};
use magma_core::{Error, GpuAddr, Result};
use magma_mem::{Allocation, PARTITION_STRIDE};

use crate::cmdlist::CommandList;
use crate::event::{CounterBasedFlags, Event, EVENT_SIGNALED};
use crate::exec_info::{CounterUpdate, InOrderExecInfo};
use crate::patch::PatchKind;

/// A dependency that needs an explicit wait
#[derive(Debug, Clone)]
pub(crate) enum WaitTarget {
    /// Counter slots reaching a value
    Counter {
        info: Arc<InOrderExecInfo>,
        offset: u32,
        value: u64,
        base_value: u64,
    },
    /// Completion field of a regular event
    Completion { addr: GpuAddr, allocation: Allocation },
}

impl CommandList {
    // =========================================================================
    // Validation and event modes
    // =========================================================================

    /// Reject event combinations before anything is recorded
    pub(crate) fn validate_events(&self, signal: Option<&Event>, waits: &[&Event]) -> Result<()> {
        if waits
            .iter()
            .any(|event| event.is_counter_based() && event.in_order_binding().is_none())
        {
            return Err(Error::InvalidArgument);
        }

        if let Some(event) = signal {
            if event.is_explicitly_counter_based() {
                let required = if self.desc.is_immediate() {
                    CounterBasedFlags::IMMEDIATE
                } else {
                    CounterBasedFlags::NON_IMMEDIATE
                };
                if !self.desc.in_order || !event.counter_based_flags().contains(required) {
                    return Err(Error::InvalidArgument);
                }
            }
        }
        Ok(())
    }

    /// Whether `event` signals through the counter, promoting or demoting it
    pub(crate) fn resolve_signal_event(&self, event: &Event) -> bool {
        if event.is_explicitly_counter_based() {
            return true;
        }
        let eligible = self.desc.is_immediate()
            && self.device.config().implicit_counter_based_events
            && !self.device.caps().requires_completion_flush(event.signal_scope());
        if eligible && event.try_promote() {
            true
        } else {
            event.demote();
            false
        }
    }

    // =========================================================================
    // Waits
    // =========================================================================

    /// Dependencies of `waits` left after eliding those already ordered by the list
    pub(crate) fn collect_waits(&self, waits: &[&Event]) -> Vec<WaitTarget> {
        let mut targets = Vec::with_capacity(waits.len());
        for event in waits {
            if !event.is_counter_based() {
                if let Some(completion) = event.completion() {
                    targets.push(WaitTarget::Completion {
                        addr: completion.addr,
                        allocation: completion.allocation.clone(),
                    });
                }
                continue;
            }

            let Some(binding) = event.in_order_binding() else {
                continue;
            };
            if let Some(own) = &self.info {
                if Arc::ptr_eq(own, &binding.info)
                    && (binding.epoch != own.epoch()
                        || binding.allocation_offset != own.allocation_offset()
                        || binding.signal_value <= own.counter_value())
                {
                    log::trace!("inorder: elided wait on own counter value {}", binding.signal_value);
                    continue;
                }
            }
            targets.push(WaitTarget::Counter {
                offset: binding.allocation_offset,
                value: binding.wait_value(),
                base_value: binding.signal_value,
                info: binding.info,
            });
        }
        targets
    }

    /// Emit every wait in `targets`
    pub(crate) fn emit_waits(&mut self, targets: &[WaitTarget], relaxed: bool) -> Result<()> {
        for target in targets {
            match target {
                WaitTarget::Counter {
                    info,
                    offset,
                    value,
                    base_value,
                } => self.emit_counter_wait(info, *offset, *value, *base_value, relaxed)?,
                WaitTarget::Completion { addr, allocation } => {
                    self.track(allocation);
                    if relaxed {
                        self.emit_relaxed_completion_wait(*addr)?;
                    } else {
                        self.stream
                            .emit(SemaphoreWait::new(*addr, EVENT_SIGNALED, CompareOp::Equal).qword())?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Wait until every slot of `info` at `offset` reaches `value`
    pub(crate) fn emit_counter_wait(
        &mut self,
        info: &Arc<InOrderExecInfo>,
        offset: u32,
        value: u64,
        base_value: u64,
        relaxed: bool,
    ) -> Result<()> {
        self.track_info(info);
        let patch = self.records_patches_for(info);

        for addr in info.partition_slots(offset) {
            if relaxed {
                self.emit_relaxed_counter_wait(addr, value, info.is_wide_counter())?;
            } else if info.is_wide_counter() {
                let lo_offset = self.stream.emit(LoadRegisterImm::new(CS_GPR_R0, value as u32))?;
                let hi_offset = self
                    .stream
                    .emit(LoadRegisterImm::new(high_dword(CS_GPR_R0), (value >> 32) as u32))?;
                self.stream.emit(
                    SemaphoreWait::new(addr, 0, CompareOp::GreaterOrEqual)
                        .qword()
                        .indirect(),
                )?;
                if patch {
                    self.patches.add(
                        PatchKind::RegisterLoadPair {
                            lo_offset,
                            hi_offset,
                        },
                        base_value,
                        info,
                    );
                }
            } else {
                let offset = self
                    .stream
                    .emit(SemaphoreWait::new(addr, value, CompareOp::GreaterOrEqual))?;
                if patch {
                    self.patches.add(PatchKind::Semaphore { offset }, base_value, info);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Dedicated write of `value` into the current counter slots
    pub(crate) fn emit_counter_signal(&mut self, info: &Arc<InOrderExecInfo>, value: u64) -> Result<()> {
        let addr = info.device_counter_address();
        let patch = self.records_patches_for(info);

        if info.is_atomic_device_signalling() {
            self.stream.emit(AtomicOp::increment(addr).qword())?;
        } else {
            for partition in 0..info.partition_count() {
                let offset = self.emit_store(
                    addr + partition as u64 * PARTITION_STRIDE,
                    value,
                    info.is_wide_counter(),
                )?;
                if patch {
                    self.patches.add(PatchKind::StoreWrite { offset }, value, info);
                }
            }
        }

        if let Some(host) = info.host_counter_address() {
            let offset = self.emit_store(host, value, info.is_wide_counter())?;
            if patch {
                self.patches.add(PatchKind::StoreWrite { offset }, value, info);
            }
        }
        Ok(())
    }

    /// Advance the counter after a signal, moving a wrapped 32-bit counter to its other slot
    pub(crate) fn advance_counter(&mut self, info: &Arc<InOrderExecInfo>) -> Result<()> {
        let CounterUpdate::Wrapped {
            saturated,
            restart,
            previous_offset,
            offset,
        } = info.add_counter_value(info.increment_value())
        else {
            return Ok(());
        };

        for addr in info.partition_slots(previous_offset) {
            self.stream
                .emit(SemaphoreWait::new(addr, saturated, CompareOp::GreaterOrEqual))?;
        }
        let base = info.base_device_address() + offset as u64;
        for partition in 0..info.partition_count() {
            self.emit_store(base + partition as u64 * PARTITION_STRIDE, restart, false)?;
        }
        if let Some(host) = info.base_host_address() {
            self.emit_store(host + offset as u64, restart, false)?;
        }
        Ok(())
    }

    /// Completion write of a regular event, preceded by `flush` when not empty
    pub(crate) fn emit_event_completion(&mut self, event: &Event, flush: FlushFlags) -> Result<()> {
        let Some(completion) = event.completion() else {
            return Ok(());
        };
        if !flush.is_empty() {
            self.stream.emit(Flush::new(flush))?;
        }
        self.track(&completion.allocation);
        self.stream
            .emit(StoreDataImm::new(completion.addr, EVENT_SIGNALED).qword())?;
        event.invalidate();
        Ok(())
    }

    fn emit_store(&mut self, addr: GpuAddr, value: u64, wide: bool) -> Result<usize> {
        let store = StoreDataImm::new(addr, value);
        self.stream.emit(if wide { store.qword() } else { store })
    }
}
