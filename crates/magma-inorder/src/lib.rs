//! # MAGMA In-Order Execution
//!
//! Counter-based in-order execution for GPU compute command lists.
//!
//! Every in-order list owns a monotonically increasing counter in device
//! memory. Each append writes the next counter value on completion, and any
//! later work (on the same list, another list or the host) waits for that
//! value instead of a per-operation fence.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        CommandList                              │
//! │   append ─► dependency ─► relaxed / sync_dispatch ─► payload    │
//! │                      │                                          │
//! │                      ▼                                          │
//! │   InOrderExecInfo (counter, slot offset, replay count)          │
//! │   PatchManager (sites rewritten on every replay)                │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │            Event              │          host_sync              │
//! │  regular │ counter-based      │  poll / user fence / task count │
//! ├───────────────────────────────┴─────────────────────────────────┤
//! │   Device: caps, config, counter storage, sync dispatch token    │
//! │           SubmissionLayer (driver supplied)                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let device = Device::new(caps, InOrderConfig::new(), pages, submission, clock)?;
//! let mut producer = CommandList::new(&device, CommandListDesc::immediate())?;
//! let mut consumer = CommandList::new(&device, CommandListDesc::immediate())?;
//!
//! producer.append_launch_kernel(&launch, Some(&event), &[])?;
//! consumer.append_launch_kernel(&launch, None, &[&event])?;
//! consumer.host_synchronize(INFINITE_TIMEOUT, None, true)?;
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod append;
pub mod cmdlist;
mod dependency;
pub mod device;
pub mod event;
pub mod exec_info;
pub mod host_sync;
pub mod patch;
mod relaxed;
pub mod sync_dispatch;

#[cfg(test)]
mod testing;

pub use append::{KernelLaunch, BUILTIN_COPY_KERNEL, BUILTIN_FILL_KERNEL};
pub use cmdlist::{
    CommandList, CommandListDesc, CommandQueue, ListKind, COMMAND_BUFFER_SIZE,
    MAX_COMMAND_BUFFER_SIZE,
};
pub use device::{Device, DeviceCaps, SubmissionLayer, SubmitFlags, MAX_PARTITIONS};
pub use event::{
    CounterBasedFlags, CounterBasedMode, Event, EventDesc, EventPool, EventPoolDesc,
    EventPoolFlags, InOrderBinding, SignalScope, EVENT_CLEARED, EVENT_SIGNALED,
};
pub use exec_info::{
    CounterUpdate, CounterView, InOrderExecInfo, InOrderExecInfoDesc, NARROW_COUNTER_LIMIT,
};
pub use host_sync::{user_fence_address, wait_for_counter, SyncStatus, INFINITE_TIMEOUT};
pub use patch::{PatchCommand, PatchKind, PatchManager};
pub use sync_dispatch::SYNC_TOKEN_OWNER_OFFSET;

pub use magma_core::{Error, GpuAddr, InOrderConfig, Result, SyncDispatchMode};
