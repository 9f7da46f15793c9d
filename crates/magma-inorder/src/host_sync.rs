//! # Host Synchronization
//!
//! Cooperative polling of counters and completion fields from the host.
//!
//! ```text
//!            ┌────────────────────────────────┐
//!            ▼                                │
//!   download (non-coherent) ─► hang? ──yes──► DeviceLost
//!            │                  │no
//!            │                  ▼
//!            │            reached? ──yes──► Ready
//!            │                  │no
//!            │                  ▼
//!            │            timed out? ──yes──► NotReady
//!            │                  │no
//!            └──── backoff ◄────┘
//! ```
//!
//! A timeout of zero performs exactly one check. [`INFINITE_TIMEOUT`] never
//! expires.

use magma_core::{Error, GpuAddr, Result};
use magma_mem::{Allocation, CpuMapping};

use crate::device::Device;
use crate::exec_info::InOrderExecInfo;

/// Timeout that never expires
pub const INFINITE_TIMEOUT: u64 = u64::MAX;

/// Non-fatal outcome of a host wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Target reached
    Ready,
    /// Timeout elapsed before the target was reached
    NotReady,
}

impl SyncStatus {
    /// Whether the wait completed
    #[inline]
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

/// Poll `check` until it reports completion, the device hangs or the timeout expires
pub(crate) fn poll_until<F>(device: &Device, timeout_ns: u64, mut check: F) -> Result<SyncStatus>
where
    F: FnMut() -> Result<bool>,
{
    let clock = device.clock();
    let start = clock.monotonic_ns();
    let max_spins = device.config().host_sync_max_backoff_spins.max(1);
    let mut spins = 1u32;
    let mut polls = 0u64;

    loop {
        polls += 1;
        if device.submission().is_gpu_hang_detected() {
            log::warn!("inorder: gpu hang detected after {} poll(s)", polls);
            return Err(Error::DeviceLost);
        }
        if check()? {
            log::trace!("inorder: host wait ready after {} poll(s)", polls);
            return Ok(SyncStatus::Ready);
        }
        if timeout_ns == 0 {
            return Ok(SyncStatus::NotReady);
        }
        if timeout_ns != INFINITE_TIMEOUT {
            let elapsed = clock.monotonic_ns().saturating_sub(start);
            if elapsed >= timeout_ns {
                log::trace!("inorder: host wait timed out after {} ns", elapsed);
                return Ok(SyncStatus::NotReady);
            }
        }

        for _ in 0..spins {
            core::hint::spin_loop();
        }
        spins = spins.saturating_mul(2).min(max_spins);
    }
}

/// Wait until the counter slots of `info` at `offset` reach `value`
///
/// Returns [`Error::NotMapped`] when the counter has no host view; callers
/// fall back to the kernel-mode fence.
pub fn wait_for_counter(
    device: &Device,
    info: &InOrderExecInfo,
    offset: u32,
    value: u64,
    timeout_ns: u64,
) -> Result<SyncStatus> {
    let view = info.counter_view().ok_or(Error::NotMapped)?;
    let check = || {
        refresh(device, view.allocation.as_ref())?;
        info.is_counter_reached(&view, offset, value)
    };

    if device.config().wait_on_user_fence {
        if check()? {
            return Ok(SyncStatus::Ready);
        }
        let addr = user_fence_address(info, offset);
        log::trace!("inorder: user fence wait on {} >= {}", addr, value);
        if device.submission().wait_user_fence(addr, value, timeout_ns)? {
            return Ok(SyncStatus::Ready);
        }
        // Budget spent, check once more for a hang or a late write
        return poll_until(device, 0, check);
    }

    poll_until(device, timeout_ns, check)
}

/// Wait until the dword at `mapping[offset]` equals `value`
pub(crate) fn wait_for_value(
    device: &Device,
    allocation: Option<&Allocation>,
    mapping: &CpuMapping,
    offset: u64,
    value: u64,
    timeout_ns: u64,
) -> Result<SyncStatus> {
    poll_until(device, timeout_ns, || {
        refresh(device, allocation)?;
        Ok(mapping.read_u64(offset)? == value)
    })
}

/// Download a non-coherent allocation before reading it
fn refresh(device: &Device, allocation: Option<&Allocation>) -> Result<()> {
    match allocation {
        Some(allocation) if !allocation.is_host_coherent() => {
            device.submission().download_allocation(allocation)
        }
        _ => Ok(()),
    }
}

/// Address a user-fence wait targets for a counter
pub fn user_fence_address(info: &InOrderExecInfo, offset: u32) -> GpuAddr {
    info.base_host_address()
        .unwrap_or_else(|| info.base_device_address())
        + offset as u64
}
