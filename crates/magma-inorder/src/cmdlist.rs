//! # Command Lists
//!
//! One command-list type parameterised by a capability set.
//!
//! ```text
//!   Immediate ── append ─► record ─► flush ─► SubmissionLayer
//!
//!   Regular   ── append ─► record ── close ─► CommandQueue::execute
//!                                              │ bump submissions
//!                                              │ patch sites
//!                                              └► SubmissionLayer
//! ```
//!
//! Immediate lists record into a fixed buffer and restart at its base once
//! everything was submitted. Regular lists move to a buffer twice the size
//! when a recording no longer fits.
//!
//! Append operations live in `append`; dependency, relaxed ordering and
//! synchronized dispatch emission live in their own modules.

use alloc::sync::Arc;
use core::fmt;

use hashbrown::HashMap;

use magma_cmd::CommandStream;
use magma_core::{
    BufferHandle, ByteSize, CommandListHandle, Error, Result, SyncDispatchMode,
};
use magma_mem::{AllocDesc, AllocFlags, Allocation};

use crate::device::{Device, SubmitFlags};
use crate::exec_info::{InOrderExecInfo, InOrderExecInfoDesc};
use crate::host_sync::{self, SyncStatus};
use crate::patch::PatchManager;

/// Size of the backing command buffer of every list
pub const COMMAND_BUFFER_SIZE: ByteSize = ByteSize::KIB_64;

/// Largest command buffer a regular list grows to
pub const MAX_COMMAND_BUFFER_SIZE: ByteSize = ByteSize::from_kib(16 * 1024);

// =============================================================================
// DESCRIPTOR
// =============================================================================

/// Submission model of a list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// Every append is submitted right away
    Immediate,
    /// Recorded once, closed, enqueued any number of times
    Regular,
}

/// Capability set of a command list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandListDesc {
    /// Submission model
    pub kind: ListKind,
    /// In-order execution with a counter
    pub in_order: bool,
    /// Copy engine list
    pub copy_only: bool,
    /// Partitions the list spans
    pub partition_count: u32,
    /// Synchronized dispatch mode
    pub sync_dispatch: SyncDispatchMode,
}

impl CommandListDesc {
    /// In-order immediate compute list on one partition
    pub const fn immediate() -> Self {
        Self {
            kind: ListKind::Immediate,
            in_order: true,
            copy_only: false,
            partition_count: 1,
            sync_dispatch: SyncDispatchMode::Disabled,
        }
    }

    /// In-order replayable compute list on one partition
    pub const fn regular() -> Self {
        Self {
            kind: ListKind::Regular,
            ..Self::immediate()
        }
    }

    /// Set in-order execution
    pub const fn with_in_order(mut self, in_order: bool) -> Self {
        self.in_order = in_order;
        self
    }

    /// Make the list a copy engine list
    pub const fn with_copy_only(mut self, copy_only: bool) -> Self {
        self.copy_only = copy_only;
        self
    }

    /// Span `partition_count` partitions
    pub const fn with_partitions(mut self, partition_count: u32) -> Self {
        self.partition_count = partition_count;
        self
    }

    /// Set the synchronized dispatch mode
    pub const fn with_sync_dispatch(mut self, mode: SyncDispatchMode) -> Self {
        self.sync_dispatch = mode;
        self
    }

    /// Whether every append is submitted right away
    #[inline]
    pub const fn is_immediate(&self) -> bool {
        matches!(self.kind, ListKind::Immediate)
    }
}

impl Default for CommandListDesc {
    fn default() -> Self {
        Self::immediate()
    }
}

// =============================================================================
// COMMAND LIST
// =============================================================================

/// Command list
pub struct CommandList {
    pub(crate) handle: CommandListHandle,
    pub(crate) device: Arc<Device>,
    pub(crate) desc: CommandListDesc,
    pub(crate) buffer: Allocation,
    pub(crate) stream: CommandStream,
    pub(crate) info: Option<Arc<InOrderExecInfo>>,
    pub(crate) patches: PatchManager,
    pub(crate) residency: HashMap<BufferHandle, Allocation>,
    pub(crate) sync_queue_id: Option<u32>,
    pub(crate) closed: bool,
    pub(crate) flushed_dwords: usize,
    pub(crate) latest_task_count: Option<u64>,
}

impl CommandList {
    /// Create a list
    pub fn new(device: &Arc<Device>, desc: CommandListDesc) -> Result<Self> {
        if desc.partition_count == 0 || desc.partition_count > device.caps().partition_count {
            return Err(Error::InvalidArgument);
        }

        let buffer = Self::allocate_buffer(device, COMMAND_BUFFER_SIZE)?;
        let stream = CommandStream::with_limit(buffer.gpu_addr(), Self::capacity_of(&buffer));

        let info = if desc.in_order {
            Some(InOrderExecInfo::new(
                device.counter_allocator(),
                Self::exec_info_desc(device, &desc),
            )?)
        } else {
            None
        };

        let sync_queue_id = match desc.sync_dispatch {
            SyncDispatchMode::Full if desc.partition_count > 1 => {
                let id = device.assign_sync_dispatch_queue_id() + 1;
                log::debug!("inorder: sync dispatch queue id {}", id);
                Some(id)
            }
            _ => None,
        };

        let mut list = Self {
            handle: device.next_list_handle(),
            device: Arc::clone(device),
            desc,
            buffer,
            stream,
            info,
            patches: PatchManager::new(),
            residency: HashMap::new(),
            sync_queue_id,
            closed: false,
            flushed_dwords: 0,
            latest_task_count: None,
        };
        let buffer = list.buffer.clone();
        list.track(&buffer);
        list.track_counter();
        Ok(list)
    }

    fn allocate_buffer(device: &Device, size: ByteSize) -> Result<Allocation> {
        device.page_allocator().allocate(&AllocDesc {
            size,
            alignment: 4096,
            flags: AllocFlags::DEVICE_LOCAL | AllocFlags::HOST_VISIBLE,
            name: "command_buffer",
        })
    }

    /// Dwords `buffer` holds
    fn capacity_of(buffer: &Allocation) -> usize {
        (buffer.size().as_bytes() / 4) as usize
    }

    fn exec_info_desc(device: &Device, desc: &CommandListDesc) -> InOrderExecInfoDesc {
        InOrderExecInfoDesc {
            partition_count: desc.partition_count,
            wide_counter: device.use_wide_counter(),
            atomic_signalling: device.atomic_signalling_for(desc.partition_count),
            regular: !desc.is_immediate(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Handle
    #[inline]
    pub fn handle(&self) -> CommandListHandle {
        self.handle
    }

    /// Capability set
    #[inline]
    pub fn desc(&self) -> &CommandListDesc {
        &self.desc
    }

    /// Device
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Counter state of an in-order list
    #[inline]
    pub fn in_order_exec_info(&self) -> Option<&Arc<InOrderExecInfo>> {
        self.info.as_ref()
    }

    /// Recorded commands
    #[inline]
    pub fn stream(&self) -> &CommandStream {
        &self.stream
    }

    /// Patch sites
    #[inline]
    pub fn patches(&self) -> &PatchManager {
        &self.patches
    }

    /// Synchronized dispatch queue id (assigned id + 1)
    #[inline]
    pub fn sync_queue_id(&self) -> Option<u32> {
        self.sync_queue_id
    }

    /// Whether the list is closed
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Task count of the latest submission
    #[inline]
    pub fn latest_task_count(&self) -> Option<u64> {
        self.latest_task_count
    }

    /// Backing command buffer
    #[inline]
    pub fn command_buffer(&self) -> &Allocation {
        &self.buffer
    }

    /// Whether `allocation` is part of the residency set
    pub fn is_resident(&self, allocation: &Allocation) -> bool {
        self.residency.contains_key(&allocation.handle())
    }

    /// Whether appends record patch sites for waits on or signals of `info`
    pub(crate) fn records_patches_for(&self, info: &InOrderExecInfo) -> bool {
        !self.desc.is_immediate()
            && self.device.config().regular_list_patching
            && info.is_regular()
    }

    // =========================================================================
    // Residency
    // =========================================================================

    pub(crate) fn track(&mut self, allocation: &Allocation) {
        self.residency
            .entry(allocation.handle())
            .or_insert_with(|| allocation.clone());
    }

    pub(crate) fn track_info(&mut self, info: &InOrderExecInfo) {
        if let Some(allocation) = info.device_allocation() {
            self.track(allocation);
        }
        if let Some(allocation) = info.host_allocation() {
            self.track(allocation);
        }
    }

    fn track_counter(&mut self) {
        if let Some(info) = self.info.clone() {
            self.track_info(&info);
        }
    }

    fn make_resident(&self) -> Result<()> {
        let submission = self.device.submission();
        for allocation in self.residency.values() {
            submission.make_resident(allocation)?;
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    /// Close a replayable list for execution
    pub fn close(&mut self) -> Result<()> {
        if self.desc.is_immediate() {
            return Err(Error::InvalidState);
        }
        self.ensure_open()?;
        self.closed = true;
        Ok(())
    }

    /// Drop recorded commands, patch sites and counter state
    pub fn reset(&mut self) -> Result<()> {
        self.stream.clear();
        self.patches.clear();
        if let Some(info) = &self.info {
            info.reset();
        }
        self.residency.clear();
        let buffer = self.buffer.clone();
        self.track(&buffer);
        self.track_counter();
        self.closed = false;
        self.flushed_dwords = 0;
        self.latest_task_count = None;
        Ok(())
    }

    /// Replace the counter state of an in-order list
    ///
    /// Subsequent appends signal `info`; recorded patch sites follow it.
    pub fn replace_in_order_exec_info(&mut self, info: Arc<InOrderExecInfo>) -> Result<()> {
        let old = self.info.clone().ok_or(Error::InvalidState)?;
        if info.is_regular() != old.is_regular() {
            return Err(Error::InvalidArgument);
        }
        let retargeted = self.patches.retarget(&old, &info);
        log::debug!("inorder: replaced counter, {} patch site(s) retargeted", retargeted);
        self.track_info(&info);
        self.info = Some(info);
        Ok(())
    }

    /// Start over at the buffer base once everything recorded was submitted
    pub(crate) fn recycle_stream(&mut self) {
        let capacity = Self::capacity_of(&self.buffer);
        if self.desc.is_immediate()
            && self.flushed_dwords == self.stream.len()
            && self.stream.len() > capacity / 2
        {
            self.stream.clear();
            self.flushed_dwords = 0;
        }
    }

    /// Free buffer space after a recording did not fit
    ///
    /// Immediate lists restart at the buffer base when nothing is pending.
    /// Regular lists move to a larger buffer.
    pub(crate) fn make_room(&mut self) -> Result<()> {
        if !self.desc.is_immediate() {
            return self.grow_buffer();
        }
        if self.stream.is_empty() || self.flushed_dwords != self.stream.len() {
            return Err(Error::CommandBufferFull);
        }
        self.stream.clear();
        self.flushed_dwords = 0;
        Ok(())
    }

    fn grow_buffer(&mut self) -> Result<()> {
        let current = self.buffer.size();
        if current.as_bytes() >= MAX_COMMAND_BUFFER_SIZE.as_bytes() {
            log::warn!("inorder: command buffer already at {}", current);
            return Err(Error::CommandBufferFull);
        }
        let size = ByteSize::from_bytes(current.as_bytes() * 2);
        let buffer = Self::allocate_buffer(&self.device, size)?;
        if let Err(err) = self
            .stream
            .relocate(buffer.gpu_addr(), Self::capacity_of(&buffer))
        {
            if let Err(free_err) = self.device.page_allocator().free(&buffer) {
                log::warn!("inorder: failed to release command buffer: {}", free_err);
            }
            return Err(err);
        }

        let old = core::mem::replace(&mut self.buffer, buffer);
        self.residency.remove(&old.handle());
        let buffer = self.buffer.clone();
        self.track(&buffer);
        if let Err(err) = self.device.page_allocator().free(&old) {
            log::warn!("inorder: failed to release command buffer: {}", err);
        }
        log::debug!("inorder: command buffer grown to {} at {}", size, buffer.gpu_addr());
        Ok(())
    }

    /// Submit everything recorded since the previous flush
    pub(crate) fn flush_immediate(&mut self, relaxed: bool) -> Result<()> {
        let start = self.flushed_dwords;
        if start == self.stream.len() {
            return Ok(());
        }
        self.make_resident()?;

        let mut flags = SubmitFlags::IMMEDIATE;
        if relaxed {
            flags |= SubmitFlags::RELAXED_ORDERING;
        }
        let commands = &self.stream.dwords()[start..];
        let task_count = self
            .device
            .submission()
            .submit(commands, self.stream.gpu_addr_at(start), flags)?;
        self.flushed_dwords = self.stream.len();
        self.latest_task_count = Some(task_count);
        Ok(())
    }

    /// Patch and submit one replay of a closed list
    ///
    /// The replay counts toward the submission counter only when the list
    /// patches its values and the submission layer accepted it.
    fn submit_replay(&mut self) -> Result<u64> {
        let counted = self
            .info
            .clone()
            .filter(|info| self.records_patches_for(info));
        if let Some(info) = &counted {
            info.add_regular_submission_counter(1);
        }

        match self.patch_and_submit() {
            Ok(task_count) => {
                self.latest_task_count = Some(task_count);
                Ok(task_count)
            }
            Err(err) => {
                if let Some(info) = &counted {
                    info.sub_regular_submission_counter(1);
                }
                log::warn!("inorder: replay not submitted: {}", err);
                Err(err)
            }
        }
    }

    fn patch_and_submit(&mut self) -> Result<u64> {
        self.patches.patch(&mut self.stream)?;
        self.make_resident()?;
        self.device
            .submission()
            .submit(self.stream.dwords(), self.stream.base(), SubmitFlags::empty())
    }

    // =========================================================================
    // Host synchronization
    // =========================================================================

    /// Wait on the host until everything submitted from the list completed
    ///
    /// `task_count_hint` overrides the fence used when the counter cannot be
    /// polled. Replays of a regular list recorded without patch sites write
    /// the same values every time, so those lists wait on the fence too.
    /// With `handle_post_sync_ops` a successful wait releases temporary
    /// allocations retired by the fence.
    pub fn host_synchronize(
        &self,
        timeout_ns: u64,
        task_count_hint: Option<u64>,
        handle_post_sync_ops: bool,
    ) -> Result<SyncStatus> {
        let Some(task_count) = task_count_hint.or(self.latest_task_count) else {
            return Ok(SyncStatus::Ready);
        };

        let status = match &self.info {
            Some(info) if !info.is_regular() || self.records_patches_for(info) => {
                let target = info.effective_wait_value(info.counter_value());
                match host_sync::wait_for_counter(
                    &self.device,
                    info,
                    info.allocation_offset(),
                    target,
                    timeout_ns,
                ) {
                    Err(Error::NotMapped) => self
                        .device
                        .submission()
                        .wait_for_task_count(task_count, timeout_ns)?,
                    other => other?,
                }
            }
            _ => {
                if self.device.submission().is_gpu_hang_detected() {
                    return Err(Error::DeviceLost);
                }
                self.device
                    .submission()
                    .wait_for_task_count(task_count, timeout_ns)?
            }
        };

        if status.is_ready() && handle_post_sync_ops {
            self.device.submission().release_completed_allocations(task_count);
        }
        Ok(status)
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if let Err(err) = self.device.page_allocator().free(&self.buffer) {
            log::warn!("inorder: failed to release command buffer: {}", err);
        }
    }
}

impl fmt::Debug for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("handle", &self.handle)
            .field("desc", &self.desc)
            .field("dwords", &self.stream.len())
            .field("patches", &self.patches.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// Queue executing closed replayable lists
#[derive(Debug)]
pub struct CommandQueue {
    device: Arc<Device>,
    latest_task_count: Option<u64>,
}

impl CommandQueue {
    /// Create a queue
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            device: Arc::clone(device),
            latest_task_count: None,
        }
    }

    /// Task count of the latest submission
    #[inline]
    pub fn latest_task_count(&self) -> Option<u64> {
        self.latest_task_count
    }

    /// Patch and submit closed replayable lists in order
    pub fn execute_command_lists(&mut self, lists: &mut [&mut CommandList]) -> Result<u64> {
        for list in lists.iter() {
            if list.desc.is_immediate() || !Arc::ptr_eq(&list.device, &self.device) {
                return Err(Error::InvalidArgument);
            }
            if !list.closed {
                return Err(Error::InvalidState);
            }
        }
        if lists.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let mut task_count = 0;
        for list in lists.iter_mut() {
            task_count = list.submit_replay()?;
        }
        self.latest_task_count = Some(task_count);
        Ok(task_count)
    }
}
