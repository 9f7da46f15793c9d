//! Test doubles: a recording submission layer and a device fixture.

#![allow(missing_docs)]

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use magma_cmd::{decode, Command, Opcode};
use magma_core::{BufferHandle, ByteSize, Error, GpuAddr, InOrderConfig, Result, StepClock};
use magma_mem::{Allocation, SysmemAllocator};

use crate::append::KernelLaunch;
use crate::cmdlist::{CommandList, CommandListDesc};
use crate::device::{Device, DeviceCaps, SubmissionLayer, SubmitFlags};
use crate::event::{CounterBasedFlags, Event, EventDesc, EventPool, EventPoolDesc, EventPoolFlags, SignalScope};
use crate::host_sync::SyncStatus;

/// Work partition memory of multi-tile fixtures
pub const WORK_PARTITION_ADDR: GpuAddr = GpuAddr::new(0x9000);

/// Nanoseconds the fixture clock advances per read
const CLOCK_STEP_NS: u64 = 1_000;

// =============================================================================
// MOCK SUBMISSION
// =============================================================================

/// A recorded submission
#[derive(Debug, Clone)]
pub struct Submission {
    pub dwords: Vec<u32>,
    pub base: GpuAddr,
    pub flags: SubmitFlags,
    pub task_count: u64,
}

#[derive(Debug, Default)]
struct MockState {
    submissions: Vec<Submission>,
    resident: Vec<BufferHandle>,
    downloads: usize,
    hang: bool,
    hang_checks: usize,
    relaxed: bool,
    clients: u32,
    user_fence_calls: Vec<(GpuAddr, u64)>,
    user_fence_result: bool,
    released: Vec<u64>,
    task_count: u64,
    completed: u64,
    reject_submissions: bool,
}

/// Submission layer that records everything and never executes
#[derive(Debug, Default)]
pub struct MockSubmission {
    state: Mutex<MockState>,
}

impl MockSubmission {
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().hang = hang;
    }

    pub fn hang_checks(&self) -> usize {
        self.state.lock().hang_checks
    }

    pub fn downloads(&self) -> usize {
        self.state.lock().downloads
    }

    pub fn set_relaxed(&self, supported: bool, clients: u32) {
        let mut state = self.state.lock();
        state.relaxed = supported;
        state.clients = clients;
    }

    /// Fail every submission with `Error::OutOfMemory` while set
    pub fn set_reject_submissions(&self, reject: bool) {
        self.state.lock().reject_submissions = reject;
    }

    pub fn set_user_fence_result(&self, result: bool) {
        self.state.lock().user_fence_result = result;
    }

    pub fn user_fence_calls(&self) -> Vec<(GpuAddr, u64)> {
        self.state.lock().user_fence_calls.clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    pub fn resident(&self) -> Vec<BufferHandle> {
        self.state.lock().resident.clone()
    }

    pub fn released(&self) -> Vec<u64> {
        self.state.lock().released.clone()
    }

    /// Retire every submitted task count
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        state.completed = state.task_count;
    }
}

impl SubmissionLayer for MockSubmission {
    fn submit(&self, commands: &[u32], base: GpuAddr, flags: SubmitFlags) -> Result<u64> {
        let mut state = self.state.lock();
        if state.reject_submissions {
            return Err(Error::OutOfMemory);
        }
        state.task_count += 1;
        let task_count = state.task_count;
        state.submissions.push(Submission {
            dwords: commands.to_vec(),
            base,
            flags,
            task_count,
        });
        Ok(task_count)
    }

    fn make_resident(&self, allocation: &Allocation) -> Result<()> {
        let mut state = self.state.lock();
        if !state.resident.contains(&allocation.handle()) {
            state.resident.push(allocation.handle());
        }
        Ok(())
    }

    fn wait_for_task_count(&self, task_count: u64, _timeout_ns: u64) -> Result<SyncStatus> {
        let state = self.state.lock();
        Ok(if task_count <= state.completed {
            SyncStatus::Ready
        } else {
            SyncStatus::NotReady
        })
    }

    fn download_allocation(&self, _allocation: &Allocation) -> Result<()> {
        self.state.lock().downloads += 1;
        Ok(())
    }

    fn is_gpu_hang_detected(&self) -> bool {
        let mut state = self.state.lock();
        state.hang_checks += 1;
        state.hang
    }

    fn supports_relaxed_ordering(&self) -> bool {
        self.state.lock().relaxed
    }

    fn registered_clients(&self) -> u32 {
        self.state.lock().clients
    }

    fn wait_user_fence(&self, addr: GpuAddr, value: u64, _timeout_ns: u64) -> Result<bool> {
        let mut state = self.state.lock();
        state.user_fence_calls.push((addr, value));
        Ok(state.user_fence_result)
    }

    fn release_completed_allocations(&self, task_count: u64) {
        self.state.lock().released.push(task_count);
    }
}

// =============================================================================
// FIXTURE
// =============================================================================

/// Device wired to the mock submission layer
#[derive(Debug)]
pub struct Fixture {
    pub device: Arc<Device>,
    pub submission: Arc<MockSubmission>,
    pub clock: Arc<StepClock>,
}

impl Fixture {
    pub fn try_with(caps: DeviceCaps, config: InOrderConfig) -> Result<Self> {
        let submission = Arc::new(MockSubmission::default());
        let clock = Arc::new(StepClock::new(CLOCK_STEP_NS));
        let device = Device::new(
            caps,
            config,
            Arc::new(SysmemAllocator::new(ByteSize::KIB_4)),
            submission.clone(),
            clock.clone(),
        )?;
        Ok(Self {
            device,
            submission,
            clock,
        })
    }

    pub fn with(caps: DeviceCaps, config: InOrderConfig) -> Self {
        Self::try_with(caps, config).unwrap()
    }

    pub fn single_tile() -> Self {
        Self::with(DeviceCaps::single_tile(), InOrderConfig::new())
    }

    pub fn multi_tile(partition_count: u32) -> Self {
        Self::with(
            DeviceCaps::multi_tile(partition_count, WORK_PARTITION_ADDR),
            InOrderConfig::new(),
        )
    }

    pub fn list(&self, desc: CommandListDesc) -> CommandList {
        CommandList::new(&self.device, desc).unwrap()
    }

    pub fn immediate_list(&self) -> CommandList {
        self.list(CommandListDesc::immediate())
    }

    pub fn regular_list(&self) -> CommandList {
        self.list(CommandListDesc::regular())
    }

    pub fn kernel(&self) -> KernelLaunch {
        KernelLaunch::new(7, [4, 1, 1])
    }

    /// Regular event from a single-entry host-visible pool
    pub fn event(&self, scope: SignalScope) -> Arc<Event> {
        let desc = EventPoolDesc {
            flags: EventPoolFlags::HOST_VISIBLE,
            ..EventPoolDesc::new(1)
        };
        let pool = EventPool::new(&self.device, &desc).unwrap();
        pool.create_event(0, EventDesc { signal_scope: scope }).unwrap()
    }

    /// Regular event already signalled from the host
    pub fn signalled_event(&self) -> Arc<Event> {
        let event = self.event(SignalScope::DEVICE);
        event.host_signal().unwrap();
        event
    }

    /// Event from a counter-based pool
    pub fn counter_event(&self, flags: CounterBasedFlags) -> Arc<Event> {
        let pool = EventPool::new(&self.device, &EventPoolDesc::counter_based(1, flags.bits())).unwrap();
        pool.create_event(0, EventDesc::default()).unwrap()
    }
}

/// Commands recorded from dword offset `start` on
pub fn commands_since(list: &CommandList, start: usize) -> Vec<Command> {
    let stream = list.stream();
    decode(&stream.dwords()[start..], stream.gpu_addr_at(start))
        .unwrap()
        .into_iter()
        .map(|decoded| decoded.command)
        .collect()
}

pub fn count_opcode(commands: &[Command], opcode: Opcode) -> usize {
    commands
        .iter()
        .filter(|command| command.opcode() == opcode)
        .count()
}
