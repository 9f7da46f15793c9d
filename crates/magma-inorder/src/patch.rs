//! # Patch Manager
//!
//! Replayable lists are recorded once and enqueued many times. Every literal
//! that depends on how often a counter has been replayed is recorded as a
//! patch site and rewritten in place before each enqueue:
//!
//! ```text
//!   expected = base + info.counter × (info.submissions − 1)
//! ```
//!
//! Sites are dword offsets into the list's [`CommandStream`], so they stay
//! valid across buffer growth.

use alloc::sync::Arc;
use alloc::vec::Vec;

use magma_cmd::{CommandStream, Dispatch, LoadRegisterImm, SemaphoreWait, StoreDataImm};
use magma_core::{Error, Result};

use crate::exec_info::InOrderExecInfo;

/// Location and shape of a patch site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Inline completion write of a dispatch
    WalkerPostSync {
        /// Dword offset of the dispatch
        offset: usize,
    },
    /// Dedicated counter store
    StoreWrite {
        /// Dword offset of the store
        offset: usize,
    },
    /// Inline semaphore wait value
    Semaphore {
        /// Dword offset of the wait
        offset: usize,
    },
    /// Register pair feeding an indirect 64-bit wait
    RegisterLoadPair {
        /// Dword offset of the low-dword load
        lo_offset: usize,
        /// Dword offset of the high-dword load
        hi_offset: usize,
    },
}

/// A recorded patch site
#[derive(Debug, Clone)]
pub struct PatchCommand {
    /// Site
    pub kind: PatchKind,
    /// Value recorded at encode time
    pub base_value: u64,
    /// Counter whose replays the value follows
    pub info: Arc<InOrderExecInfo>,
    /// Whether the site is rewritten on enqueue
    pub enabled: bool,
}

impl PatchCommand {
    /// Value the site must hold for the current enqueue
    pub fn expected_value(&self) -> u64 {
        let execution_index = self.info.regular_submission_counter().saturating_sub(1);
        self.base_value + self.info.counter_value() * execution_index
    }

    fn apply(&self, stream: &mut CommandStream) -> Result<()> {
        let value = self.expected_value();
        match self.kind {
            PatchKind::WalkerPostSync { offset } => {
                stream.packet_mut::<Dispatch>(offset)?.set_post_sync_value(value)?;
            }
            PatchKind::StoreWrite { offset } => {
                stream.packet_mut::<StoreDataImm>(offset)?.set_value(value);
            }
            PatchKind::Semaphore { offset } => {
                stream.packet_mut::<SemaphoreWait>(offset)?.set_value(value);
            }
            PatchKind::RegisterLoadPair { lo_offset, hi_offset } => {
                stream.packet_mut::<LoadRegisterImm>(lo_offset)?.data = value as u32;
                stream.packet_mut::<LoadRegisterImm>(hi_offset)?.data = (value >> 32) as u32;
            }
        }
        Ok(())
    }
}

/// Patch sites of one command list
#[derive(Debug, Default)]
pub struct PatchManager {
    commands: Vec<PatchCommand>,
}

impl PatchManager {
    /// Empty manager
    pub const fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    /// Record a site, returning its index
    pub fn add(&mut self, kind: PatchKind, base_value: u64, info: &Arc<InOrderExecInfo>) -> usize {
        self.commands.push(PatchCommand {
            kind,
            base_value,
            info: Arc::clone(info),
            enabled: true,
        });
        self.commands.len() - 1
    }

    /// Number of recorded sites
    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing was recorded
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Site at `index`
    pub fn get(&self, index: usize) -> Option<&PatchCommand> {
        self.commands.get(index)
    }

    /// Every recorded site
    pub fn iter(&self) -> impl Iterator<Item = &PatchCommand> {
        self.commands.iter()
    }

    fn entry_mut(&mut self, index: usize) -> Result<&mut PatchCommand> {
        self.commands.get_mut(index).ok_or(Error::InvalidArgument)
    }

    /// Stop rewriting a site
    pub fn disable(&mut self, index: usize) -> Result<()> {
        self.entry_mut(index)?.enabled = false;
        Ok(())
    }

    /// Resume rewriting a site
    pub fn enable(&mut self, index: usize) -> Result<()> {
        self.entry_mut(index)?.enabled = true;
        Ok(())
    }

    /// Point a site at another counter
    ///
    /// Re-targets made for a submission leave the site disabled until it is
    /// explicitly re-enabled.
    pub fn update_in_order_exec_info(
        &mut self,
        index: usize,
        info: &Arc<InOrderExecInfo>,
        is_submission: bool,
    ) -> Result<()> {
        let entry = self.entry_mut(index)?;
        entry.info = Arc::clone(info);
        if is_submission {
            entry.enabled = false;
        }
        Ok(())
    }

    /// Re-target every site following `old` to `new`
    pub fn retarget(&mut self, old: &Arc<InOrderExecInfo>, new: &Arc<InOrderExecInfo>) -> usize {
        let mut retargeted = 0;
        for entry in self
            .commands
            .iter_mut()
            .filter(|entry| Arc::ptr_eq(&entry.info, old))
        {
            entry.info = Arc::clone(new);
            retargeted += 1;
        }
        retargeted
    }

    /// Rewrite every enabled site, returning how many were patched
    pub fn patch(&self, stream: &mut CommandStream) -> Result<usize> {
        let mut patched = 0;
        for entry in self.commands.iter().filter(|entry| entry.enabled) {
            entry.apply(stream)?;
            patched += 1;
        }
        if patched > 0 {
            log::debug!("inorder: patched {} site(s)", patched);
        }
        Ok(patched)
    }

    /// Drop every site
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Drop every site recorded after the first `len`
    pub fn truncate(&mut self, len: usize) {
        self.commands.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_info::InOrderExecInfoDesc;
    use crate::testing::Fixture;
    use magma_cmd::{register, CompareOp, StoreFlags};
    use magma_core::GpuAddr;

    fn regular_info(fixture: &Fixture) -> Arc<InOrderExecInfo> {
        InOrderExecInfo::new(
            fixture.device.counter_allocator(),
            InOrderExecInfoDesc {
                regular: true,
                ..InOrderExecInfoDesc::new()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_patch_every_kind() {
        let fixture = Fixture::single_tile();
        let info = regular_info(&fixture);
        info.add_counter_value(2);

        let mut stream = CommandStream::new(GpuAddr::new(0x10_0000));
        let addr = GpuAddr::new(0x2000);
        let walker = stream
            .emit(Dispatch::new(1, [1, 1, 1]).with_post_sync(addr, 1, StoreFlags::QWORD))
            .unwrap();
        let store = stream.emit(StoreDataImm::new(addr, 2).qword()).unwrap();
        let wait = stream
            .emit(SemaphoreWait::new(addr, 1, CompareOp::GreaterOrEqual))
            .unwrap();
        let lo = stream.emit(LoadRegisterImm::new(register::CS_GPR_R0, 1)).unwrap();
        let hi = stream
            .emit(LoadRegisterImm::new(register::high_dword(register::CS_GPR_R0), 0))
            .unwrap();

        let mut patches = PatchManager::new();
        patches.add(PatchKind::WalkerPostSync { offset: walker }, 1, &info);
        patches.add(PatchKind::StoreWrite { offset: store }, 2, &info);
        patches.add(PatchKind::Semaphore { offset: wait }, 1, &info);
        patches.add(PatchKind::RegisterLoadPair { lo_offset: lo, hi_offset: hi }, 1, &info);

        for execution in 1..=3u64 {
            info.add_regular_submission_counter(1);
            assert_eq!(patches.patch(&mut stream).unwrap(), 4);
            let index = execution - 1;
            assert_eq!(
                stream.packet::<Dispatch>(walker).unwrap().post_sync_value(),
                1 + 2 * index
            );
            assert_eq!(stream.packet::<StoreDataImm>(store).unwrap().value(), 2 + 2 * index);
            assert_eq!(stream.packet::<SemaphoreWait>(wait).unwrap().value(), 1 + 2 * index);
            assert_eq!(stream.packet::<LoadRegisterImm>(lo).unwrap().data as u64, 1 + 2 * index);
            assert_eq!(stream.packet::<LoadRegisterImm>(hi).unwrap().data, 0);
        }
    }

    #[test]
    fn test_register_pair_carries_high_dword() {
        let fixture = Fixture::single_tile();
        let info = regular_info(&fixture);
        info.add_counter_value(0x8000_0000);

        let mut stream = CommandStream::new(GpuAddr::new(0x10_0000));
        let lo = stream.emit(LoadRegisterImm::new(register::CS_GPR_R0, 0)).unwrap();
        let hi = stream
            .emit(LoadRegisterImm::new(register::high_dword(register::CS_GPR_R0), 0))
            .unwrap();
        let mut patches = PatchManager::new();
        patches.add(PatchKind::RegisterLoadPair { lo_offset: lo, hi_offset: hi }, 0, &info);

        info.add_regular_submission_counter(3);
        patches.patch(&mut stream).unwrap();
        // 0x8000_0000 * 2
        assert_eq!(stream.packet::<LoadRegisterImm>(lo).unwrap().data, 0);
        assert_eq!(stream.packet::<LoadRegisterImm>(hi).unwrap().data, 1);
    }

    #[test]
    fn test_disabled_sites_untouched() {
        let fixture = Fixture::single_tile();
        let info = regular_info(&fixture);
        info.add_counter_value(1);
        let mut stream = CommandStream::new(GpuAddr::new(0x10_0000));
        let store = stream.emit(StoreDataImm::new(GpuAddr::new(0x2000), 1)).unwrap();
        let mut patches = PatchManager::new();
        let index = patches.add(PatchKind::StoreWrite { offset: store }, 1, &info);

        info.add_regular_submission_counter(2);
        patches.disable(index).unwrap();
        assert_eq!(patches.patch(&mut stream).unwrap(), 0);
        assert_eq!(stream.packet::<StoreDataImm>(store).unwrap().value(), 1);

        patches.enable(index).unwrap();
        patches.patch(&mut stream).unwrap();
        assert_eq!(stream.packet::<StoreDataImm>(store).unwrap().value(), 2);
        assert!(matches!(patches.disable(5), Err(Error::InvalidArgument)));
    }

    #[test]
    fn test_submission_retarget_stays_disabled() {
        let fixture = Fixture::single_tile();
        let first = regular_info(&fixture);
        let second = regular_info(&fixture);
        let mut patches = PatchManager::new();
        let index = patches.add(PatchKind::Semaphore { offset: 0 }, 1, &first);

        patches.update_in_order_exec_info(index, &second, false).unwrap();
        assert!(patches.get(index).unwrap().enabled);
        assert!(Arc::ptr_eq(&patches.get(index).unwrap().info, &second));

        patches.update_in_order_exec_info(index, &first, true).unwrap();
        assert!(!patches.get(index).unwrap().enabled);
        patches.enable(index).unwrap();
        assert!(patches.get(index).unwrap().enabled);
    }

    #[test]
    fn test_retarget_by_owner() {
        let fixture = Fixture::single_tile();
        let first = regular_info(&fixture);
        let other = regular_info(&fixture);
        let second = regular_info(&fixture);
        let mut patches = PatchManager::new();
        patches.add(PatchKind::Semaphore { offset: 0 }, 1, &first);
        patches.add(PatchKind::Semaphore { offset: 7 }, 1, &other);
        patches.add(PatchKind::StoreWrite { offset: 14 }, 2, &first);

        assert_eq!(patches.retarget(&first, &second), 2);
        assert!(Arc::ptr_eq(&patches.get(0).unwrap().info, &second));
        assert!(Arc::ptr_eq(&patches.get(1).unwrap().info, &other));
        assert!(patches.iter().all(|entry| entry.enabled));
    }

    #[test]
    fn test_walker_without_completion_rejected() {
        let fixture = Fixture::single_tile();
        let info = regular_info(&fixture);
        let mut stream = CommandStream::new(GpuAddr::new(0x10_0000));
        let walker = stream.emit(Dispatch::new(1, [1, 1, 1])).unwrap();
        let mut patches = PatchManager::new();
        patches.add(PatchKind::WalkerPostSync { offset: walker }, 1, &info);
        info.add_regular_submission_counter(1);
        assert!(matches!(patches.patch(&mut stream), Err(Error::InvalidCommand)));
    }

    #[test]
    fn test_clear() {
        let fixture = Fixture::single_tile();
        let info = regular_info(&fixture);
        let mut patches = PatchManager::new();
        patches.add(PatchKind::Semaphore { offset: 0 }, 1, &info);
        patches.clear();
        assert!(patches.is_empty());
    }
}
