//! # Synchronized Dispatch
//!
//! Multi-tile queues share one device token so that their dispatches never
//! interleave across tiles.
//!
//! ## Token Layout
//!
//! ```text
//!   token + 0   dword   partitions still holding the token
//!   token + 4   dword   owner queue id (0 = free)
//! ```
//!
//! ## Full Mode Acquire
//!
//! ```text
//!           COND_BB  partition != 0 ─────────────────────────┐
//!   LOOP:   ATOMIC  cmpxchg token: 0 -> (queue << 32 | parts)│
//!           COND_BB  owner == queue ──────────────┐          │
//!           SEMAPHORE_WAIT  owner == 0            │          │
//!           BB  LOOP                              │          │
//!   SECOND: SEMAPHORE_WAIT  owner == queue ◄──────┼──────────┘
//!   END:    payload ◄─────────────────────────────┘
//! ```
//!
//! Only the primary partition competes for the token; secondary partitions
//! wait until their queue owns it.
//!
//! The release decrements the partition count on every tile and frees the
//! token once the count reaches zero. Limited mode only waits for a free
//! token and never takes ownership.

use magma_cmd::{AtomicOp, Branch, CompareOp, ConditionalBranch, SemaphoreWait};
use magma_core::{GpuAddr, Result, SyncDispatchMode};

use crate::cmdlist::CommandList;

/// Offset of the owner queue id inside the token
pub const SYNC_TOKEN_OWNER_OFFSET: u64 = 4;

impl CommandList {
    /// Whether appends of this list take part in synchronized dispatch
    pub(crate) fn uses_sync_dispatch(&self) -> bool {
        self.desc.sync_dispatch != SyncDispatchMode::Disabled
            && self.desc.partition_count > 1
            && !self.desc.copy_only
    }

    /// Acquire (full) or await (limited) the dispatch token
    pub(crate) fn emit_sync_dispatch_prologue(&mut self) -> Result<()> {
        if !self.uses_sync_dispatch() {
            return Ok(());
        }
        let token = self.device.sync_dispatch_token()?.clone();
        self.track(&token);
        let owner = token.gpu_addr() + SYNC_TOKEN_OWNER_OFFSET;

        let queue_id = match (self.desc.sync_dispatch, self.sync_queue_id) {
            (SyncDispatchMode::Full, Some(queue_id)) => queue_id,
            _ => {
                self.stream
                    .emit(SemaphoreWait::new(owner, 0, CompareOp::Equal))?;
                return Ok(());
            }
        };
        let acquired = ((queue_id as u64) << 32) | self.desc.partition_count as u64;
        let work_partition = self.device.caps().work_partition_addr;

        let select = self.stream.emit(ConditionalBranch::new(
            work_partition,
            0,
            CompareOp::NotEqual,
            GpuAddr::null(),
        ))?;

        let acquire_loop = self.stream.current_addr();
        self.stream
            .emit(AtomicOp::compare_write(token.gpu_addr(), 0, acquired).qword())?;
        let owned = self.stream.emit(ConditionalBranch::new(
            owner,
            queue_id as u64,
            CompareOp::Equal,
            GpuAddr::null(),
        ))?;
        self.stream
            .emit(SemaphoreWait::new(owner, 0, CompareOp::Equal))?;
        self.stream.emit(Branch::new(acquire_loop))?;

        let secondary = self.stream.current_addr();
        self.stream
            .emit(SemaphoreWait::new(owner, queue_id as u64, CompareOp::Equal))?;
        let end = self.stream.current_addr();

        self.stream
            .packet_mut::<ConditionalBranch>(select)?
            .set_target(secondary);
        self.stream
            .packet_mut::<ConditionalBranch>(owned)?
            .set_target(end);
        Ok(())
    }

    /// Release the token taken by the prologue
    pub(crate) fn emit_sync_dispatch_epilogue(&mut self) -> Result<()> {
        if !self.uses_sync_dispatch() || self.desc.sync_dispatch != SyncDispatchMode::Full {
            return Ok(());
        }
        let Some(queue_id) = self.sync_queue_id else {
            return Ok(());
        };
        let token = self.device.sync_dispatch_token()?.gpu_addr();
        self.stream.emit(AtomicOp::decrement(token).qword())?;
        self.stream
            .emit(AtomicOp::compare_write(token, (queue_id as u64) << 32, 0).qword())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdlist::CommandListDesc;
    use crate::testing::{commands_since, Fixture, WORK_PARTITION_ADDR};
    use alloc::vec::Vec;
    use magma_cmd::{decode, AtomicOpcode, Command};

    fn full_list(fixture: &Fixture) -> CommandList {
        fixture.list(
            CommandListDesc::immediate()
                .with_partitions(2)
                .with_sync_dispatch(SyncDispatchMode::Full),
        )
    }

    #[test]
    fn test_full_mode_acquire_sequence() {
        let fixture = Fixture::multi_tile(2);
        let mut list = full_list(&fixture);
        let queue_id = list.sync_queue_id().unwrap() as u64;
        list.append_launch_kernel(&fixture.kernel(), None, &[]).unwrap();

        let token = fixture.device.sync_dispatch_token().unwrap().clone();
        let owner = token.gpu_addr() + SYNC_TOKEN_OWNER_OFFSET;
        assert!(list.is_resident(&token));

        let decoded = decode(list.stream().dwords(), list.stream().base()).unwrap();
        let select = decoded[0].command.as_conditional_branch().unwrap();
        assert_eq!(select.addr(), WORK_PARTITION_ADDR);
        assert_eq!(select.compare_op(), Some(CompareOp::NotEqual));

        let acquire_loop = decoded[1].addr;
        let cmpxchg = decoded[1].command.as_atomic().unwrap();
        assert_eq!(cmpxchg.op(), Some(AtomicOpcode::CompareWrite));
        assert_eq!(cmpxchg.operand1(), 0);
        assert_eq!(cmpxchg.operand2(), (queue_id << 32) | 2);

        let owned = decoded[2].command.as_conditional_branch().unwrap();
        assert_eq!(owned.addr(), owner);
        assert_eq!(owned.value(), queue_id);
        let free = decoded[3].command.as_semaphore_wait().unwrap();
        assert_eq!(free.addr(), owner);
        assert_eq!(free.value(), 0);
        assert!(matches!(decoded[4].command, Command::Branch(b) if b.target() == acquire_loop));

        assert_eq!(select.target(), decoded[5].addr);
        let secondary_wait = decoded[5].command.as_semaphore_wait().unwrap();
        assert_eq!(secondary_wait.value(), queue_id);
        assert_eq!(owned.target(), decoded[6].addr);
        assert!(decoded[6].command.as_dispatch().is_some());
    }

    #[test]
    fn test_full_mode_release_after_signal() {
        let fixture = Fixture::multi_tile(2);
        let mut list = full_list(&fixture);
        let queue_id = list.sync_queue_id().unwrap() as u64;
        list.append_launch_kernel(&fixture.kernel(), None, &[]).unwrap();

        let token = fixture.device.sync_dispatch_token().unwrap().gpu_addr();
        let atomics: Vec<_> = commands_since(&list, 0)
            .iter()
            .filter_map(Command::as_atomic)
            .copied()
            .collect();
        assert_eq!(atomics.len(), 3);
        assert_eq!(atomics[1].op(), Some(AtomicOpcode::Decrement));
        assert_eq!(atomics[1].addr(), token);
        assert_eq!(atomics[2].op(), Some(AtomicOpcode::CompareWrite));
        assert_eq!(atomics[2].operand1(), queue_id << 32);
        assert_eq!(atomics[2].operand2(), 0);
    }

    #[test]
    fn test_limited_mode_waits_for_free_token() {
        let fixture = Fixture::multi_tile(2);
        let mut list = fixture.list(
            CommandListDesc::immediate()
                .with_partitions(2)
                .with_sync_dispatch(SyncDispatchMode::Limited),
        );
        assert_eq!(list.sync_queue_id(), None);
        list.append_launch_kernel(&fixture.kernel(), None, &[]).unwrap();

        let owner = fixture.device.sync_dispatch_token().unwrap().gpu_addr() + SYNC_TOKEN_OWNER_OFFSET;
        let commands = commands_since(&list, 0);
        let wait = commands[0].as_semaphore_wait().unwrap();
        assert_eq!(wait.addr(), owner);
        assert_eq!(wait.value(), 0);
        assert_eq!(wait.compare_op(), Some(CompareOp::Equal));
        assert!(commands.iter().all(|command| command.as_atomic().is_none()));
    }

    #[test]
    fn test_dependency_waits_precede_acquire() {
        let fixture = Fixture::multi_tile(2);
        let mut list = full_list(&fixture);
        list.append_launch_kernel(&fixture.kernel(), None, &[]).unwrap();
        let mut other = fixture.list(CommandListDesc::immediate().with_partitions(2));
        let event = fixture.event(crate::event::SignalScope::DEVICE);
        other.append_launch_kernel(&fixture.kernel(), Some(&event), &[]).unwrap();

        let mark = list.stream().len();
        list.append_launch_kernel(&fixture.kernel(), None, &[&event]).unwrap();
        let commands = commands_since(&list, mark);
        let first_branch = commands
            .iter()
            .position(|command| command.as_conditional_branch().is_some())
            .unwrap();
        let waits_before = commands[..first_branch]
            .iter()
            .filter(|command| command.as_semaphore_wait().is_some())
            .count();
        assert_eq!(waits_before, 2);
    }

    #[test]
    fn test_single_tile_ignores_sync_dispatch() {
        let fixture = Fixture::single_tile();
        let mut list = fixture.list(
            CommandListDesc::immediate().with_sync_dispatch(SyncDispatchMode::Full),
        );
        list.append_launch_kernel(&fixture.kernel(), None, &[]).unwrap();
        let commands = commands_since(&list, 0);
        assert!(commands.iter().all(|command| !command.is_wait()));
    }
}
