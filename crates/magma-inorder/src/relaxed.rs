//! # Relaxed Ordering
//!
//! With several clients feeding the direct-submission scheduler, a blocked
//! wait would stall every client behind it. Relaxed-ordering batches turn
//! waits into conditional returns to the scheduler instead.
//!
//! ```text
//!   LRR  GPR0 ◄── GPR4            scheduler return address
//!   COND_BB  dep < value ──► GPR0  (per dependency slot)
//!   ... payload ...
//! ```

use magma_cmd::register::{high_dword, CS_GPR_R0, CS_GPR_R4};
use magma_cmd::{CompareOp, ConditionalBranch, LoadRegisterReg};
use magma_core::{GpuAddr, Result};

use crate::cmdlist::CommandList;
use crate::event::EVENT_SIGNALED;

impl CommandList {
    /// Whether an append with dependencies goes out with relaxed ordering
    pub(crate) fn use_relaxed_ordering(&self, has_dependencies: bool) -> bool {
        if !has_dependencies || !self.desc.is_immediate() || !self.desc.in_order {
            return false;
        }
        let config = self.device.config();
        let submission = self.device.submission();
        config.relaxed_ordering
            && submission.supports_relaxed_ordering()
            && submission.registered_clients() >= config.relaxed_ordering_min_clients
    }

    /// Load the scheduler return address into the branch target register
    pub(crate) fn emit_relaxed_prologue(&mut self) -> Result<()> {
        self.stream.emit(LoadRegisterReg::new(CS_GPR_R4, CS_GPR_R0))?;
        self.stream
            .emit(LoadRegisterReg::new(high_dword(CS_GPR_R4), high_dword(CS_GPR_R0)))?;
        Ok(())
    }

    /// Return to the scheduler while the counter slot at `addr` is below `value`
    pub(crate) fn emit_relaxed_counter_wait(&mut self, addr: GpuAddr, value: u64, wide: bool) -> Result<()> {
        let branch =
            ConditionalBranch::new(addr, value, CompareOp::Less, GpuAddr::null()).indirect_target();
        self.stream.emit(if wide { branch.qword() } else { branch })?;
        Ok(())
    }

    /// Return to the scheduler while the completion field at `addr` is unsignalled
    pub(crate) fn emit_relaxed_completion_wait(&mut self, addr: GpuAddr) -> Result<()> {
        self.stream.emit(
            ConditionalBranch::new(addr, EVENT_SIGNALED, CompareOp::NotEqual, GpuAddr::null())
                .qword()
                .indirect_target(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SubmitFlags;
    use crate::event::SignalScope;
    use crate::testing::{commands_since, count_opcode, Fixture};
    use alloc::vec::Vec;
    use magma_cmd::{BranchFlags, Command, Opcode};

    fn relaxed_fixture() -> Fixture {
        let fixture = Fixture::single_tile();
        fixture.submission.set_relaxed(true, 2);
        fixture
    }

    #[test]
    fn test_relaxed_needs_scheduler_support_and_clients() {
        let fixture = Fixture::single_tile();
        let list = fixture.immediate_list();
        assert!(!list.use_relaxed_ordering(true));

        fixture.submission.set_relaxed(true, 1);
        assert!(!list.use_relaxed_ordering(true));

        fixture.submission.set_relaxed(true, 2);
        assert!(list.use_relaxed_ordering(true));
        assert!(!list.use_relaxed_ordering(false));

        let regular = fixture.regular_list();
        assert!(!regular.use_relaxed_ordering(true));
    }

    #[test]
    fn test_cross_list_wait_becomes_conditional_return() {
        let fixture = relaxed_fixture();
        let mut producer = fixture.immediate_list();
        let mut consumer = fixture.immediate_list();
        let event = fixture.event(SignalScope::DEVICE);
        producer.append_launch_kernel(&fixture.kernel(), Some(&event), &[]).unwrap();
        let producer_addr = producer.in_order_exec_info().unwrap().device_counter_address();

        let mark = consumer.stream().len();
        consumer.append_launch_kernel(&fixture.kernel(), None, &[&event]).unwrap();
        let commands = commands_since(&consumer, mark);

        let copies: Vec<_> = commands.iter().filter_map(Command::as_load_register_reg).collect();
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].source, CS_GPR_R4);
        assert_eq!(copies[0].destination, CS_GPR_R0);
        assert_eq!(copies[1].destination, high_dword(CS_GPR_R0));

        let branches: Vec<_> = commands.iter().filter_map(Command::as_conditional_branch).collect();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].addr(), producer_addr);
        assert_eq!(branches[0].value(), 1);
        assert_eq!(branches[0].compare_op(), Some(CompareOp::Less));
        assert!(branches[0]
            .flags()
            .contains(BranchFlags::INDIRECT_TARGET | BranchFlags::QWORD));
        assert_eq!(count_opcode(&commands, Opcode::SemaphoreWait), 0);

        let last = fixture.submission.submissions().pop().unwrap();
        assert!(last.flags.contains(SubmitFlags::RELAXED_ORDERING));
    }

    #[test]
    fn test_relaxed_adds_own_counter_wait() {
        let fixture = relaxed_fixture();
        let mut producer = fixture.immediate_list();
        let mut consumer = fixture.immediate_list();
        let event = fixture.event(SignalScope::DEVICE);
        producer.append_launch_kernel(&fixture.kernel(), Some(&event), &[]).unwrap();
        consumer.append_launch_kernel(&fixture.kernel(), None, &[]).unwrap();
        let own = consumer.in_order_exec_info().unwrap().device_counter_address();

        let mark = consumer.stream().len();
        consumer.append_launch_kernel(&fixture.kernel(), None, &[&event]).unwrap();
        let commands = commands_since(&consumer, mark);
        let branches: Vec<_> = commands.iter().filter_map(Command::as_conditional_branch).collect();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].addr(), own);
        assert_eq!(branches[0].value(), 1);
    }

    #[test]
    fn test_regular_event_wait_under_relaxed_ordering() {
        let fixture = relaxed_fixture();
        let mut list = fixture.immediate_list();
        let event = fixture.event(SignalScope::DEVICE);
        event.host_reset().unwrap();

        let mark = list.stream().len();
        list.append_launch_kernel(&fixture.kernel(), None, &[&event]).unwrap();
        let commands = commands_since(&list, mark);
        let branch = commands.iter().find_map(Command::as_conditional_branch).unwrap();
        assert_eq!(Some(branch.addr()), event.completion_addr());
        assert_eq!(branch.value(), EVENT_SIGNALED);
        assert_eq!(branch.compare_op(), Some(CompareOp::NotEqual));
    }

    #[test]
    fn test_no_dependencies_keeps_strict_ordering() {
        let fixture = relaxed_fixture();
        let mut list = fixture.immediate_list();
        list.append_launch_kernel(&fixture.kernel(), None, &[]).unwrap();
        let submission = fixture.submission.submissions().pop().unwrap();
        assert!(!submission.flags.contains(SubmitFlags::RELAXED_ORDERING));
        assert_eq!(count_opcode(&commands_since(&list, 0), Opcode::LoadRegisterReg), 0);
    }
}
