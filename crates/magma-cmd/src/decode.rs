//! # Command Decoder
//!
//! Parse a recorded stream back into typed commands.
//!
//! Used to inspect emitted control flow: every dependency decision the
//! in-order core makes is visible as data in the decoded stream.

use alloc::vec::Vec;

use magma_core::{Error, GpuAddr, Result};

use crate::packet::{
    split_header, AtomicOp, Branch, ConditionalBranch, Dispatch, Flush, LoadRegisterImm,
    LoadRegisterReg, MemCopy, MemFill, Noop, Opcode, Packet, SemaphoreWait,
    StoreDataImm, Timestamp,
};

/// A decoded command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// No operation
    Noop,
    /// Memory wait
    SemaphoreWait(SemaphoreWait),
    /// Immediate store
    StoreDataImm(StoreDataImm),
    /// Register immediate load
    LoadRegisterImm(LoadRegisterImm),
    /// Timestamp store
    Timestamp(Timestamp),
    /// Register copy
    LoadRegisterReg(LoadRegisterReg),
    /// Atomic operation
    Atomic(AtomicOp),
    /// Unconditional branch
    Branch(Branch),
    /// Conditional branch
    ConditionalBranch(ConditionalBranch),
    /// Copy-engine copy
    MemCopy(MemCopy),
    /// Copy-engine fill
    MemFill(MemFill),
    /// Compute walker
    Dispatch(Dispatch),
    /// Flush / stall
    Flush(Flush),
}

impl Command {
    /// Opcode of the command
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Noop => Opcode::Noop,
            Self::SemaphoreWait(_) => Opcode::SemaphoreWait,
            Self::StoreDataImm(_) => Opcode::StoreDataImm,
            Self::LoadRegisterImm(_) => Opcode::LoadRegisterImm,
            Self::Timestamp(_) => Opcode::Timestamp,
            Self::LoadRegisterReg(_) => Opcode::LoadRegisterReg,
            Self::Atomic(_) => Opcode::Atomic,
            Self::Branch(_) => Opcode::Branch,
            Self::ConditionalBranch(_) => Opcode::ConditionalBranch,
            Self::MemCopy(_) => Opcode::MemCopy,
            Self::MemFill(_) => Opcode::MemFill,
            Self::Dispatch(_) => Opcode::Dispatch,
            Self::Flush(_) => Opcode::Flush,
        }
    }

    /// The command as a semaphore wait
    pub fn as_semaphore_wait(&self) -> Option<&SemaphoreWait> {
        match self {
            Self::SemaphoreWait(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// The command as an immediate store
    pub fn as_store(&self) -> Option<&StoreDataImm> {
        match self {
            Self::StoreDataImm(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// The command as an atomic
    pub fn as_atomic(&self) -> Option<&AtomicOp> {
        match self {
            Self::Atomic(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// The command as a dispatch
    pub fn as_dispatch(&self) -> Option<&Dispatch> {
        match self {
            Self::Dispatch(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// The command as a conditional branch
    pub fn as_conditional_branch(&self) -> Option<&ConditionalBranch> {
        match self {
            Self::ConditionalBranch(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// The command as a register immediate load
    pub fn as_load_register_imm(&self) -> Option<&LoadRegisterImm> {
        match self {
            Self::LoadRegisterImm(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// The command as a register copy
    pub fn as_load_register_reg(&self) -> Option<&LoadRegisterReg> {
        match self {
            Self::LoadRegisterReg(cmd) => Some(cmd),
            _ => None,
        }
    }

    /// Whether the command blocks or redirects on a memory value
    pub fn is_wait(&self) -> bool {
        matches!(self, Self::SemaphoreWait(_) | Self::ConditionalBranch(_))
    }
}

/// A command together with its position in the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCommand {
    /// Dword offset
    pub offset: usize,
    /// GPU address of the command
    pub addr: GpuAddr,
    /// Command
    pub command: Command,
}

fn read<P: Packet>(words: &[u32]) -> Result<P> {
    if words.len() != P::DWORDS {
        return Err(Error::InvalidCommand);
    }
    bytemuck::try_pod_read_unaligned(bytemuck::cast_slice(words)).map_err(|_| Error::InvalidCommand)
}

/// Decode every command of a stream starting at GPU address `base`
pub fn decode(dwords: &[u32], base: GpuAddr) -> Result<Vec<DecodedCommand>> {
    let mut commands = Vec::new();
    let mut offset = 0;

    while offset < dwords.len() {
        let (raw, len) = split_header(dwords[offset]);
        let Some(opcode) = Opcode::from_raw(raw) else {
            log::warn!("unknown opcode {:#x} at dword {}", raw, offset);
            return Err(Error::InvalidCommand);
        };
        if len == 0 {
            return Err(Error::InvalidCommand);
        }
        let words = dwords
            .get(offset..offset + len)
            .ok_or(Error::TruncatedCommand)?;

        let command = match opcode {
            Opcode::Noop => {
                read::<Noop>(words)?;
                Command::Noop
            }
            Opcode::SemaphoreWait => Command::SemaphoreWait(read(words)?),
            Opcode::StoreDataImm => Command::StoreDataImm(read(words)?),
            Opcode::LoadRegisterImm => Command::LoadRegisterImm(read(words)?),
            Opcode::Timestamp => Command::Timestamp(read(words)?),
            Opcode::LoadRegisterReg => Command::LoadRegisterReg(read(words)?),
            Opcode::Atomic => Command::Atomic(read(words)?),
            Opcode::Branch => Command::Branch(read(words)?),
            Opcode::ConditionalBranch => Command::ConditionalBranch(read(words)?),
            Opcode::MemCopy => Command::MemCopy(read(words)?),
            Opcode::MemFill => Command::MemFill(read(words)?),
            Opcode::Dispatch => Command::Dispatch(read(words)?),
            Opcode::Flush => Command::Flush(read(words)?),
        };

        commands.push(DecodedCommand {
            offset,
            addr: base + offset as u64 * 4,
            command,
        });
        offset += len;
    }

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CompareOp, StoreFlags};
    use crate::stream::CommandStream;

    #[test]
    fn test_decode_mixed_stream() {
        let mut stream = CommandStream::new(GpuAddr::new(0x8000));
        stream
            .emit(SemaphoreWait::new(GpuAddr::new(0x1000), 3, CompareOp::GreaterOrEqual))
            .unwrap();
        stream
            .emit(Dispatch::new(7, [4, 1, 1]).with_post_sync(
                GpuAddr::new(0x1000),
                4,
                StoreFlags::empty(),
            ))
            .unwrap();
        stream.emit(Noop::new()).unwrap();

        let commands = decode(stream.dwords(), stream.base()).unwrap();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].command.is_wait());
        assert_eq!(commands[0].command.as_semaphore_wait().unwrap().value(), 3);
        assert_eq!(commands[1].offset, SemaphoreWait::DWORDS);
        assert_eq!(commands[1].addr, GpuAddr::new(0x8000 + 4 * 7));
        assert_eq!(commands[1].command.as_dispatch().unwrap().post_sync_value(), 4);
        assert_eq!(commands[2].command, Command::Noop);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(&[0xff00_0001], GpuAddr::null()),
            Err(Error::InvalidCommand)
        ));

        let header = StoreDataImm::header();
        assert!(matches!(
            decode(&[header, 0, 0], GpuAddr::null()),
            Err(Error::TruncatedCommand)
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        // A store header claiming three dwords.
        let header = (Opcode::StoreDataImm as u32) << 24 | 3;
        assert!(matches!(
            decode(&[header, 0, 0], GpuAddr::null()),
            Err(Error::InvalidCommand)
        ));
    }
}
