//! # Command Packets
//!
//! Binary layouts of every command the in-order core emits.
//!
//! ```text
//!  31        24 23             8 7          0
//! ┌────────────┬────────────────┬────────────┐
//! │  opcode    │    reserved    │  dwords    │   header
//! ├────────────┴────────────────┴────────────┤
//! │              payload ...                 │
//! └──────────────────────────────────────────┘
//! ```
//!
//! 64-bit quantities are split into `_lo` / `_hi` dwords.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use magma_core::{Error, GpuAddr, Result};

// =============================================================================
// HEADER
// =============================================================================

/// Packet opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// No operation
    Noop = 0x00,
    /// Wait until a memory value satisfies a comparison
    SemaphoreWait = 0x1C,
    /// Store an immediate value
    StoreDataImm = 0x20,
    /// Load an immediate into a register
    LoadRegisterImm = 0x22,
    /// Store the GPU timestamp to memory
    Timestamp = 0x23,
    /// Copy one register into another
    LoadRegisterReg = 0x2A,
    /// Atomic memory operation
    Atomic = 0x2F,
    /// Unconditional batch-buffer branch
    Branch = 0x31,
    /// Branch taken when a memory comparison holds
    ConditionalBranch = 0x36,
    /// Copy-engine linear copy
    MemCopy = 0x42,
    /// Copy-engine fill
    MemFill = 0x43,
    /// Compute walker
    Dispatch = 0x70,
    /// Cache flush / pipeline stall
    Flush = 0x7A,
}

impl Opcode {
    /// Decode a raw opcode byte
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => Self::Noop,
            0x1C => Self::SemaphoreWait,
            0x20 => Self::StoreDataImm,
            0x22 => Self::LoadRegisterImm,
            0x23 => Self::Timestamp,
            0x2A => Self::LoadRegisterReg,
            0x2F => Self::Atomic,
            0x31 => Self::Branch,
            0x36 => Self::ConditionalBranch,
            0x42 => Self::MemCopy,
            0x43 => Self::MemFill,
            0x70 => Self::Dispatch,
            0x7A => Self::Flush,
            _ => return None,
        })
    }
}

/// Build a header dword
#[inline]
pub const fn encode_header(opcode: Opcode, dwords: usize) -> u32 {
    ((opcode as u32) << 24) | (dwords as u32 & 0xff)
}

/// Split a header dword into opcode byte and length
#[inline]
pub const fn split_header(header: u32) -> (u8, usize) {
    ((header >> 24) as u8, (header & 0xff) as usize)
}

#[inline]
const fn lo(value: u64) -> u32 {
    value as u32
}

#[inline]
const fn hi(value: u64) -> u32 {
    (value >> 32) as u32
}

#[inline]
const fn join(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

/// A fixed-layout command packet
pub trait Packet: Pod {
    /// Opcode in the header
    const OPCODE: Opcode;

    /// Length in dwords
    const DWORDS: usize = core::mem::size_of::<Self>() / 4;

    /// Expected header dword
    fn header() -> u32 {
        encode_header(Self::OPCODE, Self::DWORDS)
    }
}

// =============================================================================
// ENUMS AND FLAGS
// =============================================================================

/// Comparison used by waits and conditional branches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CompareOp {
    /// memory >= value
    GreaterOrEqual = 0,
    /// memory > value
    Greater = 1,
    /// memory <= value
    LessOrEqual = 2,
    /// memory < value
    Less = 3,
    /// memory == value
    Equal = 4,
    /// memory != value
    NotEqual = 5,
}

impl CompareOp {
    /// Decode a raw comparison
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::GreaterOrEqual,
            1 => Self::Greater,
            2 => Self::LessOrEqual,
            3 => Self::Less,
            4 => Self::Equal,
            5 => Self::NotEqual,
            _ => return None,
        })
    }

    /// Evaluate the comparison
    pub const fn holds(self, memory: u64, value: u64) -> bool {
        match self {
            Self::GreaterOrEqual => memory >= value,
            Self::Greater => memory > value,
            Self::LessOrEqual => memory <= value,
            Self::Less => memory < value,
            Self::Equal => memory == value,
            Self::NotEqual => memory != value,
        }
    }
}

/// Atomic operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AtomicOpcode {
    /// Add one
    Increment = 0,
    /// Subtract one
    Decrement = 1,
    /// Write operand 2 when memory equals operand 1
    CompareWrite = 2,
}

impl AtomicOpcode {
    /// Decode a raw atomic opcode
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Increment,
            1 => Self::Decrement,
            2 => Self::CompareWrite,
            _ => return None,
        })
    }
}

/// Post-sync operation of a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PostSyncOp {
    /// No completion write
    None = 0,
    /// Write an immediate value on completion
    WriteImmediate = 1,
    /// Write the completion timestamp
    WriteTimestamp = 2,
}

bitflags! {
    /// Semaphore wait modifiers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SemaphoreFlags: u32 {
        /// Compare 64 bits
        const QWORD    = 1 << 0;
        /// Compare against the GPR0 pair instead of inline data
        const INDIRECT = 1 << 1;
    }
}

bitflags! {
    /// Memory write modifiers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StoreFlags: u32 {
        /// Write 64 bits
        const QWORD            = 1 << 0;
        /// Each partition adds its slot offset to the address
        const PARTITION_OFFSET = 1 << 1;
    }
}

bitflags! {
    /// Atomic modifiers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AtomicFlags: u32 {
        /// 64-bit operation
        const QWORD       = 1 << 0;
        /// Operands are carried inline
        const INLINE_DATA = 1 << 1;
    }
}

bitflags! {
    /// Branch modifiers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BranchFlags: u32 {
        /// Compare 64 bits
        const QWORD           = 1 << 0;
        /// Jump to the address held in the GPR0 pair
        const INDIRECT_TARGET = 1 << 1;
    }
}

bitflags! {
    /// Flush modifiers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FlushFlags: u32 {
        /// Flush the data cache to memory
        const DC_FLUSH = 1 << 0;
        /// Stall the command streamer until prior work completes
        const CS_STALL = 1 << 1;
    }
}

// =============================================================================
// SEMAPHORE WAIT
// =============================================================================

/// Wait until memory satisfies a comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SemaphoreWait {
    /// Header
    pub header: u32,
    /// `CompareOp`
    pub compare: u32,
    /// `SemaphoreFlags`
    pub flags: u32,
    /// Address low
    pub addr_lo: u32,
    /// Address high
    pub addr_hi: u32,
    /// Value low
    pub data_lo: u32,
    /// Value high
    pub data_hi: u32,
}

const_assert_eq!(core::mem::size_of::<SemaphoreWait>(), 28);

impl Packet for SemaphoreWait {
    const OPCODE: Opcode = Opcode::SemaphoreWait;
}

impl SemaphoreWait {
    /// Wait with an inline 32-bit value
    pub fn new(addr: GpuAddr, value: u64, compare: CompareOp) -> Self {
        Self {
            header: Self::header(),
            compare: compare as u32,
            flags: 0,
            addr_lo: addr.lo(),
            addr_hi: addr.hi(),
            data_lo: lo(value),
            data_hi: hi(value),
        }
    }

    /// Compare 64 bits
    pub fn qword(mut self) -> Self {
        self.flags |= SemaphoreFlags::QWORD.bits();
        self
    }

    /// Compare against the GPR0 pair
    pub fn indirect(mut self) -> Self {
        self.flags |= SemaphoreFlags::INDIRECT.bits();
        self.data_lo = 0;
        self.data_hi = 0;
        self
    }

    /// Waited address
    pub fn addr(&self) -> GpuAddr {
        GpuAddr::from_parts(self.addr_lo, self.addr_hi)
    }

    /// Inline value
    pub fn value(&self) -> u64 {
        if self.flags().contains(SemaphoreFlags::QWORD) {
            join(self.data_lo, self.data_hi)
        } else {
            self.data_lo as u64
        }
    }

    /// Replace the inline value
    pub fn set_value(&mut self, value: u64) {
        self.data_lo = lo(value);
        self.data_hi = hi(value);
    }

    /// Comparison
    pub fn compare_op(&self) -> Option<CompareOp> {
        CompareOp::from_raw(self.compare)
    }

    /// Modifiers
    pub fn flags(&self) -> SemaphoreFlags {
        SemaphoreFlags::from_bits_truncate(self.flags)
    }
}

// =============================================================================
// STORE DATA IMMEDIATE
// =============================================================================

/// Write an immediate value to memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StoreDataImm {
    /// Header
    pub header: u32,
    /// `StoreFlags`
    pub flags: u32,
    /// Address low
    pub addr_lo: u32,
    /// Address high
    pub addr_hi: u32,
    /// Value low
    pub data_lo: u32,
    /// Value high
    pub data_hi: u32,
}

const_assert_eq!(core::mem::size_of::<StoreDataImm>(), 24);

impl Packet for StoreDataImm {
    const OPCODE: Opcode = Opcode::StoreDataImm;
}

impl StoreDataImm {
    /// 32-bit store
    pub fn new(addr: GpuAddr, value: u64) -> Self {
        Self {
            header: Self::header(),
            flags: 0,
            addr_lo: addr.lo(),
            addr_hi: addr.hi(),
            data_lo: lo(value),
            data_hi: 0,
        }
    }

    /// Store 64 bits
    pub fn qword(mut self) -> Self {
        self.flags |= StoreFlags::QWORD.bits();
        self
    }

    /// Destination
    pub fn addr(&self) -> GpuAddr {
        GpuAddr::from_parts(self.addr_lo, self.addr_hi)
    }

    /// Stored value
    pub fn value(&self) -> u64 {
        if self.flags().contains(StoreFlags::QWORD) {
            join(self.data_lo, self.data_hi)
        } else {
            self.data_lo as u64
        }
    }

    /// Replace the stored value
    pub fn set_value(&mut self, value: u64) {
        self.data_lo = lo(value);
        if self.flags().contains(StoreFlags::QWORD) {
            self.data_hi = hi(value);
        }
    }

    /// Modifiers
    pub fn flags(&self) -> StoreFlags {
        StoreFlags::from_bits_truncate(self.flags)
    }
}

// =============================================================================
// ATOMIC
// =============================================================================

/// Atomic memory operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AtomicOp {
    /// Header
    pub header: u32,
    /// `AtomicOpcode`
    pub opcode: u32,
    /// `AtomicFlags`
    pub flags: u32,
    /// Address low
    pub addr_lo: u32,
    /// Address high
    pub addr_hi: u32,
    /// Operand 1 low
    pub operand1_lo: u32,
    /// Operand 1 high
    pub operand1_hi: u32,
    /// Operand 2 low
    pub operand2_lo: u32,
    /// Operand 2 high
    pub operand2_hi: u32,
}

const_assert_eq!(core::mem::size_of::<AtomicOp>(), 36);

impl Packet for AtomicOp {
    const OPCODE: Opcode = Opcode::Atomic;
}

impl AtomicOp {
    fn with_op(addr: GpuAddr, opcode: AtomicOpcode) -> Self {
        Self {
            header: Self::header(),
            opcode: opcode as u32,
            flags: 0,
            addr_lo: addr.lo(),
            addr_hi: addr.hi(),
            operand1_lo: 0,
            operand1_hi: 0,
            operand2_lo: 0,
            operand2_hi: 0,
        }
    }

    /// Atomic increment
    pub fn increment(addr: GpuAddr) -> Self {
        Self::with_op(addr, AtomicOpcode::Increment)
    }

    /// Atomic decrement
    pub fn decrement(addr: GpuAddr) -> Self {
        Self::with_op(addr, AtomicOpcode::Decrement)
    }

    /// Write `write` when memory equals `compare`
    pub fn compare_write(addr: GpuAddr, compare: u64, write: u64) -> Self {
        let mut op = Self::with_op(addr, AtomicOpcode::CompareWrite);
        op.flags |= AtomicFlags::INLINE_DATA.bits();
        op.operand1_lo = lo(compare);
        op.operand1_hi = hi(compare);
        op.operand2_lo = lo(write);
        op.operand2_hi = hi(write);
        op
    }

    /// 64-bit operation
    pub fn qword(mut self) -> Self {
        self.flags |= AtomicFlags::QWORD.bits();
        self
    }

    /// Target address
    pub fn addr(&self) -> GpuAddr {
        GpuAddr::from_parts(self.addr_lo, self.addr_hi)
    }

    /// Operation
    pub fn op(&self) -> Option<AtomicOpcode> {
        AtomicOpcode::from_raw(self.opcode)
    }

    /// First operand
    pub fn operand1(&self) -> u64 {
        join(self.operand1_lo, self.operand1_hi)
    }

    /// Second operand
    pub fn operand2(&self) -> u64 {
        join(self.operand2_lo, self.operand2_hi)
    }

    /// Modifiers
    pub fn flags(&self) -> AtomicFlags {
        AtomicFlags::from_bits_truncate(self.flags)
    }
}

// =============================================================================
// REGISTER LOADS
// =============================================================================

/// Load an immediate dword into a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LoadRegisterImm {
    /// Header
    pub header: u32,
    /// Register offset
    pub register: u32,
    /// Value
    pub data: u32,
}

const_assert_eq!(core::mem::size_of::<LoadRegisterImm>(), 12);

impl Packet for LoadRegisterImm {
    const OPCODE: Opcode = Opcode::LoadRegisterImm;
}

impl LoadRegisterImm {
    /// Load `data` into `register`
    pub fn new(register: u32, data: u32) -> Self {
        Self {
            header: Self::header(),
            register,
            data,
        }
    }
}

/// Copy one register into another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LoadRegisterReg {
    /// Header
    pub header: u32,
    /// Source register
    pub source: u32,
    /// Destination register
    pub destination: u32,
}

const_assert_eq!(core::mem::size_of::<LoadRegisterReg>(), 12);

impl Packet for LoadRegisterReg {
    const OPCODE: Opcode = Opcode::LoadRegisterReg;
}

impl LoadRegisterReg {
    /// Copy `source` into `destination`
    pub fn new(source: u32, destination: u32) -> Self {
        Self {
            header: Self::header(),
            source,
            destination,
        }
    }
}

// =============================================================================
// CONTROL FLOW
// =============================================================================

/// Branch taken when a memory comparison holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ConditionalBranch {
    /// Header
    pub header: u32,
    /// `CompareOp`
    pub compare: u32,
    /// `BranchFlags`
    pub flags: u32,
    /// Compared address low
    pub addr_lo: u32,
    /// Compared address high
    pub addr_hi: u32,
    /// Compared value low
    pub data_lo: u32,
    /// Compared value high
    pub data_hi: u32,
    /// Branch target low
    pub target_lo: u32,
    /// Branch target high
    pub target_hi: u32,
}

const_assert_eq!(core::mem::size_of::<ConditionalBranch>(), 36);

impl Packet for ConditionalBranch {
    const OPCODE: Opcode = Opcode::ConditionalBranch;
}

impl ConditionalBranch {
    /// Branch to `target` when `compare(memory[addr], value)` holds
    pub fn new(addr: GpuAddr, value: u64, compare: CompareOp, target: GpuAddr) -> Self {
        Self {
            header: Self::header(),
            compare: compare as u32,
            flags: 0,
            addr_lo: addr.lo(),
            addr_hi: addr.hi(),
            data_lo: lo(value),
            data_hi: hi(value),
            target_lo: target.lo(),
            target_hi: target.hi(),
        }
    }

    /// Compare 64 bits
    pub fn qword(mut self) -> Self {
        self.flags |= BranchFlags::QWORD.bits();
        self
    }

    /// Jump to the address held in the GPR0 pair
    pub fn indirect_target(mut self) -> Self {
        self.flags |= BranchFlags::INDIRECT_TARGET.bits();
        self.target_lo = 0;
        self.target_hi = 0;
        self
    }

    /// Compared address
    pub fn addr(&self) -> GpuAddr {
        GpuAddr::from_parts(self.addr_lo, self.addr_hi)
    }

    /// Compared value
    pub fn value(&self) -> u64 {
        if self.flags().contains(BranchFlags::QWORD) {
            join(self.data_lo, self.data_hi)
        } else {
            self.data_lo as u64
        }
    }

    /// Replace the compared value
    pub fn set_value(&mut self, value: u64) {
        self.data_lo = lo(value);
        self.data_hi = hi(value);
    }

    /// Branch target
    pub fn target(&self) -> GpuAddr {
        GpuAddr::from_parts(self.target_lo, self.target_hi)
    }

    /// Replace the branch target
    pub fn set_target(&mut self, target: GpuAddr) {
        self.target_lo = target.lo();
        self.target_hi = target.hi();
    }

    /// Comparison
    pub fn compare_op(&self) -> Option<CompareOp> {
        CompareOp::from_raw(self.compare)
    }

    /// Modifiers
    pub fn flags(&self) -> BranchFlags {
        BranchFlags::from_bits_truncate(self.flags)
    }
}

/// Unconditional branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Branch {
    /// Header
    pub header: u32,
    /// `BranchFlags`
    pub flags: u32,
    /// Target low
    pub target_lo: u32,
    /// Target high
    pub target_hi: u32,
}

const_assert_eq!(core::mem::size_of::<Branch>(), 16);

impl Packet for Branch {
    const OPCODE: Opcode = Opcode::Branch;
}

impl Branch {
    /// Branch to `target`
    pub fn new(target: GpuAddr) -> Self {
        Self {
            header: Self::header(),
            flags: 0,
            target_lo: target.lo(),
            target_hi: target.hi(),
        }
    }

    /// Branch target
    pub fn target(&self) -> GpuAddr {
        GpuAddr::from_parts(self.target_lo, self.target_hi)
    }

    /// Replace the branch target
    pub fn set_target(&mut self, target: GpuAddr) {
        self.target_lo = target.lo();
        self.target_hi = target.hi();
    }
}

// =============================================================================
// PAYLOAD COMMANDS
// =============================================================================

/// Compute walker with an optional inline completion write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Dispatch {
    /// Header
    pub header: u32,
    /// Kernel identifier
    pub kernel_id: u32,
    /// Thread group counts
    pub groups: [u32; 3],
    /// `PostSyncOp`
    pub post_sync_op: u32,
    /// `StoreFlags` of the completion write
    pub post_sync_flags: u32,
    /// Completion address low
    pub addr_lo: u32,
    /// Completion address high
    pub addr_hi: u32,
    /// Completion value low
    pub data_lo: u32,
    /// Completion value high
    pub data_hi: u32,
}

const_assert_eq!(core::mem::size_of::<Dispatch>(), 44);

impl Packet for Dispatch {
    const OPCODE: Opcode = Opcode::Dispatch;
}

impl Dispatch {
    /// Walker without a completion write
    pub fn new(kernel_id: u32, groups: [u32; 3]) -> Self {
        Self {
            header: Self::header(),
            kernel_id,
            groups,
            post_sync_op: PostSyncOp::None as u32,
            post_sync_flags: 0,
            addr_lo: 0,
            addr_hi: 0,
            data_lo: 0,
            data_hi: 0,
        }
    }

    /// Attach an immediate completion write
    pub fn with_post_sync(mut self, addr: GpuAddr, value: u64, flags: StoreFlags) -> Self {
        self.post_sync_op = PostSyncOp::WriteImmediate as u32;
        self.post_sync_flags = flags.bits();
        self.addr_lo = addr.lo();
        self.addr_hi = addr.hi();
        self.data_lo = lo(value);
        self.data_hi = hi(value);
        self
    }

    /// Completion operation
    pub fn post_sync(&self) -> PostSyncOp {
        match self.post_sync_op {
            1 => PostSyncOp::WriteImmediate,
            2 => PostSyncOp::WriteTimestamp,
            _ => PostSyncOp::None,
        }
    }

    /// Completion address
    pub fn post_sync_addr(&self) -> GpuAddr {
        GpuAddr::from_parts(self.addr_lo, self.addr_hi)
    }

    /// Completion value
    pub fn post_sync_value(&self) -> u64 {
        join(self.data_lo, self.data_hi)
    }

    /// Completion write modifiers
    pub fn post_sync_flags(&self) -> StoreFlags {
        StoreFlags::from_bits_truncate(self.post_sync_flags)
    }

    /// Replace the completion value of an immediate completion write
    pub fn set_post_sync_value(&mut self, value: u64) -> Result<()> {
        if self.post_sync() != PostSyncOp::WriteImmediate {
            return Err(Error::InvalidCommand);
        }
        self.data_lo = lo(value);
        self.data_hi = hi(value);
        Ok(())
    }
}

/// Cache flush / pipeline stall without a completion write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Flush {
    /// Header
    pub header: u32,
    /// `FlushFlags`
    pub flags: u32,
}

const_assert_eq!(core::mem::size_of::<Flush>(), 8);

impl Packet for Flush {
    const OPCODE: Opcode = Opcode::Flush;
}

impl Flush {
    /// Flush with the given modifiers
    pub fn new(flags: FlushFlags) -> Self {
        Self {
            header: Self::header(),
            flags: flags.bits(),
        }
    }

    /// Modifiers
    pub fn flags(&self) -> FlushFlags {
        FlushFlags::from_bits_truncate(self.flags)
    }
}

/// Copy-engine linear copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MemCopy {
    /// Header
    pub header: u32,
    /// Source low
    pub src_lo: u32,
    /// Source high
    pub src_hi: u32,
    /// Destination low
    pub dst_lo: u32,
    /// Destination high
    pub dst_hi: u32,
    /// Size low
    pub size_lo: u32,
    /// Size high
    pub size_hi: u32,
}

const_assert_eq!(core::mem::size_of::<MemCopy>(), 28);

impl Packet for MemCopy {
    const OPCODE: Opcode = Opcode::MemCopy;
}

impl MemCopy {
    /// Copy `size` bytes
    pub fn new(src: GpuAddr, dst: GpuAddr, size: u64) -> Self {
        Self {
            header: Self::header(),
            src_lo: src.lo(),
            src_hi: src.hi(),
            dst_lo: dst.lo(),
            dst_hi: dst.hi(),
            size_lo: lo(size),
            size_hi: hi(size),
        }
    }

    /// Source
    pub fn src(&self) -> GpuAddr {
        GpuAddr::from_parts(self.src_lo, self.src_hi)
    }

    /// Destination
    pub fn dst(&self) -> GpuAddr {
        GpuAddr::from_parts(self.dst_lo, self.dst_hi)
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        join(self.size_lo, self.size_hi)
    }
}

/// Copy-engine fill with a 32-bit pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MemFill {
    /// Header
    pub header: u32,
    /// Destination low
    pub dst_lo: u32,
    /// Destination high
    pub dst_hi: u32,
    /// Size low
    pub size_lo: u32,
    /// Size high
    pub size_hi: u32,
    /// Fill pattern
    pub pattern: u32,
}

const_assert_eq!(core::mem::size_of::<MemFill>(), 24);

impl Packet for MemFill {
    const OPCODE: Opcode = Opcode::MemFill;
}

impl MemFill {
    /// Fill `size` bytes with `pattern`
    pub fn new(dst: GpuAddr, size: u64, pattern: u32) -> Self {
        Self {
            header: Self::header(),
            dst_lo: dst.lo(),
            dst_hi: dst.hi(),
            size_lo: lo(size),
            size_hi: hi(size),
            pattern,
        }
    }

    /// Destination
    pub fn dst(&self) -> GpuAddr {
        GpuAddr::from_parts(self.dst_lo, self.dst_hi)
    }
}

/// Store the GPU timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Timestamp {
    /// Header
    pub header: u32,
    /// Destination low
    pub addr_lo: u32,
    /// Destination high
    pub addr_hi: u32,
}

const_assert_eq!(core::mem::size_of::<Timestamp>(), 12);

impl Packet for Timestamp {
    const OPCODE: Opcode = Opcode::Timestamp;
}

impl Timestamp {
    /// Write the timestamp to `addr`
    pub fn new(addr: GpuAddr) -> Self {
        Self {
            header: Self::header(),
            addr_lo: addr.lo(),
            addr_hi: addr.hi(),
        }
    }

    /// Destination
    pub fn addr(&self) -> GpuAddr {
        GpuAddr::from_parts(self.addr_lo, self.addr_hi)
    }
}

/// No operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Noop {
    /// Header
    pub header: u32,
}

impl Packet for Noop {
    const OPCODE: Opcode = Opcode::Noop;
}

impl Noop {
    /// A single-dword no-op
    pub fn new() -> Self {
        Self {
            header: Self::header(),
        }
    }
}

impl Default for Noop {
    fn default() -> Self {
        Self::new()
    }
}
