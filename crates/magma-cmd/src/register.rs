//! # Engine Registers
//!
//! MMIO offsets of the command-streamer general purpose registers.
//!
//! Each GPR is 64 bits wide and addressed as two dwords.

/// Base of the command-streamer GPR file
pub const CS_GPR_BASE: u32 = 0x2600;

/// GPR0 low dword
pub const CS_GPR_R0: u32 = cs_gpr(0);

/// GPR4 low dword
pub const CS_GPR_R4: u32 = cs_gpr(4);

/// Offset of GPR `index`
#[inline]
pub const fn cs_gpr(index: u32) -> u32 {
    CS_GPR_BASE + index * 8
}

/// High dword of the register at `register`
#[inline]
pub const fn high_dword(register: u32) -> u32 {
    register + 4
}
