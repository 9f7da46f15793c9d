//! # MAGMA Command Encoding
//!
//! Command packets for the compute and copy engines, the stream encoder
//! that records them and the decoder that reads them back.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   emit    ┌──────────────────┐   decode   ┌───────────┐
//! │  Packet     │ ────────► │  CommandStream   │ ─────────► │  Command  │
//! │ (Pod types) │           │  (dwords + base) │            │  (enum)   │
//! └─────────────┘ ◄──────── └──────────────────┘            └───────────┘
//!                  patch in place
//! ```
//!
//! Every packet starts with a header dword holding its opcode in the top
//! byte and its length in dwords in the low byte. Packets are plain `Pod`
//! structs, so already-recorded commands can be rewritten in place.

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

pub mod decode;
pub mod packet;
pub mod register;
pub mod stream;

pub use decode::{decode, Command, DecodedCommand};
pub use packet::*;
pub use stream::CommandStream;
