//! # MAGMA Core
//!
//! Foundational types shared by the in-order execution stack.
//!
//! This crate provides the pieces every other layer agrees on: the unified
//! error type, strongly typed GPU addresses and sizes, resource handles, the
//! explicit configuration of the in-order machinery and the clock seam used
//! by host-side polling.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      magma-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Error     │  │   Types     │  │  Config / Clock     │  │
//! │  │  (Result)   │  │ (GpuAddr,   │  │ (InOrderConfig,     │  │
//! │  │             │  │  ByteSize)  │  │  ClockSource)       │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use clock::{ClockSource, StepClock};
pub use config::{InOrderConfig, SyncDispatchMode};
pub use error::{Error, Result};
pub use types::*;

#[cfg(feature = "std")]
pub use clock::StdClock;
