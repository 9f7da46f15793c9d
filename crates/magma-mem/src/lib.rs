//! # MAGMA Memory Management
//!
//! Memory plumbing for the in-order execution core.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 CounterStorageAllocator                     │
//! │        device TagPool            host TagPool (optional)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      TagPool                                │
//! │   page ─► [tag][tag][tag]...   free list of TagNodes        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   PageAllocator                             │
//! │   SysmemAllocator │ external allocator (driver supplied)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Counter storage is carved from whole pages and recycled through free
//! lists; tags are returned to their pool, never unmapped individually.

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

pub mod allocator;
pub mod counter;
pub mod mapping;
pub mod tag;

pub use allocator::{AllocDesc, AllocFlags, AllocatorStats, Allocation, PageAllocator, SysmemAllocator};
pub use counter::{
    CounterStorageAllocator, CounterStorageConfig, CounterTag, COUNTER_SLOT_SIZE,
    OVERFLOW_SLOT_OFFSET, PARTITION_STRIDE,
};
pub use mapping::CpuMapping;
pub use tag::{TagNode, TagPool, TagPoolStats};
