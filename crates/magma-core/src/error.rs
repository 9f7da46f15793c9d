//! # MAGMA Error Handling
//!
//! Error types for the in-order execution stack.
//!
//! Error handling in MAGMA follows these principles:
//! - Errors are typed and categorized
//! - No panics in production code paths
//! - Usage errors are reported before any state is mutated
//! - Errors are `no_std` compatible
//!
//! A host wait that has not completed yet is not an error; it is reported
//! as a status value by the synchronization layer.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// MAGMA Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// MAGMA unified error type
///
/// Errors are categorized by subsystem for easier debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid argument provided by the caller
    InvalidArgument,
    /// Feature combination is not supported
    UnsupportedFeature,
    /// Object is in the wrong state for the operation
    InvalidState,
    /// Resource not found
    NotFound,
    /// Operation timed out
    Timeout,

    // =========================================================================
    // Hardware Errors
    // =========================================================================
    /// Device lost (hang detected or reset)
    DeviceLost,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of memory
    OutOfMemory,
    /// Allocation failed
    AllocationFailed,
    /// Address not aligned
    MisalignedAddress,
    /// Access outside of a mapping
    OutOfBounds,
    /// Allocation has no CPU mapping
    NotMapped,

    // =========================================================================
    // Command Errors
    // =========================================================================
    /// Command buffer full
    CommandBufferFull,
    /// Command does not match the expected layout
    InvalidCommand,
    /// Command stream ends inside a packet
    TruncatedCommand,
    /// Submission layer rejected the batch
    SubmissionFailed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::UnsupportedFeature => write!(f, "unsupported feature"),
            Self::InvalidState => write!(f, "invalid object state"),
            Self::NotFound => write!(f, "resource not found"),
            Self::Timeout => write!(f, "operation timed out"),

            // Hardware
            Self::DeviceLost => write!(f, "device lost"),

            // Memory
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::AllocationFailed => write!(f, "allocation failed"),
            Self::MisalignedAddress => write!(f, "misaligned address"),
            Self::OutOfBounds => write!(f, "access out of bounds"),
            Self::NotMapped => write!(f, "allocation not CPU mapped"),

            // Command
            Self::CommandBufferFull => write!(f, "command buffer full"),
            Self::InvalidCommand => write!(f, "invalid command"),
            Self::TruncatedCommand => write!(f, "truncated command"),
            Self::SubmissionFailed => write!(f, "submission failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl Error {
    /// Whether the error means the device can no longer make progress
    #[inline]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::DeviceLost)
    }

    /// Whether the error is a caller usage error
    #[inline]
    pub const fn is_usage(self) -> bool {
        matches!(
            self,
            Self::InvalidArgument | Self::UnsupportedFeature | Self::InvalidState
        )
    }
}
