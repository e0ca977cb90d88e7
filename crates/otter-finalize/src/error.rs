//! Finalization and debug allocation errors

use thiserror::Error;

/// Errors surfaced to callers of the finalization and debug allocation APIs.
///
/// Programmer errors that would otherwise risk silent corruption (null or
/// misaligned link cells, links outside the heap) panic instead of
/// producing one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GcError {
    /// Allocation of a required registry entry failed, even after the
    /// out-of-memory hook had a chance to release memory
    #[error("Out of memory")]
    OutOfMemory,

    /// The pointer does not belong to any heap object
    #[error("Invalid pointer: {0:#x}")]
    InvalidPointer(usize),

    /// The object was already released through the debug allocator
    #[error("Object at {0:#x} was already deallocated")]
    DoubleFree(usize),

    /// The pointer is a heap object but carries no debug header
    #[error("Object at {0:#x} has no debugging info")]
    MissingDebugInfo(usize),
}

/// Result type for finalization and debug allocation operations
pub type GcResult<T> = std::result::Result<T, GcError>;
