//! Errors reported by the executable memory allocator.

use thiserror::Error;

/// Recoverable allocator failures.
///
/// Pool exhaustion is deliberately absent: a soft allocation failure is an
/// empty result, and a hard one is fatal.
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// The operating system refused the up-front virtual memory reservation.
    #[error("failed to reserve {size} bytes of virtual memory: {source}")]
    Reservation {
        /// Requested reservation size including guard pages
        size: usize,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Backing pages could not be committed.
    #[error("failed to commit {len} bytes at pool offset {offset:#x}: {source}")]
    Commit {
        /// Offset of the first page inside the pool
        offset: usize,
        /// Number of bytes
        len: usize,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Pages could not be returned to the operating system.
    #[error("failed to decommit {len} bytes at pool offset {offset:#x}: {source}")]
    Decommit {
        /// Offset of the first page inside the pool
        offset: usize,
        /// Number of bytes
        len: usize,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// The configured pool cannot hold even one allocation.
    #[error("pool size {0} is smaller than one allocation granule")]
    PoolTooSmall(usize),

    /// A write or read fell outside the bounds of a handle.
    #[error("access of {len} bytes at offset {offset} exceeds handle size {size}")]
    OutOfBounds {
        /// Offset inside the handle
        offset: usize,
        /// Access length
        len: usize,
        /// Size of the handle
        size: usize,
    },
}
