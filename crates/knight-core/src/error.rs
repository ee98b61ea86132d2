//! Error type shared by every allocator in the crate.
//!
//! Failures come from the OS (mapping, protection), the heap (node storage,
//! size overflow) or a layout an allocator cannot serve. Nothing is retried.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KnightError {
    #[error("mapping {size} bytes failed: {source}")]
    Map {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("changing protection of {size} bytes failed: {source}")]
    Protect {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("allocation of {size} bytes cannot be satisfied")]
    Exhausted { size: usize },
    #[error("alignment {align} exceeds the {max}-byte maximum of this allocator")]
    UnsupportedAlignment { align: usize, max: usize },
}

impl KnightError {
    /// Builds a [`KnightError::Map`] from the calling thread's `errno`.
    #[must_use]
    pub fn map_failed(size: usize) -> Self {
        Self::Map {
            size,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Builds a [`KnightError::Protect`] from the calling thread's `errno`.
    #[must_use]
    pub fn protect_failed(size: usize) -> Self {
        Self::Protect {
            size,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KnightError>;
