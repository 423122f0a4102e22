/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Chunk pool errors
///
/// Running out of system memory is the only fatal condition in the crate.
/// Read-side "nothing yet" and "raced, retry" outcomes are plain `bool`s.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum PoolError {
    #[error("System allocator refused a chunk of {slots} slots ({bytes} bytes)")]
    #[diagnostic(
        code(pool::allocation_failed),
        help("The process is out of memory. Prewarm the pool earlier or lower its growth.")
    )]
    AllocationFailed { slots: usize, bytes: usize },

    #[error("Pool already owns the maximum of {limit} chunks")]
    #[diagnostic(
        code(pool::chunk_limit),
        help("Release pooled objects or raise the initial chunk size so fewer chunks are needed.")
    )]
    ChunkLimit { limit: usize },

    #[error("Chunk layout for {slots} slots overflows the address space")]
    #[diagnostic(
        code(pool::layout_overflow),
        help("The pooled type is too large for the requested chunk size.")
    )]
    LayoutOverflow { slots: usize },
}

impl PoolError {
    /// True when retrying later could succeed (memory may be freed elsewhere)
    pub fn is_transient(&self) -> bool {
        matches!(self, PoolError::AllocationFailed { .. })
    }
}
