/*!
 * Memory Module
 * Lock-free pooled storage for fixed-type objects
 */

pub mod pool;
pub mod types;

// Re-export for convenience
pub use pool::{ChunkPool, PoolBox};
pub use types::*;
