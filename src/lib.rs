/*!
 * Ash Sync Library
 *
 * Lock-free building blocks for handing data from one producer thread to its
 * consumers, and for recycling fixed-type objects without the system
 * allocator on the hot path.
 *
 * - [`DoubleBuffer`]: latest-value mailbox, any `T`
 * - [`OptimisticBuffer`]: seqlock pages for `Copy` values
 * - [`TaggedStack`]: ABA-safe index free list
 * - [`ChunkPool`]: growing object pool built on the free list
 */

pub mod core;
pub mod memory;
pub mod monitoring;

// Re-exports
pub use crate::core::errors::{PoolError, PoolResult};
pub use crate::core::sync::{
    DoubleBuffer, OptimisticBuffer, OptimisticReader, OptimisticWriter, ReadGuard, ReadLock,
    Reader, SpinConfig, TaggedStack, WriteGuard, Writer,
};
pub use memory::{ChunkPool, PoolBox, PoolConfig, PoolStats};
pub use monitoring::init_tracing;
