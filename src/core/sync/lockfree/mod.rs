/*!
 * Lock-Free Synchronization Primitives
 *
 * Single-producer exchange buffers and the free list under the chunk pool:
 * - Tagged stack: ABA-safe Treiber stack of node indices
 * - Double buffer: latest-value mailbox with scoped and movable read handles
 * - Optimistic buffer: seqlock pages for `Copy` values, readers retry
 */

mod double_buffer;
mod optimistic;
mod tagged_stack;


// Re-export public API
pub use double_buffer::{DoubleBuffer, ReadGuard, ReadLock, Reader, WriteGuard, Writer};
pub use optimistic::{OptimisticBuffer, OptimisticReader, OptimisticWriter};
pub use tagged_stack::TaggedStack;
