/*!
 * Limits and Constants
 *
 * Centralized location for the bit widths, growth parameters, and spin
 * thresholds shared by the lock-free primitives and the chunk pool.
 *
 * - Performance-critical constants are marked with [PERF]
 * - Constants that define an encoding are marked with [LAYOUT]
 */

// =============================================================================
// FREE LIST / SLOT INDEX ENCODING
// =============================================================================

/// Sentinel index for an empty stack head or the end of a link chain
/// [LAYOUT] Never a valid slot index
pub const NIL_INDEX: u32 = u32::MAX;

/// Bits of a pool slot index used for the offset inside its chunk
/// [LAYOUT] Low 24 bits of the index
pub const CHUNK_OFFSET_BITS: u32 = 24;

/// Mask extracting the in-chunk offset from a pool slot index
pub const CHUNK_OFFSET_MASK: u32 = (1 << CHUNK_OFFSET_BITS) - 1;

/// Maximum number of chunks a single pool may own
/// [LAYOUT] Chunk id occupies the top 8 bits of the slot index
pub const MAX_POOL_CHUNKS: usize = 1 << (32 - CHUNK_OFFSET_BITS);

/// Maximum slots carved from one chunk
/// The last offset of the last chunk would collide with NIL_INDEX, so the
/// final chunk is one slot short of this when it reaches the cap.
pub const MAX_CHUNK_SLOTS: usize = 1 << CHUNK_OFFSET_BITS;

// =============================================================================
// CHUNK POOL GROWTH
// =============================================================================

/// Slots in the first chunk a pool allocates
pub const INITIAL_CHUNK_SLOTS: usize = 2;

// =============================================================================
// READ RETRY / SPIN
// =============================================================================

/// Busy spins before a blocked reader starts yielding its time slice
/// [PERF] Seqlock writes are short; most retries succeed within a few spins
pub const DEFAULT_SPINS_BEFORE_YIELD: u32 = 64;

/// Cap on the exponential backoff shift (2^6 = 64 spin hints per step)
pub const DEFAULT_MAX_BACKOFF_SHIFT: u32 = 6;

// =============================================================================
// CACHE
// =============================================================================

/// Cache line size assumed for padding shared atomics
/// [PERF] Keeps the writer-owned and reader-owned words on separate lines
///
/// `repr(align)` only takes a literal, so the padded types spell out
/// `align(64)` and each carries a compile-time check against this value.
pub const CACHE_LINE_SIZE: usize = 64;
