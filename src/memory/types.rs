/*!
 * Memory Types
 * Configuration and statistics for chunk pools
 */

use crate::core::limits::{INITIAL_CHUNK_SLOTS, MAX_CHUNK_SLOTS};
use serde::{Deserialize, Serialize};

/// Chunk growth configuration
///
/// Each new chunk holds `c + ceil((c + 1) / 2)` slots where `c` is the size of
/// the previous one, capped at `max_chunk_slots`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Slots in the first chunk
    pub initial_chunk_slots: usize,
    /// Upper bound on slots per chunk
    pub max_chunk_slots: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_chunk_slots: INITIAL_CHUNK_SLOTS,
            max_chunk_slots: MAX_CHUNK_SLOTS,
        }
    }
}

impl PoolConfig {
    /// Start with `slots` per chunk and keep the default growth cap
    pub fn with_initial_slots(slots: usize) -> Self {
        Self {
            initial_chunk_slots: slots,
            ..Self::default()
        }
    }

    /// Clamp both bounds into `[1, MAX_CHUNK_SLOTS]` with
    /// `initial <= max`
    pub fn normalized(self) -> Self {
        let max_chunk_slots = self.max_chunk_slots.clamp(1, MAX_CHUNK_SLOTS);
        Self {
            initial_chunk_slots: self.initial_chunk_slots.clamp(1, max_chunk_slots),
            max_chunk_slots,
        }
    }

    /// Size of the chunk after one of `current` slots
    #[inline]
    pub fn grow(&self, current: usize) -> usize {
        current
            .saturating_add((current + 2) / 2)
            .min(self.max_chunk_slots)
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Chunks obtained from the system allocator
    pub chunks: usize,
    /// Total slots across all chunks, free or in use
    pub capacity: usize,
    /// Slot count the next chunk will get
    pub next_chunk_slots: usize,
}
