/*!
 * Core Types
 * Index and packed-word types shared by the lock-free structures
 */

use super::limits::{CHUNK_OFFSET_BITS, CHUNK_OFFSET_MASK, NIL_INDEX};
use std::fmt;
use super::sync::atomic::AtomicU32;

/// Index of a node in a [`LinkTable`]
pub type SlotIndex = u32;

/// Generation counter riding along with a stack head
pub type Tag = u32;

/// Side table of "next" links for nodes threaded onto a free list
///
/// Each node owns one atomic link, addressed by its [`SlotIndex`]. The link
/// is only meaningful while the node sits on a stack; whoever holds the node
/// otherwise may ignore it. Links must stay addressable for as long as any
/// stack may still hand out their index.
pub trait LinkTable {
    /// Link cell of the node at `index`
    fn link(&self, index: SlotIndex) -> &AtomicU32;
}

impl LinkTable for [AtomicU32] {
    #[inline(always)]
    fn link(&self, index: SlotIndex) -> &AtomicU32 {
        &self[index as usize]
    }
}

impl LinkTable for Vec<AtomicU32> {
    #[inline(always)]
    fn link(&self, index: SlotIndex) -> &AtomicU32 {
        &self[index as usize]
    }
}

/// Stack head packed into one 64-bit word: index in the low half, tag in the high half
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Tagged(u64);

impl Tagged {
    /// Empty head with a zero tag
    pub const EMPTY: Self = Self::new(NIL_INDEX, 0);

    #[inline(always)]
    pub const fn new(index: SlotIndex, tag: Tag) -> Self {
        Self(((tag as u64) << 32) | index as u64)
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn index(self) -> SlotIndex {
        self.0 as u32
    }

    #[inline(always)]
    pub const fn tag(self) -> Tag {
        (self.0 >> 32) as u32
    }

    #[inline(always)]
    pub const fn is_nil(self) -> bool {
        self.index() == NIL_INDEX
    }

    /// Same tag lineage, new index, next generation
    #[inline(always)]
    pub const fn advance(self, index: SlotIndex) -> Self {
        Self::new(index, self.tag().wrapping_add(1))
    }
}

impl fmt::Debug for Tagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "Tagged(nil, tag={})", self.tag())
        } else {
            write!(f, "Tagged({}, tag={})", self.index(), self.tag())
        }
    }
}

/// Pool slot index split into chunk id and offset within the chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSlot {
    pub chunk: usize,
    pub offset: usize,
}

impl ChunkSlot {
    #[inline(always)]
    pub const fn new(chunk: usize, offset: usize) -> Self {
        Self { chunk, offset }
    }

    #[inline(always)]
    pub const fn from_index(index: SlotIndex) -> Self {
        Self {
            chunk: (index >> CHUNK_OFFSET_BITS) as usize,
            offset: (index & CHUNK_OFFSET_MASK) as usize,
        }
    }

    #[inline(always)]
    pub const fn index(self) -> SlotIndex {
        ((self.chunk as u32) << CHUNK_OFFSET_BITS) | (self.offset as u32 & CHUNK_OFFSET_MASK)
    }
}
