/*!
 * Tagged Free List
 *
 * Lock-free LIFO stack of node indices (Treiber stack) used as the
 * allocation substrate for object pooling.
 *
 * # ABA Safety
 *
 * The head is a single 64-bit word packing the top index with a generation
 * tag. Every successful head update bumps the tag, so a node that is popped,
 * reused, and pushed back at the same index can never satisfy a stale
 * compare-and-swap: the index matches but the tag does not.
 *
 * # Links
 *
 * Nodes do not embed a next pointer. Each node's link lives in a
 * [`LinkTable`] side table owned by whoever owns the nodes. Links are
 * atomics, so a popper that loses a race and reads a link the winner is
 * rewriting observes a stale index, never a torn one, and the tag check
 * rejects it.
 *
 * # Progress
 *
 * Lock-free, not wait-free: a failed compare-and-swap means another thread's
 * push or pop succeeded. Pop order is LIFO among non-concurrent operations;
 * under contention the last successful CAS wins.
 */

use crate::core::limits::{CACHE_LINE_SIZE, NIL_INDEX};
use crate::core::sync::atomic::{AtomicU64, Ordering};
use crate::core::types::{LinkTable, SlotIndex, Tag, Tagged};
use std::fmt;

/// Lock-free ABA-safe stack of node indices
///
/// Cache-line aligned so the contended head never shares a line with its
/// neighbours.
///
/// # Invariants
///
/// A node is on at most one stack at a time. Pushing an index that is already
/// linked corrupts the list (nodes may be lost or handed out twice), but never
/// memory: links are atomics and the caller guarantees the link table outlives
/// every index it hands to the stack.
#[repr(C, align(64))]
pub struct TaggedStack {
    head: AtomicU64,
}

const _: () = assert!(std::mem::align_of::<TaggedStack>() == CACHE_LINE_SIZE);

impl TaggedStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(Tagged::EMPTY.into_raw()),
        }
    }

    /// Push `index` onto the stack
    ///
    /// Writes the current head into the node's link and swings the head to the
    /// node with a fresh tag, retrying until the CAS wins. The release on
    /// success publishes the link (and anything the caller wrote into the node
    /// beforehand) to the thread that pops it.
    #[inline]
    pub fn push<L>(&self, links: &L, index: SlotIndex)
    where
        L: LinkTable + ?Sized,
    {
        debug_assert_ne!(index, NIL_INDEX, "nil index cannot be pushed");

        let link = links.link(index);
        let mut head = Tagged::from_raw(self.head.load(Ordering::Relaxed));
        loop {
            link.store(head.index(), Ordering::Relaxed);
            let next = head.advance(index);
            match self.head.compare_exchange_weak(
                head.into_raw(),
                next.into_raw(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = Tagged::from_raw(actual),
            }
        }
    }

    /// Pop the top index, or `None` if the stack was observed empty
    #[inline]
    pub fn try_pop<L>(&self, links: &L) -> Option<SlotIndex>
    where
        L: LinkTable + ?Sized,
    {
        let mut head = Tagged::from_raw(self.head.load(Ordering::Acquire));
        while !head.is_nil() {
            let next = links.link(head.index()).load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head.into_raw(),
                head.advance(next).into_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head.index()),
                Err(actual) => head = Tagged::from_raw(actual),
            }
        }
        None
    }

    /// Snapshot emptiness check; may be stale by the time it returns
    #[inline]
    pub fn is_empty(&self) -> bool {
        Tagged::from_raw(self.head.load(Ordering::Acquire)).is_nil()
    }

    /// Current head generation (diagnostics)
    #[inline]
    pub fn tag(&self) -> Tag {
        Tagged::from_raw(self.head.load(Ordering::Relaxed)).tag()
    }
}

impl Default for TaggedStack {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaggedStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedStack")
            .field("head", &Tagged::from_raw(self.head.load(Ordering::Relaxed)))
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::thread;

    fn links(n: usize) -> Vec<AtomicU32> {
        (0..n).map(|_| AtomicU32::new(NIL_INDEX)).collect()
    }

    #[test]
    fn test_empty_pop() {
        let stack = TaggedStack::new();
        let table = links(1);
        assert!(stack.is_empty());
        assert_eq!(stack.try_pop(&table), None);
    }

    #[test]
    fn test_lifo_order() {
        let stack = TaggedStack::new();
        let table = links(3);
        stack.push(&table, 0);
        stack.push(&table, 1);
        stack.push(&table, 2);

        assert_eq!(stack.try_pop(&table), Some(2));
        assert_eq!(stack.try_pop(&table), Some(1));
        assert_eq!(stack.try_pop(&table), Some(0));
        assert_eq!(stack.try_pop(&table), None);
    }

    #[test]
    fn test_every_update_bumps_tag() {
        let stack = TaggedStack::new();
        let table = links(1);
        let before = stack.tag();

        stack.push(&table, 0);
        stack.try_pop(&table);
        stack.push(&table, 0);

        // Same head index as after the first push, but a different generation
        assert_eq!(stack.tag(), before.wrapping_add(3));
    }

    #[test]
    fn test_stale_head_rejected() {
        // Replays the ABA interleaving by hand: a popper snapshots (0 -> 1),
        // then node 0 is popped, node 1 popped, and node 0 pushed back.
        let stack = TaggedStack::new();
        let table = links(2);
        stack.push(&table, 1);
        stack.push(&table, 0);

        let stale = Tagged::from_raw(stack.head.load(Ordering::Acquire));
        assert_eq!(stale.index(), 0);

        assert_eq!(stack.try_pop(&table), Some(0));
        assert_eq!(stack.try_pop(&table), Some(1));
        stack.push(&table, 0);

        let current = Tagged::from_raw(stack.head.load(Ordering::Acquire));
        assert_eq!(current.index(), stale.index());
        assert_ne!(current, stale);
        assert!(stack
            .head
            .compare_exchange(
                stale.into_raw(),
                stale.advance(1).into_raw(),
                Ordering::AcqRel,
                Ordering::Acquire
            )
            .is_err());
    }

    #[test]
    fn test_concurrent_push_pop_no_loss() {
        const THREADS: u32 = 8;
        const PER_THREAD: u32 = 1_000;

        let stack = Arc::new(TaggedStack::new());
        let table = Arc::new(links((THREADS * PER_THREAD) as usize));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let stack = stack.clone();
                let table = table.clone();
                thread::spawn(move || {
                    let mut popped = Vec::new();
                    for i in 0..PER_THREAD {
                        stack.push(&*table, t * PER_THREAD + i);
                        if i % 3 == 0 {
                            if let Some(idx) = stack.try_pop(&*table) {
                                popped.push(idx);
                            }
                        }
                    }
                    popped
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for idx in handle.join().unwrap() {
                assert!(seen.insert(idx), "index {} popped twice", idx);
            }
        }
        while let Some(idx) = stack.try_pop(&*table) {
            assert!(seen.insert(idx), "index {} popped twice", idx);
        }

        assert_eq!(seen.len(), (THREADS * PER_THREAD) as usize);
    }
}
