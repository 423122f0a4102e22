/*!
 * Double Buffer Exchange
 *
 * Single-producer latest-value exchange. The writer publishes into one of two
 * slots; the reader always receives the most recently completed write.
 * Writes made while nobody reads are coalesced: this is a mailbox holding at
 * most the latest value, not a queue.
 *
 * # State Word
 *
 * All coordination lives in one `u32`:
 *
 * ```text
 *   bit 0      active slot (the one the writer targets)
 *   bits 1-2   concurrent users (writer in progress + reader in progress)
 *   bit 3      slot 0 holds a committed, unread value
 *   bit 4      slot 1 holds a committed, unread value
 * ```
 *
 * The active bit only flips while the user count is zero, so a slot can never
 * change role under a writer or reader that is using it. Whoever (writer or
 * reader) leaves a zero-user window with a flip pending performs it with a
 * single CAS and concedes silently if the other side raced in first.
 *
 * # Handles
 *
 * The protocol supports one writer and one reader in flight. [`DoubleBuffer::split`]
 * hands out exactly one [`Writer`] and one [`Reader`]; neither is `Clone` and
 * every operation takes `&mut self`, so the bound is enforced at compile time.
 *
 * # Example
 *
 * ```
 * use ash_sync::core::sync::DoubleBuffer;
 *
 * let (mut writer, mut reader) = DoubleBuffer::<String>::new().split();
 * writer.write("a".to_string());
 * writer.write("b".to_string());
 *
 * let mut out = String::new();
 * assert!(reader.try_read(&mut out));
 * assert_eq!(out, "b");
 * assert!(!reader.try_read(&mut out));
 * ```
 */

use crate::core::limits::CACHE_LINE_SIZE;
use crate::core::sync::atomic::{AtomicU32, Ordering};
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

const ACTIVE_BIT: u32 = 0b1;
const USER_UNIT: u32 = 0b10;
const USER_MASK: u32 = 0b110;
const FULL_SHIFT: u32 = 3;

/// Decoded view of the packed state word
#[derive(Clone, Copy, PartialEq, Eq)]
struct State(u32);

impl State {
    /// Slot the writer targets
    #[inline(always)]
    fn active(self) -> usize {
        (self.0 & ACTIVE_BIT) as usize
    }

    /// Slot the reader consumes
    #[inline(always)]
    fn readable(self) -> usize {
        self.active() ^ 1
    }

    #[inline(always)]
    fn users(self) -> u32 {
        (self.0 & USER_MASK) >> 1
    }

    #[inline(always)]
    fn full_flag(slot: usize) -> u32 {
        1 << (FULL_SHIFT + slot as u32)
    }

    #[inline(always)]
    fn is_full(self, slot: usize) -> bool {
        self.0 & Self::full_flag(slot) != 0
    }

    /// Swap roles and drop any unread value in the slot that becomes active,
    /// so an older value can never be read after a newer one
    #[inline(always)]
    fn flipped(self) -> State {
        State((self.0 ^ ACTIVE_BIT) & !Self::full_flag(self.readable()))
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("active", &self.active())
            .field("users", &self.users())
            .field("full", &[self.is_full(0), self.is_full(1)])
            .finish()
    }
}

#[repr(C, align(64))]
struct PaddedState(AtomicU32);

const _: () = assert!(std::mem::align_of::<PaddedState>() == CACHE_LINE_SIZE);

/// Two-slot latest-value exchange
///
/// Construct it, then [`split`](Self::split) it into its writer and reader.
pub struct DoubleBuffer<T> {
    state: PaddedState,
    slots: [UnsafeCell<T>; 2],
}

// Safety: a slot is only touched by the side holding a user count on it, and
// the active bit cannot flip while any count is held. Values move between the
// writer's and the reader's threads (Send) and the reader hands out `&T`
// through handles that may themselves be shared (Sync).
unsafe impl<T: Send + Sync> Sync for DoubleBuffer<T> {}

impl<T: Default> DoubleBuffer<T> {
    /// Empty buffer; nothing is readable until the first write completes
    pub fn new() -> Self {
        Self::with_values(T::default(), T::default())
    }
}

impl<T: Default> Default for DoubleBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> DoubleBuffer<T> {
    /// Seed both slots with `value`; still nothing readable until a write
    pub fn with_value(value: T) -> Self {
        Self::with_values(value.clone(), value)
    }
}

impl<T> DoubleBuffer<T> {
    /// Seed each slot separately; still nothing readable until a write
    pub fn with_values(first: T, second: T) -> Self {
        Self {
            state: PaddedState(AtomicU32::new(0)),
            slots: [UnsafeCell::new(first), UnsafeCell::new(second)],
        }
    }

    /// Whether the state word is natively lock-free on this target
    pub const fn is_lock_free() -> bool {
        cfg!(target_has_atomic = "32")
    }

    /// Hand out the single writer and the single reader
    pub fn split(self) -> (Writer<T>, Reader<T>) {
        let shared = Arc::new(self);
        (
            Writer {
                shared: Arc::clone(&shared),
            },
            Reader { shared },
        )
    }

    #[inline(always)]
    fn load(&self) -> State {
        State(self.state.0.load(Ordering::Relaxed))
    }

    /// Claim the active slot for writing
    ///
    /// Acquire pairs with the reader's release in `end_read`, so a slot the
    /// reader just gave back is not overwritten while still being read.
    #[inline]
    fn begin_write(&self) -> usize {
        State(self.state.0.fetch_add(USER_UNIT, Ordering::Acquire)).active()
    }

    /// Commit the active slot and flip if nobody else is inside
    #[inline]
    fn end_write(&self, slot: usize) {
        // The active slot's flag only changes here or during a flip, and no
        // flip can happen while we hold a user count.
        let prior = self.load();
        let set = if prior.is_full(slot) {
            0
        } else {
            State::full_flag(slot)
        };
        let delta = set.wrapping_sub(USER_UNIT);
        let now = State(
            self.state
                .0
                .fetch_add(delta, Ordering::Release)
                .wrapping_add(delta),
        );

        if now.users() == 0 {
            let _ = self.state.0.compare_exchange(
                now.0,
                now.flipped().0,
                Ordering::Release,
                Ordering::Relaxed,
            );
        }
    }

    /// Claim the readable slot, or `None` if nothing new was committed
    #[inline]
    fn begin_read(&self) -> Option<usize> {
        let seen = self.load();
        if !seen.is_full(seen.readable()) {
            return None;
        }

        // The flag we saw can only have been cleared by a flip that made a
        // freshly written slot readable, so after claiming a user count the
        // readable slot is guaranteed to hold a value.
        let now = State(
            self.state
                .0
                .fetch_add(USER_UNIT, Ordering::Acquire)
                .wrapping_add(USER_UNIT),
        );
        let slot = now.readable();
        debug_assert!(now.is_full(slot), "readable slot lost its value: {:?}", now);
        Some(slot)
    }

    /// Release the read slot, consume its value, and flip if the writer
    /// committed something meanwhile
    #[inline]
    fn end_read(&self, slot: usize) {
        let sub = State::full_flag(slot) | USER_UNIT;
        let now = State(self.state.0.fetch_sub(sub, Ordering::Release).wrapping_sub(sub));

        if now.users() == 0 && !now.is_full(slot) && now.is_full(now.active()) {
            let _ = self.state.0.compare_exchange(
                now.0,
                State(now.0 ^ ACTIVE_BIT).0,
                Ordering::Release,
                Ordering::Relaxed,
            );
        }
    }

    /// Snapshot: a committed value is waiting for the reader
    #[inline]
    fn has_unread(&self) -> bool {
        let state = self.load();
        state.is_full(state.readable()) || state.is_full(state.active())
    }
}

impl<T> fmt::Debug for DoubleBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoubleBuffer")
            .field("state", &self.load())
            .finish_non_exhaustive()
    }
}

/// The producing half of a [`DoubleBuffer`]
pub struct Writer<T> {
    shared: Arc<DoubleBuffer<T>>,
}

impl<T> Writer<T> {
    /// Publish `value`, replacing whatever the active slot held
    #[inline]
    pub fn write(&mut self, value: T) {
        *self.write_guard() = value;
    }

    /// Publish the value built by `make`
    #[inline]
    pub fn emplace<F>(&mut self, make: F)
    where
        F: FnOnce() -> T,
    {
        *self.write_guard() = make();
    }

    /// Mutate the active slot in place and publish it
    ///
    /// The slot holds whatever was last written into it (possibly a value from
    /// two writes ago), not necessarily the latest published value.
    #[inline]
    pub fn write_with<F>(&mut self, update: F)
    where
        F: FnOnce(&mut T),
    {
        let mut guard = self.write_guard();
        update(&mut *guard);
    }

    /// Scoped write; the value is published when the guard drops
    #[inline]
    pub fn write_guard(&mut self) -> WriteGuard<'_, T> {
        let slot = self.shared.begin_write();
        WriteGuard { writer: self, slot }
    }
}

impl<T> fmt::Debug for Writer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer").field("buffer", &*self.shared).finish()
    }
}

/// In-progress write; publishes on drop, including during unwinding
pub struct WriteGuard<'a, T> {
    writer: &'a mut Writer<T>,
    slot: usize,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        // Safety: this writer holds a user count on the active slot, which the
        // reader never touches and which cannot flip until we release.
        unsafe { &*self.writer.shared.slots[self.slot].get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as in `deref`; `&mut self` makes the access exclusive.
        unsafe { &mut *self.writer.shared.slots[self.slot].get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.writer.shared.end_write(self.slot);
    }
}

/// The consuming half of a [`DoubleBuffer`]
pub struct Reader<T> {
    shared: Arc<DoubleBuffer<T>>,
}

impl<T> Reader<T> {
    /// Scoped read of the latest committed value, or `None` if nothing new
    ///
    /// The value stays pinned for the guard's lifetime; writes made meanwhile
    /// land in the other slot. Dropping the guard consumes the value.
    #[inline]
    pub fn read_guard(&mut self) -> Option<ReadGuard<'_, T>> {
        let slot = self.shared.begin_read()?;
        Some(ReadGuard { reader: self, slot })
    }

    /// Movable read lock that owns this reader until [`ReadLock::unlock`]
    ///
    /// The lock is empty when nothing new was committed.
    #[inline]
    pub fn read_lock(self) -> ReadLock<T> {
        let slot = self.shared.begin_read();
        ReadLock {
            shared: self.shared,
            slot,
        }
    }

    /// Snapshot: a committed value is waiting (may be stale on return)
    #[inline]
    pub fn has_unread(&self) -> bool {
        self.shared.has_unread()
    }
}

impl<T: Clone> Reader<T> {
    /// Copy the latest committed value into `dest`
    ///
    /// Returns false and leaves `dest` untouched when nothing new was written
    /// since the last successful read.
    #[inline]
    pub fn try_read(&mut self, dest: &mut T) -> bool {
        match self.read_guard() {
            Some(guard) => {
                dest.clone_from(&guard);
                true
            }
            None => false,
        }
    }

    /// Clone out the latest committed value, if any
    #[inline]
    pub fn read(&mut self) -> Option<T> {
        self.read_guard().map(|guard| (*guard).clone())
    }
}

impl<T> fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader").field("buffer", &*self.shared).finish()
    }
}

/// Scoped read; consumes the value and releases the slot on drop
pub struct ReadGuard<'a, T> {
    reader: &'a mut Reader<T>,
    slot: usize,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        // Safety: the reader holds a user count on the readable slot, which
        // the writer never targets while the count is held.
        unsafe { &*self.reader.shared.slots[self.slot].get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.reader.shared.end_read(self.slot);
    }
}

/// Owned read lock; pins its slot until dropped or unlocked
///
/// Unlike [`ReadGuard`] it does not borrow the reader, so it can be stored or
/// sent to another thread. It may be empty if nothing was readable.
pub struct ReadLock<T> {
    shared: Arc<DoubleBuffer<T>>,
    slot: Option<usize>,
}

impl<T> ReadLock<T> {
    /// Whether the lock pins a value
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.slot.is_some()
    }

    /// The pinned value, if any
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // Safety: see `ReadGuard::deref`.
        self.slot
            .map(|slot| unsafe { &*self.shared.slots[slot].get() })
    }

    /// Release the slot and get the reader back
    pub fn unlock(mut self) -> Reader<T> {
        self.release();
        Reader {
            shared: Arc::clone(&self.shared),
        }
    }

    #[inline]
    fn release(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.shared.end_read(slot);
        }
    }
}

impl<T> Drop for ReadLock<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadLock").field("value", &self.get()).finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::thread;

    fn string_buffer() -> (Writer<String>, Reader<String>) {
        DoubleBuffer::<String>::new().split()
    }

    #[test]
    fn test_last_write_wins() {
        let (mut writer, mut reader) = string_buffer();
        writer.write("a".into());
        writer.write("b".into());
        writer.write("c".into());

        let mut out = String::new();
        assert!(reader.try_read(&mut out));
        assert_eq!(out, "c");
        assert!(!reader.try_read(&mut out));
        assert_eq!(out, "c");
    }

    #[test]
    fn test_empty_read_leaves_dest() {
        let (_writer, mut reader) = string_buffer();
        let mut out = "untouched".to_string();
        assert!(!reader.try_read(&mut out));
        assert_eq!(out, "untouched");
        assert!(!reader.has_unread());
    }

    #[test]
    fn test_seeded_buffer_has_nothing_to_read() {
        let (_writer, mut reader) = DoubleBuffer::with_value(7u32).split();
        assert_eq!(reader.read(), None);

        let (mut writer, mut reader) = DoubleBuffer::with_values(1u32, 2u32).split();
        assert_eq!(reader.read(), None);
        writer.write(3);
        assert_eq!(reader.read(), Some(3));
    }

    #[test]
    fn test_guard_pins_value_during_writes() {
        let (mut writer, mut reader) = string_buffer();
        writer.write("x".into());
        {
            let guard = reader.read_guard().expect("x was committed");
            writer.write("y".into());
            assert_eq!(*guard, "x");
            writer.write("z".into());
            assert_eq!(*guard, "x");
        }
        assert_eq!(reader.read().as_deref(), Some("z"));
        assert_eq!(reader.read(), None);
    }

    #[test]
    fn test_write_between_reads() {
        let (mut writer, mut reader) = DoubleBuffer::<u64>::new().split();
        for i in 1..=100 {
            writer.write(i);
            assert_eq!(reader.read(), Some(i));
            assert_eq!(reader.read(), None);
        }
    }

    #[test]
    fn test_emplace_and_write_with() {
        let (mut writer, mut reader) = DoubleBuffer::<Vec<u8>>::new().split();
        writer.emplace(|| vec![1, 2, 3]);
        assert_eq!(reader.read(), Some(vec![1, 2, 3]));

        writer.write_with(|slot| {
            slot.clear();
            slot.push(9);
        });
        assert_eq!(reader.read(), Some(vec![9]));
    }

    #[test]
    fn test_read_lock_moves_across_threads() {
        let (mut writer, reader) = string_buffer();
        writer.write("hello again".into());

        let lock = reader.read_lock();
        assert!(lock.is_locked());
        writer.write("what does the lock have?".into());

        let lock = thread::spawn(move || {
            assert_eq!(lock.get().map(String::as_str), Some("hello again"));
            lock
        })
        .join()
        .unwrap();

        let mut reader = lock.unlock();
        assert_eq!(reader.read().as_deref(), Some("what does the lock have?"));
    }

    #[test]
    fn test_empty_read_lock() {
        let (_writer, reader) = string_buffer();
        let lock = reader.read_lock();
        assert!(!lock.is_locked());
        assert!(lock.get().is_none());
        let mut reader = lock.unlock();
        assert_eq!(reader.read(), None);
    }

    #[test]
    fn test_write_guard_publishes_on_unwind() {
        let (mut writer, mut reader) = DoubleBuffer::<u32>::new().split();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut guard = writer.write_guard();
            *guard = 5;
            panic!("writer bailed out");
        }));
        assert!(result.is_err());

        // The guard released its user count, so the buffer still flips
        assert_eq!(reader.read(), Some(5));
        writer.write(6);
        assert_eq!(reader.read(), Some(6));
    }

    #[test]
    fn test_state_flip_clears_new_active_flag() {
        let state = State(State::full_flag(0) | State::full_flag(1));
        let flipped = state.flipped();
        assert_eq!(flipped.active(), 1);
        assert!(flipped.is_full(0));
        assert!(!flipped.is_full(1));
        assert_eq!(flipped.users(), 0);
    }

    #[test]
    fn test_is_lock_free() {
        assert!(DoubleBuffer::<u8>::is_lock_free());
    }

    #[test]
    fn test_state_word_owns_a_cache_line() {
        assert_eq!(std::mem::align_of::<PaddedState>(), CACHE_LINE_SIZE);
        assert_eq!(std::mem::size_of::<PaddedState>(), CACHE_LINE_SIZE);

        // No slot shares the state word's line, whichever field comes first
        let buffer = DoubleBuffer::<u8>::new();
        let state = &buffer.state as *const PaddedState as usize;
        for slot in &buffer.slots {
            assert!((slot.get() as usize).abs_diff(state) >= CACHE_LINE_SIZE);
        }
    }
}
