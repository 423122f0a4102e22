/*!
 * Optimistic Buffer
 *
 * Seqlock pages for plain-data values. The writer never waits; readers copy
 * the value out speculatively and retry if the copy raced with a write.
 *
 * # Sequence Encoding
 *
 * Each page carries a `u32` counter bumped twice per write:
 *
 * 1. odd: write in progress, any copy taken now is suspect
 * 2. even: page stable
 *
 * A read is valid only if the counter was even before the copy and unchanged
 * after it.
 *
 * # Pages
 *
 * With `N > 1` pages the writer rotates round-robin and publishes the index
 * of the page it just completed. Readers always target the published page, so
 * a reader only collides with the writer once the writer has lapped all the
 * other pages.
 *
 * # Example
 *
 * ```
 * use ash_sync::core::sync::OptimisticBuffer;
 *
 * let (mut writer, reader) = OptimisticBuffer::<[u64; 2]>::new().split();
 * writer.write([7, 7]);
 *
 * let mut out = [0; 2];
 * assert!(reader.try_read(&mut out, 3));
 * assert_eq!(out, [7, 7]);
 * ```
 */

use crate::core::limits::CACHE_LINE_SIZE;
use crate::core::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use crate::core::sync::backoff::Backoff;
use crate::core::sync::config::SpinConfig;
use crate::core::sync::hint;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Arc;

const WRITING: u32 = 1;

/// One seqlock-guarded value
#[repr(C, align(64))]
struct Page<T> {
    sequence: AtomicU32,
    value: UnsafeCell<T>,
}

// Alignment comes from the attribute, so any small payload shows the literal
const _: () = assert!(std::mem::align_of::<Page<u8>>() == CACHE_LINE_SIZE);

impl<T: Copy> Page<T> {
    fn new(value: T) -> Self {
        Self {
            sequence: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Single speculative copy; `None` if it raced a write
    #[inline]
    fn try_copy(&self) -> Option<T> {
        let before = self.sequence.load(Ordering::Acquire);
        if before & WRITING != 0 {
            return None;
        }

        // Safety: the bytes may be half-written, so they stay behind
        // MaybeUninit until the sequence re-check proves the copy is whole.
        let snapshot = unsafe { ptr::read_volatile(self.value.get() as *const MaybeUninit<T>) };
        fence(Ordering::Acquire);

        if self.sequence.load(Ordering::Relaxed) == before {
            // Safety: no write overlapped the copy, so it is a valid T.
            Some(unsafe { snapshot.assume_init() })
        } else {
            None
        }
    }
}

/// Multi-page seqlock buffer for `Copy` values
///
/// Construct it, then [`split`](Self::split) it into its writer and readers.
pub struct OptimisticBuffer<T: Copy, const N: usize = 2> {
    pages: [Page<T>; N],
    read_page: AtomicUsize,
}

// Safety: readers only ever copy values out; the single writer is the only
// thread that mutates a page and announces it through the sequence counter.
unsafe impl<T: Copy + Send, const N: usize> Sync for OptimisticBuffer<T, N> {}

impl<T: Copy + Default, const N: usize> OptimisticBuffer<T, N> {
    /// Every page holds `T::default()`, readable immediately
    pub fn new() -> Self {
        Self::with_value(T::default())
    }
}

impl<T: Copy + Default, const N: usize> Default for OptimisticBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const N: usize> OptimisticBuffer<T, N> {
    const AT_LEAST_ONE_PAGE: () = assert!(N > 0, "optimistic buffer needs at least one page");

    /// Every page holds `value`, readable immediately
    pub fn with_value(value: T) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::AT_LEAST_ONE_PAGE;
        Self {
            pages: std::array::from_fn(|_| Page::new(value)),
            read_page: AtomicUsize::new(0),
        }
    }

    /// Number of pages the writer rotates through
    pub const fn page_count(&self) -> usize {
        N
    }

    /// Hand out the single writer and a cloneable reader
    pub fn split(self) -> (OptimisticWriter<T, N>, OptimisticReader<T, N>) {
        let shared = Arc::new(self);
        (
            OptimisticWriter {
                shared: Arc::clone(&shared),
                write_page: 0,
            },
            OptimisticReader {
                shared,
                spin: SpinConfig::default(),
            },
        )
    }

    #[inline]
    fn published(&self) -> &Page<T> {
        &self.pages[self.read_page.load(Ordering::Acquire)]
    }
}

impl<T: Copy + fmt::Debug, const N: usize> fmt::Debug for OptimisticBuffer<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticBuffer")
            .field("pages", &N)
            .field("read_page", &self.read_page.load(Ordering::Relaxed))
            .field("latest", &self.published().try_copy())
            .finish()
    }
}

/// The single producing half of an [`OptimisticBuffer`]
pub struct OptimisticWriter<T: Copy, const N: usize = 2> {
    shared: Arc<OptimisticBuffer<T, N>>,
    write_page: usize,
}

impl<T: Copy, const N: usize> OptimisticWriter<T, N> {
    /// Publish `value`
    #[inline]
    pub fn write(&mut self, value: T) {
        self.write_with(|slot| *slot = value);
    }

    /// Publish the value built by `make`
    #[inline]
    pub fn emplace<F>(&mut self, make: F)
    where
        F: FnOnce() -> T,
    {
        self.write_with(|slot| *slot = make());
    }

    /// Mutate the write page in place and publish it
    ///
    /// The page holds what was written into it `N` writes ago, which is the
    /// latest value only when `N == 1`.
    #[inline]
    pub fn write_with<F>(&mut self, update: F)
    where
        F: FnOnce(&mut T),
    {
        let mut write = PageWrite::begin(self);
        update(write.value());
    }

    /// Page the next write will target
    pub fn next_page(&self) -> usize {
        self.write_page
    }
}

impl<T: Copy, const N: usize> fmt::Debug for OptimisticWriter<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticWriter")
            .field("write_page", &self.write_page)
            .finish_non_exhaustive()
    }
}

/// Open write on one page; closes the sequence and publishes on drop, so a
/// panicking update never leaves a page marked as being written
struct PageWrite<'a, T: Copy, const N: usize> {
    writer: &'a mut OptimisticWriter<T, N>,
    sequence: u32,
}

impl<'a, T: Copy, const N: usize> PageWrite<'a, T, N> {
    #[inline]
    fn begin(writer: &'a mut OptimisticWriter<T, N>) -> Self {
        let page = &writer.shared.pages[writer.write_page];
        let sequence = page.sequence.load(Ordering::Relaxed);
        debug_assert_eq!(sequence & WRITING, 0, "page left mid-write");
        page.sequence
            .store(sequence.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        Self { writer, sequence }
    }

    #[inline]
    fn value(&mut self) -> &mut T {
        // Safety: only the single writer mutates pages, and readers never
        // trust bytes copied while the sequence is odd.
        unsafe { &mut *self.writer.shared.pages[self.writer.write_page].value.get() }
    }
}

impl<T: Copy, const N: usize> Drop for PageWrite<'_, T, N> {
    fn drop(&mut self) {
        let writer = &mut *self.writer;
        let page = &writer.shared.pages[writer.write_page];
        page.sequence
            .store(self.sequence.wrapping_add(2), Ordering::Release);
        writer
            .shared
            .read_page
            .store(writer.write_page, Ordering::Release);
        writer.write_page = (writer.write_page + 1) % N;
    }
}

/// A consuming handle for an [`OptimisticBuffer`]; clone freely
pub struct OptimisticReader<T: Copy, const N: usize = 2> {
    shared: Arc<OptimisticBuffer<T, N>>,
    spin: SpinConfig,
}

impl<T: Copy, const N: usize> OptimisticReader<T, N> {
    /// Use `config` for [`wait_read`](Self::wait_read) backoff
    pub fn with_spin_config(mut self, config: SpinConfig) -> Self {
        self.spin = config;
        self
    }

    /// Copy the latest published value into `dest`
    ///
    /// Makes up to `retries + 1` attempts. Returns false and leaves `dest`
    /// untouched if every attempt raced with a write.
    #[inline]
    pub fn try_read(&self, dest: &mut T, retries: u32) -> bool {
        let mut remaining = retries;
        loop {
            if let Some(value) = self.shared.published().try_copy() {
                *dest = value;
                return true;
            }
            if remaining == 0 {
                return false;
            }
            remaining -= 1;
            hint::spin_loop();
        }
    }

    /// Copy the latest published value into `dest`, however long it takes
    ///
    /// Spins then yields according to the reader's [`SpinConfig`].
    pub fn wait_read(&self, dest: &mut T) {
        let mut backoff = Backoff::new(self.spin);
        loop {
            if let Some(value) = self.shared.published().try_copy() {
                *dest = value;
                return;
            }
            backoff.snooze();
        }
    }

    /// Single attempt; `None` if it raced with a write
    #[inline]
    pub fn read(&self) -> Option<T> {
        self.shared.published().try_copy()
    }

    /// Latest published value, waiting out concurrent writes
    pub fn load(&self) -> T {
        let mut backoff = Backoff::new(self.spin);
        loop {
            if let Some(value) = self.shared.published().try_copy() {
                return value;
            }
            backoff.snooze();
        }
    }

    pub fn page_count(&self) -> usize {
        N
    }
}

impl<T: Copy, const N: usize> Clone for OptimisticReader<T, N> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            spin: self.spin,
        }
    }
}

impl<T: Copy, const N: usize> fmt::Debug for OptimisticReader<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticReader")
            .field("spin", &self.spin)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn test_initial_value_readable() {
        let (_writer, reader) = OptimisticBuffer::<u32, 1>::with_value(9).split();
        assert_eq!(reader.read(), Some(9));
        assert_eq!(reader.page_count(), 1);
    }

    #[test]
    fn test_single_page_write_read() {
        let (mut writer, reader) = OptimisticBuffer::<u64, 1>::new().split();
        writer.write(5);
        let mut out = 0;
        assert!(reader.try_read(&mut out, 0));
        assert_eq!(out, 5);
        assert_eq!(writer.next_page(), 0);
    }

    #[test]
    fn test_pages_rotate() {
        let (mut writer, reader) = OptimisticBuffer::<u32, 3>::new().split();
        for i in 0..7u32 {
            assert_eq!(writer.next_page(), (i % 3) as usize);
            writer.write(i);
            assert_eq!(reader.load(), i);
        }
    }

    #[test]
    fn test_write_with_sees_page_contents() {
        let (mut writer, reader) = OptimisticBuffer::<[u8; 2], 1>::new().split();
        writer.emplace(|| [1, 2]);
        writer.write_with(|page| page[1] = 9);
        assert_eq!(reader.read(), Some([1, 9]));
    }

    #[test]
    fn test_unstable_page_rejects_read() {
        let buffer = OptimisticBuffer::<u32, 1>::with_value(3);
        buffer.pages[0].sequence.store(WRITING, Ordering::Relaxed);
        let (_writer, reader) = buffer.split();

        let mut out = 77;
        assert!(!reader.try_read(&mut out, 5));
        assert_eq!(out, 77);
        assert_eq!(reader.read(), None);
    }

    #[test]
    fn test_panicking_update_closes_page() {
        let (mut writer, reader) = OptimisticBuffer::<u32, 1>::new().split();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            writer.write_with(|_| panic!("update failed"));
        }));
        assert!(result.is_err());

        // Sequence is even again, so readers are not locked out
        assert!(reader.read().is_some());
        writer.write(4);
        assert_eq!(reader.read(), Some(4));
    }

    #[test]
    fn test_concurrent_reads_never_torn() {
        let (mut writer, reader) = OptimisticBuffer::<[u64; 8], 2>::new().split();
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let reader = reader.clone().with_spin_config(SpinConfig::cooperative());
                let done = done.clone();
                thread::spawn(move || {
                    let mut last = 0;
                    let mut out = [0u64; 8];
                    while !done.load(Ordering::Acquire) {
                        reader.wait_read(&mut out);
                        assert!(out.iter().all(|&v| v == out[0]), "torn read: {:?}", out);
                        assert!(out[0] >= last, "went backwards: {} < {}", out[0], last);
                        last = out[0];
                    }
                })
            })
            .collect();

        for i in 1..=20_000u64 {
            writer.write([i; 8]);
        }
        done.store(true, Ordering::Release);

        for handle in readers {
            handle.join().unwrap();
        }
        assert_eq!(reader.load(), [20_000; 8]);
    }

    #[test]
    fn test_pages_sit_on_separate_cache_lines() {
        assert_eq!(std::mem::align_of::<Page<u64>>(), CACHE_LINE_SIZE);
        assert_eq!(std::mem::align_of::<Page<[u64; 16]>>(), CACHE_LINE_SIZE);

        let buffer = OptimisticBuffer::<u32, 3>::new();
        for pair in buffer.pages.windows(2) {
            let first = &pair[0] as *const Page<u32> as usize;
            let second = &pair[1] as *const Page<u32> as usize;
            assert_eq!(first % CACHE_LINE_SIZE, 0);
            assert_eq!(second - first, CACHE_LINE_SIZE);
        }
    }
}
