/*!
 * Chunk Pool
 *
 * Lock-free object pool for a single type. Storage is carved from
 * geometrically growing chunks obtained from the system allocator and
 * recycled through a [`TaggedStack`] free list. Memory only goes back to the
 * system when the pool itself is dropped.
 *
 * # Slot Indices
 *
 * The free list threads slot indices, not pointers:
 *
 * ```text
 *   bits 24-31   chunk id (at most 256 chunks per pool)
 *   bits 0-23    offset inside the chunk
 * ```
 *
 * The chunk table resolves an index to its slot in O(1). Chunks are never
 * freed while the pool is alive, so a stale index read by a losing popper
 * always names valid memory.
 *
 * # Example
 *
 * ```
 * use ash_sync::memory::ChunkPool;
 *
 * let pool = ChunkPool::<String>::new();
 * let name = pool.boxed("pooled".to_string()).unwrap();
 * assert_eq!(&*name, "pooled");
 * drop(name); // destructor runs, slot goes back on the free list
 *
 * assert_eq!(pool.stats().chunks, 1);
 * ```
 */

use super::types::{PoolConfig, PoolStats};
use crate::core::errors::{PoolError, PoolResult};
use crate::core::limits::{MAX_CHUNK_SLOTS, MAX_POOL_CHUNKS, NIL_INDEX};
use crate::core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use crate::core::sync::TaggedStack;
use crate::core::types::{ChunkSlot, LinkTable, SlotIndex};
use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use tracing::{debug, warn};

/// Pooled storage for one `T`
///
/// `value` comes first so a pointer to the value is also a pointer to its slot.
#[repr(C)]
struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    link: AtomicU32,
    index: SlotIndex,
}

/// Chunk id to chunk base pointer, plus the allocation length for teardown
struct ChunkTable<T> {
    bases: [AtomicPtr<Slot<T>>; MAX_POOL_CHUNKS],
    lens: [AtomicUsize; MAX_POOL_CHUNKS],
}

impl<T> ChunkTable<T> {
    fn new() -> Self {
        Self {
            bases: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            lens: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    /// Raw slot behind `index`, carrying the whole chunk's provenance
    ///
    /// # Safety
    ///
    /// `index` must have been produced by this table's pool; its chunk is then
    /// published and stays allocated until the pool drops.
    #[inline(always)]
    unsafe fn slot_ptr(&self, index: SlotIndex) -> *mut Slot<T> {
        let at = ChunkSlot::from_index(index);
        let base = self.bases[at.chunk].load(Ordering::Acquire);
        debug_assert!(!base.is_null(), "index {:#x} names an unpublished chunk", index);
        base.add(at.offset)
    }
}

impl<T> LinkTable for ChunkTable<T> {
    #[inline(always)]
    fn link(&self, index: SlotIndex) -> &AtomicU32 {
        // Safety: only indices minted by `ChunkPool::add_chunk` ever reach the
        // free list, and a stale head still names a live chunk.
        unsafe { &*ptr::addr_of!((*self.slot_ptr(index)).link) }
    }
}

/// Growing, lock-free object pool for `T`
///
/// Share it by reference or behind an `Arc`; every operation takes `&self`.
/// Dropping the pool frees every chunk but never runs `T` destructors for
/// values still living in it.
pub struct ChunkPool<T> {
    free: TaggedStack,
    trash: TaggedStack,
    trash_links: [AtomicU32; MAX_POOL_CHUNKS],
    table: ChunkTable<T>,
    chunk_ids: AtomicUsize,
    chunks: AtomicUsize,
    capacity: AtomicUsize,
    next_chunk_slots: AtomicUsize,
    config: PoolConfig,
    _marker: PhantomData<T>,
}

impl<T> ChunkPool<T> {
    /// Empty pool with default growth; no memory is taken until first use
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Empty pool with custom growth (clamped to valid bounds)
    pub fn with_config(config: PoolConfig) -> Self {
        let config = config.normalized();
        Self {
            free: TaggedStack::new(),
            trash: TaggedStack::new(),
            trash_links: std::array::from_fn(|_| AtomicU32::new(NIL_INDEX)),
            table: ChunkTable::new(),
            chunk_ids: AtomicUsize::new(0),
            chunks: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            next_chunk_slots: AtomicUsize::new(config.initial_chunk_slots),
            config,
            _marker: PhantomData,
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Storage for one `T`, uninitialized
    ///
    /// Pops the free list, growing the pool by one chunk when it is empty.
    /// Fails only when the system allocator or the chunk table is exhausted.
    pub fn allocate(&self) -> PoolResult<NonNull<T>> {
        let index = match self.free.try_pop(&self.table) {
            Some(index) => index,
            None => self.add_chunk()?,
        };
        // Safety: the index came from this pool's free list or a fresh chunk,
        // and `value` sits at offset zero of its slot.
        Ok(unsafe { NonNull::new_unchecked(self.table.slot_ptr(index).cast::<T>()) })
    }

    /// Return storage obtained from [`allocate`](Self::allocate)
    ///
    /// Does not run any destructor.
    ///
    /// # Safety
    ///
    /// `storage` must come from this pool, must not be released twice, and
    /// must not be used after this call.
    pub unsafe fn release(&self, storage: NonNull<T>) {
        debug_assert!(self.owns(storage.as_ptr()), "foreign pointer released");
        let slot = storage.cast::<Slot<T>>().as_ptr();
        self.free.push(&self.table, ptr::addr_of!((*slot).index).read());
    }

    /// Move `value` into pooled storage
    pub fn boxed(&self, value: T) -> PoolResult<PoolBox<'_, T>> {
        let storage = self.allocate()?;
        // Safety: fresh storage sized and aligned for T.
        unsafe { storage.as_ptr().write(value) };
        Ok(PoolBox {
            pool: self,
            ptr: storage,
        })
    }

    /// Grow until `count` allocations can be served without touching the
    /// system allocator, then give every slot back
    pub fn prewarm(&self, count: usize) -> PoolResult<()> {
        let mut held = Vec::with_capacity(count);
        let result = (0..count).try_for_each(|_| -> PoolResult<()> {
            held.push(self.allocate()?);
            Ok(())
        });
        for storage in held {
            // Safety: allocated just above and never handed out.
            unsafe { self.release(storage) };
        }
        result
    }

    /// Whether `ptr` points at a slot of this pool
    pub fn owns(&self, ptr: *const T) -> bool {
        let addr = ptr as usize;
        let stride = mem::size_of::<Slot<T>>();
        self.table.bases.iter().zip(&self.table.lens).any(|(base, len)| {
            let base = base.load(Ordering::Acquire) as usize;
            if base == 0 {
                return false;
            }
            let end = base + len.load(Ordering::Relaxed) * stride;
            (base..end).contains(&addr) && (addr - base) % stride == 0
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            chunks: self.chunks.load(Ordering::Relaxed),
            capacity: self.capacity.load(Ordering::Relaxed),
            next_chunk_slots: self.next_chunk_slots.load(Ordering::Relaxed),
        }
    }

    /// Allocate, publish, and link a new chunk; returns one of its slots
    /// straight to the caller
    #[cold]
    fn add_chunk(&self) -> PoolResult<SlotIndex> {
        let config = self.config;
        let slots = self
            .next_chunk_slots
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(config.grow(c))
            })
            .unwrap_or(config.initial_chunk_slots);

        let layout = Layout::array::<Slot<T>>(slots)
            .map_err(|_| PoolError::LayoutOverflow { slots })?;
        // Safety: Slot<T> always has a non-zero size and `slots >= 1`.
        let base = unsafe { alloc::alloc(layout) }.cast::<Slot<T>>();
        if base.is_null() {
            warn!(slots, bytes = layout.size(), "Chunk allocation failed");
            return Err(PoolError::AllocationFailed {
                slots,
                bytes: layout.size(),
            });
        }

        let claimed = self
            .chunk_ids
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_POOL_CHUNKS).then_some(n + 1)
            });
        let chunk = match claimed {
            Ok(chunk) => chunk,
            Err(_) => {
                // Safety: allocated above with this layout, never published.
                unsafe { alloc::dealloc(base.cast(), layout) };
                warn!(limit = MAX_POOL_CHUNKS, "Chunk pool exhausted its chunk table");
                return Err(PoolError::ChunkLimit {
                    limit: MAX_POOL_CHUNKS,
                });
            }
        };

        // The very last offset of the very last chunk would encode NIL_INDEX
        let usable = if chunk == MAX_POOL_CHUNKS - 1 {
            slots.min(MAX_CHUNK_SLOTS - 1)
        } else {
            slots
        };

        for offset in 0..usable {
            // Safety: in bounds of the fresh allocation, not yet shared.
            unsafe {
                base.add(offset).write(Slot {
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                    link: AtomicU32::new(NIL_INDEX),
                    index: ChunkSlot::new(chunk, offset).index(),
                });
            }
        }

        self.table.lens[chunk].store(slots, Ordering::Relaxed);
        self.table.bases[chunk].store(base, Ordering::Release);
        self.trash.push(&self.trash_links[..], chunk as SlotIndex);
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.capacity.fetch_add(usable, Ordering::Relaxed);

        debug!(
            chunk,
            slots = usable,
            bytes = layout.size(),
            "Added chunk to pool"
        );

        // Lowest offsets end up on top of the free list
        for offset in (1..usable).rev() {
            self.free
                .push(&self.table, ChunkSlot::new(chunk, offset).index());
        }
        Ok(ChunkSlot::new(chunk, 0).index())
    }
}

impl<T> Default for ChunkPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ChunkPool<T> {
    fn drop(&mut self) {
        let mut released = 0usize;
        while let Some(chunk) = self.trash.try_pop(&self.trash_links[..]) {
            let chunk = chunk as usize;
            let base = self.table.bases[chunk].swap(ptr::null_mut(), Ordering::AcqRel);
            let slots = self.table.lens[chunk].load(Ordering::Relaxed);
            if base.is_null() {
                continue;
            }
            if let Ok(layout) = Layout::array::<Slot<T>>(slots) {
                // Safety: allocated in add_chunk with this exact layout, and
                // the trash stack lists each chunk exactly once.
                unsafe { alloc::dealloc(base.cast(), layout) };
                released += 1;
            }
        }
        debug!(
            chunks = released,
            capacity = self.capacity.load(Ordering::Relaxed),
            "Chunk pool torn down"
        );
    }
}

impl<T> fmt::Debug for ChunkPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkPool")
            .field("type", &std::any::type_name::<T>())
            .field("stats", &self.stats())
            .field("free", &self.free)
            .finish()
    }
}

/// Owned `T` living in pooled storage
///
/// Dropping it runs `T`'s destructor and returns the slot to its pool.
pub struct PoolBox<'p, T> {
    pool: &'p ChunkPool<T>,
    ptr: NonNull<T>,
}

// Safety: a PoolBox owns its T exclusively, like a Box, and only touches the
// pool through its lock-free `&self` API.
unsafe impl<T: Send + Sync> Send for PoolBox<'_, T> {}
unsafe impl<T: Send + Sync> Sync for PoolBox<'_, T> {}

impl<'p, T> PoolBox<'p, T> {
    /// Move the value out and return the slot to the pool
    pub fn into_inner(this: Self) -> T {
        let this = mem::ManuallyDrop::new(this);
        // Safety: the value is initialized and read exactly once; the slot is
        // released right after and `this` is never dropped.
        unsafe {
            let value = this.ptr.as_ptr().read();
            this.pool.release(this.ptr);
            value
        }
    }

    /// Pool the value lives in
    pub fn pool(this: &Self) -> &'p ChunkPool<T> {
        this.pool
    }

    /// Address of the pooled value
    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }
}

impl<T> Deref for PoolBox<'_, T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        // Safety: initialized in `boxed` and owned exclusively.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for PoolBox<'_, T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above, and `&mut self` makes the access exclusive.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for PoolBox<'_, T> {
    fn drop(&mut self) {
        // Safety: the value is initialized and dropped exactly once, then the
        // storage goes back to the pool it came from.
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            self.pool.release(self.ptr);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PoolBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;
    use std::sync::Arc;

    #[test]
    fn test_release_then_allocate_reuses_address() {
        let pool = ChunkPool::<u64>::new();
        let first = pool.allocate().unwrap();
        unsafe { pool.release(first) };
        let second = pool.allocate().unwrap();
        assert_eq!(first, second);
        unsafe { pool.release(second) };
    }

    #[test]
    fn test_first_chunk_uses_initial_size() {
        let pool = ChunkPool::<u32>::new();
        assert_eq!(pool.stats(), PoolStats {
            chunks: 0,
            capacity: 0,
            next_chunk_slots: 2,
        });

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(pool.stats().chunks, 1);
        assert_eq!(pool.stats().capacity, 2);
        assert_eq!(pool.stats().next_chunk_slots, 4);
        assert_ne!(a, b);

        unsafe {
            pool.release(a);
            pool.release(b);
        }
    }

    #[test]
    fn test_owns() {
        let pool = ChunkPool::<u16>::new();
        let other = ChunkPool::<u16>::new();
        let ptr = pool.allocate().unwrap();

        assert!(pool.owns(ptr.as_ptr()));
        assert!(!other.owns(ptr.as_ptr()));
        let local = 5u16;
        assert!(!pool.owns(&local));

        unsafe { pool.release(ptr) };
    }

    #[test]
    fn test_prewarm_presizes() {
        let pool = ChunkPool::<[u8; 24]>::new();
        pool.prewarm(10).unwrap();
        let stats = pool.stats();
        assert!(stats.capacity >= 10);

        let held: Vec<_> = (0..10).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.stats(), stats);
        for ptr in held {
            unsafe { pool.release(ptr) };
        }
    }

    #[test]
    fn test_box_runs_destructor_and_recycles() {
        struct Tracked(Arc<Counter>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(Counter::new(0));
        let pool = ChunkPool::new();

        let boxed = pool.boxed(Tracked(drops.clone())).unwrap();
        let addr = PoolBox::as_ptr(&boxed);
        drop(boxed);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let again = pool.boxed(Tracked(drops.clone())).unwrap();
        assert_eq!(PoolBox::as_ptr(&again), addr);
        let inner = PoolBox::into_inner(again);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(inner);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_chunk_limit_reported() {
        let pool = ChunkPool::<u8>::with_config(PoolConfig {
            initial_chunk_slots: 1,
            max_chunk_slots: 1,
        });
        let held: Vec<_> = (0..MAX_POOL_CHUNKS)
            .map(|_| pool.allocate().unwrap())
            .collect();
        assert_eq!(pool.stats().chunks, MAX_POOL_CHUNKS);

        assert_eq!(
            pool.allocate(),
            Err(PoolError::ChunkLimit {
                limit: MAX_POOL_CHUNKS
            })
        );

        for ptr in held {
            unsafe { pool.release(ptr) };
        }
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn test_zero_sized_values() {
        let pool = ChunkPool::<()>::new();
        let a = pool.boxed(()).unwrap();
        let b = pool.boxed(()).unwrap();
        assert_ne!(PoolBox::as_ptr(&a), PoolBox::as_ptr(&b));
    }
}
