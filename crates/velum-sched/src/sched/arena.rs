//! Recyclable bump arenas for task memory
//!
//! Every task's header, effect lists, and frame are carved out of a
//! fixed-size arena block. A block tracks how many live tasks alias it; the
//! last release rewinds the cursor and returns the block to a free list, so
//! task memory is recycled wholesale instead of being freed
//! allocation-by-allocation. Blocks are never handed back to the OS while
//! the scheduler lives.

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Size of one task arena block.
pub(crate) const TASK_ARENA_SIZE: usize = 16 * 1024;

/// Alignment of an arena block; also the upper bound on the alignment of any
/// single carve.
pub(crate) const ARENA_ALIGN: usize = 64;

/// Backing storage of one arena block.
#[repr(C, align(64))]
struct ArenaStorage(UnsafeCell<[MaybeUninit<u8>; TASK_ARENA_SIZE]>);

/// A fixed-size bump-allocated block shared by the tasks carved from it.
///
/// # Safety
///
/// Carving is serialized by the pool's current-arena lock, and every carve
/// is handed out exactly once. Pointers into the block become invalid once
/// the alias count returns to zero and the block is reclaimed.
pub(crate) struct TaskArena {
    storage: Box<ArenaStorage>,

    /// Bump cursor: offset of the next free byte.
    cursor: AtomicUsize,

    /// Number of live tasks whose memory lives in this block.
    aliases: AtomicUsize,
}

// SAFETY: the pool serializes carving; carved regions have unique owners
unsafe impl Send for TaskArena {}
unsafe impl Sync for TaskArena {}

impl TaskArena {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            storage: Box::new(ArenaStorage(UnsafeCell::new(
                [MaybeUninit::uninit(); TASK_ARENA_SIZE],
            ))),
            cursor: AtomicUsize::new(0),
            aliases: AtomicUsize::new(0),
        })
    }

    fn base(&self) -> *mut u8 {
        self.storage.0.get().cast()
    }

    /// Bump-allocate `layout` from the block. Fails without growing.
    pub(crate) fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.align() <= ARENA_ALIGN);

        let cursor = self.cursor.load(Ordering::Relaxed);
        let offset = (cursor + layout.align() - 1) & !(layout.align() - 1);
        if offset + layout.size() > TASK_ARENA_SIZE {
            return None;
        }
        self.cursor.store(offset + layout.size(), Ordering::Relaxed);

        // SAFETY: the offset is in bounds of the storage block
        Some(unsafe { NonNull::new_unchecked(self.base().add(offset)) })
    }

    /// Record one more live task aliasing this block.
    pub(crate) fn alias(&self) {
        self.aliases.fetch_add(1, Ordering::Relaxed);
    }

    fn alias_count(&self) -> usize {
        self.aliases.load(Ordering::Acquire)
    }

    /// Drop one alias. Returns true when this was the last one.
    fn unalias(&self) -> bool {
        self.aliases.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Rewind the cursor to the start of the block.
    fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn used_bytes(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

/// Pool of task arenas: a free list of fully reclaimed blocks plus the block
/// new tasks are currently carved from.
pub(crate) struct ArenaPool {
    /// Fully reclaimed arenas, most recently used last.
    free: CachePadded<Mutex<Vec<Arc<TaskArena>>>>,

    /// Arena new tasks are carved from.
    current: CachePadded<Mutex<Option<Arc<TaskArena>>>>,
}

impl ArenaPool {
    pub(crate) fn new() -> Self {
        Self {
            free: CachePadded::new(Mutex::new(Vec::new())),
            current: CachePadded::new(Mutex::new(None)),
        }
    }

    /// Pop the most recently used free arena, or allocate a fresh block.
    fn request_arena(&self) -> Arc<TaskArena> {
        if let Some(arena) = self.free.lock().pop() {
            return arena;
        }
        TaskArena::new()
    }

    /// Carve `layout` out of the current arena, aliasing the block for the
    /// caller.
    ///
    /// On exhaustion the current arena is reclaimed in place when the cursor
    /// is its only holder, otherwise retired and replaced, and the carve is
    /// retried exactly once. Task memory correctness cannot survive a
    /// partial allocation, so a second failure aborts.
    pub(crate) fn alloc(&self, layout: Layout) -> (Arc<TaskArena>, NonNull<u8>) {
        let mut slot = self.current.lock();

        for attempt in 0.. {
            let arena = slot.get_or_insert_with(|| self.request_arena());

            if let Some(ptr) = arena.alloc(layout) {
                arena.alias();
                return (arena.clone(), ptr);
            }

            assert!(
                attempt == 0,
                "task allocation of {} bytes does not fit a {} byte arena",
                layout.size(),
                TASK_ARENA_SIZE
            );

            if arena.alias_count() == 0 {
                // uniquely held by the cursor: reclaim in place
                arena.reset();
            } else {
                *slot = None;
            }
        }

        unreachable!()
    }

    /// Release one task's alias on `arena`. The last release reclaims the
    /// block: cursor rewound, current slot cleared if the block still
    /// occupies it, block pushed onto the free list.
    pub(crate) fn release(&self, arena: Arc<TaskArena>) {
        if !arena.unalias() {
            return;
        }

        {
            let mut slot = self.current.lock();
            // the block may have been revived by a carve that won the race
            // to the current-arena lock
            if arena.alias_count() != 0 {
                return;
            }
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &arena)) {
                *slot = None;
            }
        }

        arena.reset();
        self.free.lock().push(arena);
    }

    #[cfg(test)]
    pub(crate) fn free_len(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, 8).unwrap()
    }

    #[test]
    fn test_arena_alloc_and_alignment() {
        let arena = TaskArena::new();

        let a = arena.alloc(Layout::from_size_align(1, 1).unwrap()).unwrap();
        let b = arena.alloc(Layout::from_size_align(8, 8).unwrap()).unwrap();

        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(b.as_ptr() as usize % 8, 0);
        assert_eq!(arena.used_bytes(), 16);
    }

    #[test]
    fn test_arena_alloc_fails_without_growing() {
        let arena = TaskArena::new();

        assert!(arena.alloc(layout(TASK_ARENA_SIZE)).is_some());
        assert!(arena.alloc(layout(1)).is_none());
        assert_eq!(arena.used_bytes(), TASK_ARENA_SIZE);
    }

    #[test]
    fn test_pool_shares_current_arena() {
        let pool = ArenaPool::new();

        let (a, _) = pool.alloc(layout(64));
        let (b, _) = pool.alloc(layout(64));

        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_pool_last_release_reclaims() {
        let pool = ArenaPool::new();

        // two tasks carved back-to-back share one arena
        let (a, _) = pool.alloc(layout(64));
        let (b, _) = pool.alloc(layout(64));
        assert!(Arc::ptr_eq(&a, &b));
        let used = a.used_bytes();
        assert!(used >= 128);

        // first release: arena still aliased, not reclaimed
        pool.release(a.clone());
        assert_eq!(pool.free_len(), 0);
        assert_eq!(a.used_bytes(), used);

        // second release: cursor rewound, block on the free list
        pool.release(b);
        assert_eq!(pool.free_len(), 1);
        assert_eq!(a.used_bytes(), 0);
    }

    #[test]
    fn test_pool_recycles_from_free_list() {
        let pool = ArenaPool::new();

        let (a, _) = pool.alloc(layout(64));
        pool.release(a.clone());
        assert_eq!(pool.free_len(), 1);

        // the reclaimed block is reused rather than a fresh one allocated
        let (b, _) = pool.alloc(layout(64));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.free_len(), 0);
        pool.release(b);
    }

    #[test]
    fn test_pool_retires_exhausted_arena() {
        let pool = ArenaPool::new();

        // keep the first arena alive while exhausting it
        let (a, _) = pool.alloc(layout(TASK_ARENA_SIZE - 64));

        // does not fit: the pool must retire the block and pull a fresh one
        let (b, _) = pool.alloc(layout(512));
        assert!(!Arc::ptr_eq(&a, &b));

        pool.release(a);
        assert_eq!(pool.free_len(), 1);
        pool.release(b);
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn test_pool_reuses_reclaimed_block_for_full_carve() {
        let pool = ArenaPool::new();

        // exhaust the current arena, then let reclamation rewind it
        let (a, _) = pool.alloc(layout(TASK_ARENA_SIZE - 64));
        let used_before = a.used_bytes();
        pool.release(a.clone());
        assert!(used_before > 0);
        assert_eq!(a.used_bytes(), 0);

        // the rewound block accepts even a full-size carve again
        let (b, _) = pool.alloc(layout(TASK_ARENA_SIZE));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.free_len(), 0);
        pool.release(b);
    }

    #[test]
    #[should_panic]
    fn test_pool_oversized_alloc_is_fatal() {
        let pool = ArenaPool::new();
        pool.alloc(layout(TASK_ARENA_SIZE + 1));
    }

    #[test]
    fn test_pool_release_from_many_threads() {
        use std::thread;

        let pool = Arc::new(ArenaPool::new());
        let carves: Vec<_> = (0..8).map(|_| pool.alloc(layout(64)).0).collect();

        let handles: Vec<_> = carves
            .into_iter()
            .map(|arena| {
                let pool = pool.clone();
                thread::spawn(move || pool.release(arena))
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // exactly one reclamation, no double-reset
        assert_eq!(pool.free_len(), 1);
    }
}
