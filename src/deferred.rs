//! Frees requested from interrupt context
use core::{cell::RefCell, fmt, ptr::NonNull};

use critical_section::Mutex;

use crate::{
    policy::{DefaultPolicy, Policy},
    registry::{Heap, Registry},
    Error, Init, MemType, Pool, PoolOptions,
};

/// The default capacity of a [`DeferredFree`] queue.
pub const DEFAULT_PENDING: usize = 4;

#[derive(Debug, Clone, Copy)]
struct PendingBlock(NonNull<u8>);

// Safety: A pending block is only a token handed from the interrupt to the
//         task that frees it. Nobody dereferences it in between.
unsafe impl Send for PendingBlock {}

/// A bounded queue of blocks whose release was requested where the pool
/// cannot be locked.
///
/// [`Self::push`] only takes a critical section and is safe to call from an
/// interrupt handler. The owner of the pool calls [`Self::drain`] from task
/// context before touching the pool.
pub struct DeferredFree<const N: usize = DEFAULT_PENDING> {
    queue: Mutex<RefCell<heapless::Deque<PendingBlock, N>>>,
}

impl<const N: usize> fmt::Debug for DeferredFree<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredFree")
            .field("len", &self.len())
            .field("capacity", &N)
            .finish()
    }
}

impl<const N: usize> Init for DeferredFree<N> {
    const INIT: Self = Self::new();
}

impl<const N: usize> Default for DeferredFree<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DeferredFree<N> {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(RefCell::new(heapless::Deque::new())),
        }
    }

    /// Queue `ptr` for release.
    pub fn push(&self, ptr: NonNull<u8>) -> Result<(), Error> {
        critical_section::with(|cs| {
            self.queue
                .borrow_ref_mut(cs)
                .push_back(PendingBlock(ptr))
                .map_err(|_| Error::DeferredFull)
        })
    }

    /// Hand every queued block to `free`. Returns the number of blocks.
    ///
    /// `free` runs outside the critical section.
    pub fn drain(&self, mut free: impl FnMut(NonNull<u8>)) -> usize {
        let mut count = 0;
        while let Some(PendingBlock(ptr)) =
            critical_section::with(|cs| self.queue.borrow_ref_mut(cs).pop_front())
        {
            free(ptr);
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.queue.borrow_ref(cs).len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dedicated pool for blocks that are released by an interrupt handler,
/// such as buffers handed to a DMA transfer.
///
/// The backing region is allocated from a [`Registry`] and returned to it on
/// drop. Task-context operations drain the pending frees first.
pub struct SendBlockPool<
    'r,
    'pool,
    H: Heap,
    P: Policy = DefaultPolicy,
    const N: usize = DEFAULT_PENDING,
> {
    registry: &'r Registry<'pool, H, P>,
    region: NonNull<u8>,
    pool: spin::Mutex<Pool<'r, P>>,
    pending: DeferredFree<N>,
}

// Safety: `region` is only accessed through `pool`, which is locked, and
//         `pending` synchronizes through critical sections.
unsafe impl<H: Heap + Send, P: Policy, const N: usize> Send for SendBlockPool<'_, '_, H, P, N> {}

unsafe impl<H: Heap + Send, P: Policy, const N: usize> Sync for SendBlockPool<'_, '_, H, P, N> {}

impl<'r, 'pool, H: Heap, P: Policy, const N: usize> SendBlockPool<'r, 'pool, H, P, N> {
    /// Allocate a `size`-byte region from `registry` and build a pool on it.
    #[track_caller]
    pub fn new(
        registry: &'r Registry<'pool, H, P>,
        mem_type: MemType,
        size: usize,
    ) -> Result<Self, Error> {
        let region = registry.try_alloc(mem_type, size)?;
        // Safety: The block is ours until `drop` hands it back
        let pool = unsafe {
            Pool::from_raw(
                region,
                size,
                PoolOptions {
                    name: Some("send block"),
                    ..PoolOptions::INIT
                },
            )
        };
        log::debug!("send block pool: {} bytes at {:p}", size, region);
        Ok(Self {
            registry,
            region,
            pool: spin::Mutex::new(pool),
            pending: DeferredFree::new(),
        })
    }

    #[inline]
    fn lock(&self) -> spin::MutexGuard<'_, Pool<'r, P>> {
        let mut pool = self.pool.lock();
        // Safety: Only blocks of this pool are ever queued
        self.pending.drain(|ptr| unsafe { pool.free(ptr) });
        pool
    }

    #[track_caller]
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.lock().alloc(size)
    }

    /// # Safety
    ///
    /// `ptr` must denote a live block of this pool.
    #[track_caller]
    pub unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        self.lock().realloc(ptr, size)
    }

    /// Free a block from task context.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live block of this pool.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.lock().free(ptr)
    }

    /// Free a block from interrupt context. The block is released by the next
    /// task-context operation.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live block of this pool and must not be used
    /// afterwards.
    pub unsafe fn free_from_isr(&self, ptr: NonNull<u8>) -> Result<(), Error> {
        self.pending.push(ptr)
    }

    /// The number of frees waiting for task context.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Run `f` on the underlying pool after draining the pending frees.
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut Pool<'r, P>) -> R) -> R {
        f(&mut self.lock())
    }
}

impl<H: Heap, P: Policy, const N: usize> Drop for SendBlockPool<'_, '_, H, P, N> {
    fn drop(&mut self) {
        // Safety: `region` came from `registry` and no block of the pool
        //         outlives `self`
        unsafe { self.registry.free(Some(self.region)) };
    }
}
