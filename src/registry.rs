//! The multi-pool registry
use core::{
    fmt,
    mem::MaybeUninit,
    panic::Location,
    ptr::{self, NonNull},
};

use crate::{
    policy::{DefaultPolicy, Origin, Policy},
    Error, Init, LeakPhase, Pool, PoolFlags, PoolOptions,
};

/// The maximum number of pools a [`Registry`] can hold.
pub const MAX_POOLS: usize = 16;

/// The default heap headroom, in bytes.
pub const DEFAULT_HEAP_LIMIT: usize = 5 * 1024;

/// A logical memory type.
///
/// Pools are registered under one of `Pool1`..`Pool15` or `Heap`. `AnyFast`
/// and `AnySlow` are selection policies rather than pools.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemType {
    Pool1 = 0,
    Pool2,
    Pool3,
    Pool4,
    Pool5,
    Pool6,
    Pool7,
    Pool8,
    Pool9,
    Pool10,
    Pool11,
    Pool12,
    Pool13,
    Pool14,
    Pool15,
    /// The platform heap, or a pool registered in its place.
    Heap,
    /// Try every pool from the fastest to the slowest, then the heap.
    AnyFast = 0x80,
    /// Try every pool from the slowest to the fastest, then the heap.
    AnySlow,
    /// Never allocates.
    Unmapped = 0xff,
}

impl MemType {
    /// Get a flag indicating whether `self` is a selection policy.
    #[inline]
    pub const fn is_any(self) -> bool {
        matches!(self, Self::AnyFast | Self::AnySlow)
    }
}

/// The platform allocator the registry falls back to.
///
/// All methods are called with the registry lock held.
pub trait Heap {
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>>;

    fn calloc(&mut self, elem_size: usize, count: usize) -> Option<NonNull<u8>> {
        let size = elem_size.checked_mul(count)?;
        let ptr = self.alloc(size)?;
        // Safety: The block holds at least `size` bytes
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Some(ptr)
    }

    /// # Safety
    ///
    /// `ptr` must denote a live block allocated by `self`.
    unsafe fn realloc(&mut self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must denote a live block allocated by `self`.
    unsafe fn free(&mut self, ptr: NonNull<u8>);

    /// The free space left in the heap, if the platform can tell.
    fn free_size(&self) -> Option<usize> {
        None
    }

    /// Get a flag indicating whether `ptr` looks like a block of this heap.
    fn owns(&self, _ptr: NonNull<u8>) -> bool {
        true
    }
}

/// A heap that never hands out memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHeap;

impl Init for NoHeap {
    const INIT: Self = Self;
}

impl Heap for NoHeap {
    fn alloc(&mut self, _size: usize) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn realloc(&mut self, _ptr: NonNull<u8>, _size: usize) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        log::warn!("free of unknown pointer {:p}", ptr);
    }

    fn free_size(&self) -> Option<usize> {
        Some(0)
    }

    fn owns(&self, _ptr: NonNull<u8>) -> bool {
        false
    }
}

/// A pool can stand in for the platform heap.
impl<P: Policy> Heap for Pool<'_, P> {
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        Pool::alloc(self, size)
    }

    fn calloc(&mut self, elem_size: usize, count: usize) -> Option<NonNull<u8>> {
        Pool::calloc(self, elem_size, count)
    }

    unsafe fn realloc(&mut self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        Pool::realloc(self, Some(ptr), size)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        Pool::free(self, ptr)
    }

    fn free_size(&self) -> Option<usize> {
        Some(Pool::free_size(self))
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.owns_allocation(ptr)
    }
}

#[cfg(any(test, feature = "std"))]
mod system;
#[cfg(any(test, feature = "std"))]
pub use self::system::SystemHeap;

/// Runtime settings of a [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Heap allocations that would leave less than this many free bytes are
    /// refused. `0` disables the check.
    pub heap_limit: usize,
}

impl Init for RegistryConfig {
    const INIT: Self = Self {
        heap_limit: DEFAULT_HEAP_LIMIT,
    };
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::INIT
    }
}

/// The status of one pool, returned by [`Registry::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub name: Option<&'static str>,
    pub mem_type: Option<MemType>,
    pub base: usize,
    pub size: usize,
    /// `size - allocated`
    pub free: usize,
    pub high_water: usize,
    pub fragments: usize,
    /// The pool is registered but disabled.
    pub unmapped: bool,
    pub performance_index: u32,
}

/// Pools tagged with logical memory types, with a fallback to a platform heap.
///
/// Pools are kept in registration order, which is expected to run from the
/// fastest memory to the slowest. Every public method takes the registry lock
/// once; none of them may be called from interrupt context.
///
/// # Examples
///
/// ```
/// use pmem::{Init, MemType, NoHeap, PoolOptions, Registry, RegistryConfig};
/// use std::mem::MaybeUninit;
///
/// let region = Box::leak(Box::new([MaybeUninit::<u8>::uninit(); 4096]));
/// let registry: Registry<'_, NoHeap> = Registry::new(NoHeap, RegistryConfig::INIT);
/// registry
///     .create_pool(region, PoolOptions { alias: Some(MemType::Pool1), ..PoolOptions::INIT })
///     .unwrap();
///
/// let ptr = registry.alloc(MemType::AnyFast, 64).unwrap();
/// assert!(registry.check_ptr(MemType::Pool1, ptr));
/// unsafe { registry.free(Some(ptr)) };
/// ```
pub struct Registry<'pool, H, P: Policy = DefaultPolicy> {
    inner: spin::Mutex<Inner<'pool, H, P>>,
}

pub(crate) struct Inner<'pool, H, P: Policy> {
    pub(crate) pools: heapless::Vec<Pool<'pool, P>, MAX_POOLS>,
    heap: H,
    config: RegistryConfig,
    pub(crate) initialized: bool,
}

/// What the caller asked for.
#[derive(Debug, Clone, Copy)]
enum Request {
    Alloc(usize),
    Calloc(usize, usize),
}

impl Request {
    #[inline]
    fn size(self) -> Option<usize> {
        match self {
            Self::Alloc(size) => Some(size),
            Self::Calloc(elem_size, count) => elem_size.checked_mul(count),
        }
    }

    fn serve<P: Policy>(self, pool: &mut Pool<'_, P>, origin: Origin) -> Option<NonNull<u8>> {
        match self {
            Self::Alloc(size) => pool.alloc_named(size, origin),
            Self::Calloc(elem_size, count) => pool.calloc_named(elem_size, count, origin),
        }
    }
}

impl<'pool, H: Heap, P: Policy> Registry<'pool, H, P> {
    /// Create a registry without pools.
    pub const fn new(heap: H, config: RegistryConfig) -> Self {
        Self {
            inner: spin::Mutex::new(Inner {
                pools: heapless::Vec::new(),
                heap,
                config,
                initialized: false,
            }),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, Inner<'pool, H, P>> {
        self.inner.lock()
    }

    /// Register a pool. Returns its index.
    pub fn add_pool(&self, pool: Pool<'pool, P>) -> Result<usize, Error> {
        self.lock().add_pool(pool)
    }

    /// Create a pool over `region` and register it.
    pub fn create_pool(
        &self,
        region: &'pool mut [MaybeUninit<u8>],
        options: PoolOptions,
    ) -> Result<usize, Error> {
        self.add_pool(Pool::new(region, options))
    }

    /// Create a pool over a raw region and register it.
    ///
    /// # Safety
    ///
    /// See [`Pool::from_raw`].
    pub unsafe fn create_pool_raw(
        &self,
        ptr: NonNull<u8>,
        len: usize,
        options: PoolOptions,
    ) -> Result<usize, Error> {
        self.add_pool(Pool::from_raw(ptr, len, options))
    }

    /// The number of registered pools, disabled ones included.
    pub fn pool_count(&self) -> usize {
        self.lock().pools.len()
    }

    pub fn config(&self) -> RegistryConfig {
        self.lock().config
    }

    pub fn set_config(&self, config: RegistryConfig) {
        self.lock().config = config;
    }

    /// Allocate `size` bytes from the memory `mem_type` designates.
    #[track_caller]
    #[inline]
    pub fn alloc(&self, mem_type: MemType, size: usize) -> Option<NonNull<u8>> {
        self.alloc_named(mem_type, size, Location::caller())
    }

    pub fn alloc_named(&self, mem_type: MemType, size: usize, origin: Origin) -> Option<NonNull<u8>> {
        self.try_alloc_named(mem_type, size, origin).ok()
    }

    /// Like [`Self::alloc`] but reports why the allocation failed.
    #[track_caller]
    pub fn try_alloc(&self, mem_type: MemType, size: usize) -> Result<NonNull<u8>, Error> {
        self.try_alloc_named(mem_type, size, Location::caller())
    }

    pub fn try_alloc_named(
        &self,
        mem_type: MemType,
        size: usize,
        origin: Origin,
    ) -> Result<NonNull<u8>, Error> {
        self.lock().alloc(mem_type, Request::Alloc(size), origin)
    }

    /// Allocate `elem_size * count` zero-filled bytes.
    #[track_caller]
    #[inline]
    pub fn calloc(&self, mem_type: MemType, elem_size: usize, count: usize) -> Option<NonNull<u8>> {
        self.calloc_named(mem_type, elem_size, count, Location::caller())
    }

    pub fn calloc_named(
        &self,
        mem_type: MemType,
        elem_size: usize,
        count: usize,
        origin: Origin,
    ) -> Option<NonNull<u8>> {
        self.lock()
            .alloc(mem_type, Request::Calloc(elem_size, count), origin)
            .ok()
    }

    /// Resize a block, possibly moving it to another pool.
    ///
    /// `None` allocates from `mem_type`. A block that cannot be resized in
    /// its own pool is moved to a new block from `mem_type`. On failure the
    /// original block is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live block allocated through `self`.
    #[track_caller]
    #[inline]
    pub unsafe fn realloc(
        &self,
        mem_type: MemType,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        self.realloc_named(mem_type, ptr, size, Location::caller())
    }

    /// # Safety
    ///
    /// See [`Self::realloc`].
    pub unsafe fn realloc_named(
        &self,
        mem_type: MemType,
        ptr: Option<NonNull<u8>>,
        size: usize,
        origin: Origin,
    ) -> Option<NonNull<u8>> {
        self.lock().realloc(mem_type, ptr, size, origin).ok()
    }

    /// Free a block. `None` is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live block allocated through `self`.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        if let Some(ptr) = ptr {
            self.lock().free(ptr);
        }
    }

    /// Allocation hook for collaborators: the fastest memory first.
    #[track_caller]
    #[inline]
    pub fn generic_malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.alloc_named(MemType::AnyFast, size, Location::caller())
    }

    /// Allocation hook for collaborators: the slowest memory first.
    #[track_caller]
    #[inline]
    pub fn generic_malloc_slow(&self, size: usize) -> Option<NonNull<u8>> {
        self.alloc_named(MemType::AnySlow, size, Location::caller())
    }

    /// Reallocation hook for collaborators.
    ///
    /// Unlike [`Self::realloc`], a failed resize releases the old block and
    /// retries with a fresh allocation, which may come from any pool. The
    /// contents are lost in that case.
    ///
    /// # Safety
    ///
    /// See [`Self::realloc`].
    #[track_caller]
    #[inline]
    pub unsafe fn generic_realloc_fast(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        self.lock()
            .generic_realloc(MemType::AnyFast, ptr, size, Location::caller())
    }

    /// # Safety
    ///
    /// See [`Self::realloc`].
    #[track_caller]
    #[inline]
    pub unsafe fn generic_realloc_slow(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        self.lock()
            .generic_realloc(MemType::AnySlow, ptr, size, Location::caller())
    }

    /// Free hook for collaborators.
    ///
    /// # Safety
    ///
    /// See [`Self::free`].
    #[inline]
    pub unsafe fn generic_free(&self, ptr: Option<NonNull<u8>>) {
        self.free(ptr)
    }

    /// Replace the NUL-terminated string in `slot` with a copy of `new`.
    ///
    /// `None` frees the slot and clears it. Returns `false` if the storage
    /// could not be resized, in which case `slot` is left as is.
    ///
    /// # Safety
    ///
    /// `*slot` must be `None` or denote a live block allocated through
    /// `self`.
    #[track_caller]
    pub unsafe fn update_string(&self, slot: &mut Option<NonNull<u8>>, new: Option<&str>) -> bool {
        let origin = Location::caller();
        let mut inner = self.lock();
        let new = match new {
            Some(new) => new,
            None => {
                if let Some(ptr) = slot.take() {
                    inner.free(ptr);
                }
                return true;
            }
        };

        let len = new.len();
        match inner.realloc(MemType::AnySlow, *slot, len + 1, origin) {
            Ok(ptr) => {
                ptr::copy_nonoverlapping(new.as_ptr(), ptr.as_ptr(), len);
                ptr.as_ptr().add(len).write(0);
                *slot = Some(ptr);
                true
            }
            Err(e) => {
                log::warn!("update_string: {}", e);
                false
            }
        }
    }

    /// Get a flag indicating whether `ptr` points inside a used block of the
    /// memory `mem_type` designates.
    pub fn check_ptr(&self, mem_type: MemType, ptr: NonNull<u8>) -> bool {
        self.lock().check_ptr(mem_type, ptr)
    }

    /// Resolve a memory type by pool name. `"HEAP"` always maps to
    /// [`MemType::Heap`].
    pub fn type_from_name(&self, name: &str) -> MemType {
        if name == "HEAP" {
            return MemType::Heap;
        }
        self.lock()
            .pools
            .iter()
            .find(|pool| pool.name() == Some(name))
            .and_then(|pool| pool.alias())
            .unwrap_or(MemType::Unmapped)
    }

    /// Run `f` on the usable pool registered under `mem_type`.
    ///
    /// `f` runs with the registry locked and must not call back into it.
    pub fn pool_from_type<R>(
        &self,
        mem_type: MemType,
        f: impl FnOnce(&mut Pool<'pool, P>) -> R,
    ) -> Option<R> {
        let mut inner = self.lock();
        let i = inner.find_pool(mem_type)?;
        Some(f(&mut inner.pools[i]))
    }

    /// Run `f` on the pool whose region contains `ptr`.
    ///
    /// `f` runs with the registry locked and must not call back into it.
    pub fn pool_from_ptr<R>(
        &self,
        ptr: NonNull<u8>,
        f: impl FnOnce(&mut Pool<'pool, P>) -> R,
    ) -> Option<R> {
        let mut inner = self.lock();
        let i = inner.pool_of(ptr)?;
        Some(f(&mut inner.pools[i]))
    }

    /// Get the payload size of a pool block. `0` for anything else.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live block allocated through `self`.
    pub unsafe fn size_of_ptr(&self, ptr: NonNull<u8>) -> usize {
        let inner = self.lock();
        match inner.pool_of(ptr) {
            Some(i) => inner.pools[i].size_of(Some(ptr)),
            None => 0,
        }
    }

    /// Empty the pool registered under `mem_type`. Selection policies are
    /// ignored.
    ///
    /// Every block of the pool is lost.
    pub fn reset(&self, mem_type: MemType) {
        if mem_type.is_any() {
            return;
        }
        let mut inner = self.lock();
        if let Some(i) = inner.find_pool(mem_type) {
            inner.pools[i].reset();
        }
    }

    /// Run [`Pool::leak_detector`] on the pool registered under `mem_type`,
    /// or on every usable pool for the selection policies. Returns the total
    /// number of blocks reported.
    ///
    /// `tag` must not be `0`.
    pub fn leak_detector(
        &self,
        mem_type: MemType,
        phase: LeakPhase,
        tag: i16,
        out: &mut dyn fmt::Write,
    ) -> usize {
        let mut inner = self.lock();
        if mem_type.is_any() {
            inner
                .pools
                .iter_mut()
                .filter(|pool| pool.is_usable())
                .map(|pool| pool.leak_detector(phase, tag, &mut *out))
                .sum()
        } else {
            match inner.find_pool(mem_type) {
                Some(i) => inner.pools[i].leak_detector(phase, tag, out),
                None => 0,
            }
        }
    }

    /// The status of every registered pool.
    pub fn info(&self) -> heapless::Vec<PoolStatus, MAX_POOLS> {
        self.lock()
            .pools
            .iter()
            .map(|pool| PoolStatus {
                name: pool.name(),
                mem_type: pool.alias(),
                base: pool.base().as_ptr() as usize,
                size: pool.size(),
                free: pool.size() - pool.allocated(),
                high_water: pool.high_water(),
                fragments: pool.fragments(),
                unmapped: pool.flags().contains(PoolFlags::DISABLED),
                performance_index: pool.performance_index(),
            })
            .collect()
    }

    /// Write the blocks of every usable pool to `out`.
    pub fn print_frags(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let inner = self.lock();
        for pool in inner.pools.iter().filter(|pool| pool.is_usable()) {
            pool.print_frags(pool.name().unwrap_or("pool"), out)?;
        }
        Ok(())
    }
}

impl<'pool, H: Heap, P: Policy> Inner<'pool, H, P> {
    pub(crate) fn add_pool(&mut self, pool: Pool<'pool, P>) -> Result<usize, Error> {
        let index = self.pools.len();
        log::debug!(
            "registering pool #{} {:?} as {:?}",
            index,
            pool.name(),
            pool.alias()
        );
        self.pools
            .push(pool)
            .map_err(|_| Error::RegistryFull(MAX_POOLS))?;
        Ok(index)
    }

    /// Find the usable pool registered under `mem_type`.
    fn find_pool(&self, mem_type: MemType) -> Option<usize> {
        self.pools
            .iter()
            .position(|pool| pool.alias() == Some(mem_type) && pool.is_usable())
    }

    /// Find the usable pool containing `ptr`. Nested regions resolve to the
    /// smallest one.
    fn pool_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.pools
            .iter()
            .enumerate()
            .filter(|(_, pool)| pool.check_ptr(ptr))
            .min_by_key(|(_, pool)| pool.size())
            .map(|(i, _)| i)
    }

    fn alloc(
        &mut self,
        mem_type: MemType,
        request: Request,
        origin: Origin,
    ) -> Result<NonNull<u8>, Error> {
        let served = match mem_type {
            MemType::Unmapped => return Err(Error::Unmapped(mem_type)),
            MemType::AnyFast => self
                .pools
                .iter_mut()
                .filter(|pool| pool.is_usable())
                .find_map(|pool| request.serve(pool, origin)),
            MemType::AnySlow => self
                .pools
                .iter_mut()
                .rev()
                .filter(|pool| pool.is_usable())
                .find_map(|pool| request.serve(pool, origin)),
            _ => match self.find_pool(mem_type) {
                Some(i) => request.serve(&mut self.pools[i], origin),
                None => None,
            },
        };
        if let Some(ptr) = served {
            return Ok(ptr);
        }

        if mem_type.is_any() {
            return self.alloc(MemType::Heap, request, origin);
        }
        self.alloc_heap(request)
    }

    fn alloc_heap(&mut self, request: Request) -> Result<NonNull<u8>, Error> {
        let size = request.size().ok_or(Error::Overflow)?;
        let limit = self.config.heap_limit;
        if limit != 0 {
            match self.heap.free_size() {
                Some(free) => {
                    if free.checked_sub(size).map_or(true, |rest| rest < limit) {
                        log::warn!(
                            "heap allocation of {} bytes refused ({} bytes free, limit {})",
                            size,
                            free,
                            limit
                        );
                        return Err(Error::Headroom { size, limit });
                    }
                }
                None => log::error!("the heap cannot report its free space; headroom not enforced"),
            }
        }

        let ptr = match request {
            Request::Alloc(size) => self.heap.alloc(size),
            Request::Calloc(elem_size, count) => self.heap.calloc(elem_size, count),
        };
        ptr.ok_or(Error::Exhausted(size))
    }

    unsafe fn realloc(
        &mut self,
        mem_type: MemType,
        ptr: Option<NonNull<u8>>,
        size: usize,
        origin: Origin,
    ) -> Result<NonNull<u8>, Error> {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return self.alloc(mem_type, Request::Alloc(size), origin),
        };

        let i = match self.pool_of(ptr) {
            Some(i) => i,
            None => return self.heap.realloc(ptr, size).ok_or(Error::Exhausted(size)),
        };

        let pool = &mut self.pools[i];
        let prev_size = pool.size_of(Some(ptr));
        if let Some(new_ptr) = pool.realloc_named(Some(ptr), size, origin) {
            return Ok(new_ptr);
        }

        // Try elsewhere before giving up
        let new_ptr = self.alloc(mem_type, Request::Alloc(size), origin)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), prev_size.min(size));
        self.pools[i].free(ptr);
        Ok(new_ptr)
    }

    unsafe fn generic_realloc(
        &mut self,
        mem_type: MemType,
        ptr: Option<NonNull<u8>>,
        size: usize,
        origin: Origin,
    ) -> Option<NonNull<u8>> {
        match self.realloc(mem_type, ptr, size, origin) {
            Ok(new_ptr) => Some(new_ptr),
            Err(_) => {
                if let Some(ptr) = ptr {
                    self.free(ptr);
                }
                self.alloc(mem_type, Request::Alloc(size), origin).ok()
            }
        }
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        match self.pool_of(ptr) {
            Some(i) => self.pools[i].free(ptr),
            None => self.heap.free(ptr),
        }
    }

    fn check_ptr(&self, mem_type: MemType, ptr: NonNull<u8>) -> bool {
        // Without pools everything comes from the heap
        let mem_type = if self.pools.is_empty() {
            MemType::Heap
        } else {
            mem_type
        };

        match mem_type {
            MemType::Heap => self.heap.owns(ptr),
            MemType::AnyFast | MemType::AnySlow => self
                .pools
                .iter()
                .any(|pool| pool.is_usable() && pool.owns_allocation(ptr)),
            MemType::Unmapped => false,
            _ => self
                .find_pool(mem_type)
                .map_or(false, |i| self.pools[i].owns_allocation(ptr)),
        }
    }
}

#[cfg(test)]
mod tests;
