//! The block allocator core
use core::{
    fmt,
    marker::PhantomData,
    mem::{self, MaybeUninit},
    ops::BitOr,
    panic::Location,
    ptr::{self, NonNull},
};

use crate::{
    policy::{BlockHeader, DefaultPolicy, Origin, Policy, FILL_PATTERN},
    Corruption, Error, Init, MemType,
};

/// The default block alignment.
pub const DEFAULT_ALIGN: usize = 4;

/// The bit of a block's `size_and_flags` telling that the block is free.
const BLK_FREE: usize = 1;
/// The bit of a block's `size_and_flags` telling that the block is the last
/// one of the pool.
const BLK_END: usize = 2;
const BLK_FLAGS: usize = BLK_FREE | BLK_END;

/// The number of payload bytes dumped for every block in a leak report.
const LEAK_DUMP_LEN: usize = 10;

#[doc = svgbobdoc::transform!(
/// A pool of variable-size blocks carved out of one fixed memory region.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///  base                                                              base + size
///   |                                                                        |
///   v                                                                        v
///   +-----+----------+-----+-------------------+-----+------+-----+----------+
///   | hdr | payload  | hdr |      payload      | hdr |      | hdr | payload  |
///   |  +  | 48 bytes |  -  |     200 bytes     |  +  |  0   | - E | 40 bytes |
///   +--+--+----------+--+--+-------------------+--+--+------+--+--+----------+
///      |             ^  |                      ^  |         ^
///      '-------------'  '----------------------'  '---------'
///       hdr + size        hdr + size               hdr + size
///
///   "+": used    "-": free    "E": last block of the pool
/// ```
/// </center>
///
/// Blocks form a chain that is never stored: the next block starts right
/// after the current payload. Every header is [`header_size`] bytes long and
/// the payload that follows it is aligned to [`align`] bytes.
///
/// Allocation picks the best fitting free block (the first exact match, else
/// the smallest larger one) and splits it when the surplus can host another
/// header. Freeing merges every run of adjacent free blocks, so no two free
/// blocks are ever adjacent between calls.
///
/// # Bookkeeping
///
/// [`allocated`] counts every header, free or used, plus every used payload;
/// a pool without allocations reports exactly one header. The high-water
/// mark and the number of blocks are kept alongside.
///
/// [`header_size`]: Self::header_size
/// [`align`]: Self::align
/// [`allocated`]: Self::allocated
)]
#[derive(Debug)]
pub struct Pool<'pool, P: Policy = DefaultPolicy> {
    base: NonNull<u8>,
    /// The usable region size. A multiple of `align`.
    size: usize,
    header_size: usize,
    align: usize,
    allocated: usize,
    high_water: usize,
    frags: usize,
    check_count: u32,
    check_every: u32,
    flags: PoolFlags,
    name: Option<&'static str>,
    alias: Option<MemType>,
    perf_index: u32,
    _phantom: PhantomData<(&'pool mut (), P)>,
}

// Safety: The region referenced by a `Pool` is logically owned by that `Pool`
//         and is only accessed through `&mut self` or, for reads, `&self`.
unsafe impl<P: Policy> Send for Pool<'_, P> {}

unsafe impl<P: Policy> Sync for Pool<'_, P> {}

/// Informational and behavioural pool flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolFlags(u32);

impl PoolFlags {
    pub const EMPTY: Self = Self(0);
    /// The region lives in on-chip memory.
    pub const EMBEDDED: Self = Self(0x8000);
    /// The pool exists but must not hand out memory.
    pub const DISABLED: Self = Self(0x4000);
    /// The region is not expected to change after initialization.
    pub const READ_ONLY: Self = Self(0x2000);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// `self | other` in constant context.
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for PoolFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// The parameters of [`Pool::new`].
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// The block alignment. Values that are not a power of two or are below
    /// [`DEFAULT_ALIGN`] are replaced by [`DEFAULT_ALIGN`].
    pub align: usize,
    pub flags: PoolFlags,
    pub name: Option<&'static str>,
    /// The logical type the pool answers to in a [`Registry`].
    ///
    /// [`Registry`]: crate::Registry
    pub alias: Option<MemType>,
    /// Audit the chain every `check_every` alloc/realloc calls. `0` only
    /// audits on free. Ignored by policies without checks.
    pub check_every: u32,
}

impl Init for PoolOptions {
    const INIT: Self = Self {
        align: DEFAULT_ALIGN,
        flags: PoolFlags::EMPTY,
        name: None,
        alias: None,
        check_every: 0,
    };
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::INIT
    }
}

/// The two passes of [`Pool::leak_detector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakPhase {
    /// Stamp every block with the tag.
    Snapshot,
    /// Report every used block whose tag differs.
    Report,
}

/// A summary returned by [`Pool::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolInfo {
    /// The sum of the used payloads.
    pub occupied: usize,
    /// The sum of the free payloads.
    pub free: usize,
    /// The largest free payload.
    pub largest_free: usize,
    /// The number of blocks, free or used.
    pub fragments: usize,
}

/// One block as seen by [`Pool::blocks`].
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    /// The start of the payload.
    pub ptr: NonNull<u8>,
    pub size: usize,
    pub free: bool,
    /// Always `0` for policies without tags.
    pub tag: i16,
    pub origin: Option<Origin>,
}

/// A block header together with its offset from the pool base.
#[derive(Clone, Copy)]
struct Block<H> {
    off: usize,
    hdr: H,
}

impl<H: BlockHeader> Block<H> {
    #[inline]
    fn size(&self) -> usize {
        self.hdr.size_and_flags() & !BLK_FLAGS
    }

    #[inline]
    fn flags(&self) -> usize {
        self.hdr.size_and_flags() & BLK_FLAGS
    }

    #[inline]
    fn is_free(&self) -> bool {
        (self.flags() & BLK_FREE) != 0
    }

    #[inline]
    fn is_end(&self) -> bool {
        (self.flags() & BLK_END) != 0
    }

    #[inline]
    fn set(&mut self, size: usize, flags: usize) {
        debug_assert_eq!(size & BLK_FLAGS, 0);
        self.hdr.set_size_and_flags(size | flags);
    }

    /// The offset of the block following this one.
    #[inline]
    fn next_off(&self, header_size: usize) -> usize {
        self.off + header_size + self.size()
    }
}

impl<P: Policy> Init for Pool<'_, P> {
    const INIT: Self = Self::INIT;
}

impl<P: Policy> Default for Pool<'_, P> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<'pool, P: Policy> Pool<'pool, P> {
    /// A pool without a region. Every allocation fails.
    pub const INIT: Self = Self {
        base: NonNull::dangling(),
        size: 0,
        header_size: 0,
        align: DEFAULT_ALIGN,
        allocated: 0,
        high_water: 0,
        frags: 0,
        check_count: 0,
        check_every: 0,
        flags: PoolFlags::EMPTY,
        name: None,
        alias: None,
        perf_index: 0,
        _phantom: PhantomData,
    };

    /// Create a pool over a region.
    ///
    /// The start of the region is rounded up and its length rounded down to
    /// the alignment. If what remains cannot host more than one header, or
    /// `options.flags` contains [`PoolFlags::DISABLED`], the pool has no
    /// capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use pmem::{Init, Pool, PoolOptions};
    /// use std::mem::MaybeUninit;
    /// let mut region = [MaybeUninit::uninit(); 1024];
    /// let mut pool: Pool = Pool::new(&mut region, PoolOptions::INIT);
    /// let ptr = pool.alloc(100).unwrap();
    /// unsafe { pool.free(ptr) };
    /// ```
    pub fn new(region: &'pool mut [MaybeUninit<u8>], options: PoolOptions) -> Self {
        let len = region.len();
        // Safety: `region` is a mutable reference, which guarantees the absence
        // of aliasing references. Being `'pool` means it will outlive `self`.
        unsafe {
            Self::from_raw(
                NonNull::new_unchecked(region.as_mut_ptr().cast::<u8>()),
                len,
                options,
            )
        }
    }

    /// Create a pool over a region specified by its address and length.
    ///
    /// # Safety
    ///
    /// The region will be considered owned by the pool. It must be valid for
    /// reads and writes for `len` bytes and must outlive the pool.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize, options: PoolOptions) -> Self {
        let align = if options.align.is_power_of_two() && options.align >= DEFAULT_ALIGN {
            options.align
        } else {
            DEFAULT_ALIGN
        };
        let header_size = round_up(mem::size_of::<P::Header>(), align);

        let unaligned_start = ptr.as_ptr() as usize;
        let start = unaligned_start.wrapping_add(align - 1) & !(align - 1);
        let size = len
            .checked_sub(start.wrapping_sub(unaligned_start))
            .filter(|_| start != 0)
            .map_or(0, |x| x & !(align - 1));

        let mut pool = Self {
            base: if size == 0 {
                NonNull::dangling()
            } else {
                // Safety: `start` was checked to be non-zero
                NonNull::new_unchecked(start as *mut u8)
            },
            size,
            header_size,
            align,
            flags: options.flags,
            name: options.name,
            alias: options.alias,
            check_every: options.check_every,
            ..Self::INIT
        };
        pool.reset();

        log::trace!(
            "pool {}: {:p} + {:#x}, header {} bytes, usable {}",
            pool.display_name(),
            pool.base,
            pool.size,
            pool.header_size,
            pool.is_usable()
        );
        pool
    }

    /// Discard every block and restore the initial free block.
    pub fn reset(&mut self) {
        self.check_count = 0;
        if !self.is_usable() {
            self.allocated = 0;
            self.high_water = 0;
            self.frags = 0;
            return;
        }

        if P::FILL {
            self.fill(0, self.size);
        }

        let mut first = Block {
            off: 0,
            hdr: P::Header::new(0),
        };
        first.set(self.size - self.header_size, BLK_FREE | BLK_END);
        self.store(&first);

        self.allocated = self.header_size;
        self.high_water = self.header_size;
        self.frags = 1;
    }

    /// Release the pool. The region is left as is.
    pub fn term(&mut self) {
        log::trace!(
            "pool {}: terminated with {} bytes allocated",
            self.display_name(),
            self.allocated
        );
    }

    /// Get a flag indicating whether the pool can hand out memory at all.
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.size > self.header_size && !self.flags.contains(PoolFlags::DISABLED)
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The usable region size.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    #[inline]
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// The number of blocks, free or used.
    #[inline]
    pub fn fragments(&self) -> usize {
        self.frags
    }

    #[inline]
    pub fn flags(&self) -> PoolFlags {
        self.flags
    }

    #[inline]
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    #[inline]
    pub fn alias(&self) -> Option<MemType> {
        self.alias
    }

    #[inline]
    pub fn check_every(&self) -> u32 {
        self.check_every
    }

    #[inline]
    pub fn set_check_every(&mut self, check_every: u32) {
        self.check_every = check_every;
    }

    /// Memory accesses per microsecond as measured by the board.
    #[inline]
    pub fn performance_index(&self) -> u32 {
        self.perf_index
    }

    #[inline]
    pub fn set_performance_index(&mut self, perf_index: u32) {
        self.perf_index = perf_index;
    }

    /// The bytes that can still be handed out, ignoring fragmentation.
    #[inline]
    pub fn free_size(&self) -> usize {
        if !self.is_usable() {
            return 0;
        }
        self.size - self.allocated + self.header_size
    }

    /// Get a flag indicating whether `addr` falls inside the region.
    #[inline]
    fn contains_addr(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        self.size != 0 && addr >= base && addr - base <= self.size
    }

    fn display_name(&self) -> &'static str {
        self.name.unwrap_or("pool")
    }

    /// Attempt to allocate a block of `size` bytes.
    ///
    /// Returns the starting address of the payload on success; `None`
    /// otherwise. The allocation is attributed to the caller.
    ///
    /// # Panics
    ///
    /// Halts through [`Policy::on_corruption`] if the chain is corrupted.
    #[track_caller]
    #[inline]
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.alloc_named(size, Location::caller())
    }

    /// [`Self::alloc`] with an explicit origin.
    pub fn alloc_named(&mut self, size: usize, origin: Origin) -> Option<NonNull<u8>> {
        let result = self.alloc_at(size, Some(origin));
        self.settle(result)
    }

    /// Like [`Self::alloc`] but reports why the allocation failed.
    #[track_caller]
    pub fn try_alloc(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        self.alloc_at(size, Some(Location::caller()))
    }

    /// Allocate `elem_size * count` zero-filled bytes.
    #[track_caller]
    #[inline]
    pub fn calloc(&mut self, elem_size: usize, count: usize) -> Option<NonNull<u8>> {
        self.calloc_named(elem_size, count, Location::caller())
    }

    /// [`Self::calloc`] with an explicit origin.
    pub fn calloc_named(
        &mut self,
        elem_size: usize,
        count: usize,
        origin: Origin,
    ) -> Option<NonNull<u8>> {
        let result = self.calloc_at(elem_size, count, Some(origin));
        self.settle(result)
    }

    #[track_caller]
    pub fn try_calloc(&mut self, elem_size: usize, count: usize) -> Result<NonNull<u8>, Error> {
        self.calloc_at(elem_size, count, Some(Location::caller()))
    }

    /// Resize a block, moving it if it cannot grow in place.
    ///
    /// `None` allocates a new block. On failure the original block is left
    /// untouched and `None` is returned.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block previously allocated from `self` and not
    /// freed since.
    #[track_caller]
    #[inline]
    pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        self.realloc_named(ptr, size, Location::caller())
    }

    /// [`Self::realloc`] with an explicit origin.
    ///
    /// # Safety
    ///
    /// See [`Self::realloc`].
    pub unsafe fn realloc_named(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        origin: Origin,
    ) -> Option<NonNull<u8>> {
        let result = self.realloc_at(ptr, size, Some(origin));
        self.settle(result)
    }

    /// # Safety
    ///
    /// See [`Self::realloc`].
    #[track_caller]
    pub unsafe fn try_realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, Error> {
        self.realloc_at(ptr, size, Some(Location::caller()))
    }

    /// Free a block.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block previously allocated from `self` and not
    /// freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let result = self.try_free(ptr);
        self.settle(result);
    }

    /// # Safety
    ///
    /// See [`Self::free`].
    pub unsafe fn try_free(&mut self, ptr: NonNull<u8>) -> Result<(), Error> {
        if !self.is_usable() {
            return Err(Error::Disabled);
        }

        self.periodic_check(true)?;

        let block = self.block_of(ptr)?;
        log::trace!("pool {}: free {:p} ({} bytes)", self.display_name(), ptr, block.size());
        self.release(block)?;
        self.coalesce_all()?;
        Ok(())
    }

    /// Get the payload size of a block. `0` for `None` and unusable pools.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block previously allocated from `self` and not
    /// freed since.
    pub unsafe fn size_of(&self, ptr: Option<NonNull<u8>>) -> usize {
        match ptr {
            Some(ptr) if self.is_usable() => match self.block_of(ptr) {
                Ok(block) => block.size(),
                Err(c) => P::on_corruption(self.name, c),
            },
            _ => 0,
        }
    }

    /// Get a flag indicating whether `ptr` falls inside the region and, with
    /// checking policies, is preceded by a block header.
    pub fn check_ptr(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        if !self.is_usable() || !self.contains_addr(addr) {
            return false;
        }
        if !P::CHECKS {
            return true;
        }
        let off = addr - self.base.as_ptr() as usize;
        match off.checked_sub(self.header_size) {
            Some(off) if off % self.align == 0 => self.load(off).is_ok(),
            _ => false,
        }
    }

    /// Get a flag indicating whether `ptr` points inside the payload of a
    /// used block.
    pub fn owns_allocation(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        if !self.is_usable() || !self.contains_addr(addr) {
            return false;
        }
        self.blocks().any(|block| {
            let start = block.ptr.as_ptr() as usize;
            !block.free && addr >= start && addr - start < block.size.max(1)
        })
    }

    /// Walk the chain and compare it with the pool's counters.
    pub fn check(&self) -> Result<(), Corruption> {
        if !self.is_usable() {
            return Ok(());
        }

        let (mut count, mut used, mut free) = (0usize, 0usize, 0usize);
        let mut block = self.load(0)?;
        loop {
            count += 1;
            if block.is_free() {
                free += block.size();
            } else {
                used += block.size();
            }
            if block.is_end() {
                break;
            }
            block = self.load(block.next_off(self.header_size))?;
        }

        let allocated = count * self.header_size + used;
        audit("pool size", allocated + free, self.size)?;
        audit("allocated bytes", allocated, self.allocated)?;
        audit("fragments", count, self.frags)?;
        Ok(())
    }

    /// Check on the configured cadence that writing `len` bytes at `ptr`
    /// stays inside the used block containing `ptr`.
    pub fn check_write(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), Corruption> {
        if !P::CHECKS || !self.is_usable() || !self.tick(false) {
            return Ok(());
        }

        let addr = ptr.as_ptr() as usize;
        for block in self.blocks() {
            let start = block.ptr.as_ptr() as usize;
            if block.free || addr < start || addr - start > block.size {
                continue;
            }
            let offset = addr - self.base.as_ptr() as usize;
            return if len <= block.size - (addr - start) {
                Ok(())
            } else {
                Err(Corruption::Overrun { offset, len })
            };
        }
        Err(Corruption::ForeignPointer { addr })
    }

    /// Tag blocks to find allocations that outlive a code section.
    ///
    /// [`LeakPhase::Snapshot`] stamps every block with `tag`.
    /// [`LeakPhase::Report`] writes one line per used block whose tag differs
    /// to `out` and returns the number of such blocks. Policies without tags
    /// report nothing.
    ///
    /// `tag` must not be `0`, which is the tag of every freshly allocated
    /// block.
    pub fn leak_detector(&mut self, phase: LeakPhase, tag: i16, out: &mut dyn fmt::Write) -> usize {
        debug_assert_ne!(tag, 0, "tag 0 is reserved for fresh blocks");
        if !P::CHECKS || !self.is_usable() {
            return 0;
        }

        match phase {
            LeakPhase::Snapshot => {
                let mut off = Some(0);
                while let Some(o) = off {
                    let mut block = self.load_or_halt(o);
                    block.hdr.set_user_tag(tag);
                    self.store(&block);
                    off = (!block.is_end()).then(|| block.next_off(self.header_size));
                }
                0
            }
            LeakPhase::Report => {
                let mut leaks = 0;
                for block in self.blocks().filter(|b| !b.free && b.tag != tag) {
                    leaks += 1;
                    let _ = self.write_leak(out, &block);
                }
                if leaks != 0 {
                    log::warn!("pool {}: {} block(s) leaked", self.display_name(), leaks);
                }
                leaks
            }
        }
    }

    fn write_leak(&self, out: &mut dyn fmt::Write, block: &BlockInfo) -> fmt::Result {
        write!(
            out,
            "leak\t{}\t{:p}\t{}\t",
            self.display_name(),
            block.ptr,
            block.size
        )?;
        write_origin(out, block.origin)?;
        if P::FILL {
            // Safety: Payloads of filling policies are always initialized
            let dump = unsafe {
                core::slice::from_raw_parts(block.ptr.as_ptr(), block.size.min(LEAK_DUMP_LEN))
            };
            out.write_char('\t')?;
            for byte in dump {
                write!(out, "{:02x} ", byte)?;
            }
            out.write_char('\t')?;
            for &byte in dump {
                out.write_char(if byte.is_ascii_graphic() {
                    byte as char
                } else {
                    '.'
                })?;
            }
        }
        out.write_char('\n')
    }

    /// Write one line per block to `out`.
    pub fn print_frags(&self, title: &str, out: &mut dyn fmt::Write) -> fmt::Result {
        for (i, block) in self.blocks().enumerate() {
            write!(
                out,
                "poolFrag\t{}\t{}\t{}\t{:p}\t{}\t",
                title,
                if block.free { '-' } else { '+' },
                i,
                block.ptr,
                block.size
            )?;
            write_origin(out, block.origin)?;
            out.write_char('\n')?;
        }
        Ok(())
    }

    /// Iterate over every block of the pool.
    ///
    /// # Panics
    ///
    /// Halts through [`Policy::on_corruption`] if the chain is corrupted.
    pub fn blocks(&self) -> Blocks<'_, 'pool, P> {
        Blocks {
            pool: self,
            next: self.is_usable().then_some(0),
        }
    }

    /// Summarize the chain.
    pub fn info(&self) -> PoolInfo {
        self.blocks().fold(PoolInfo::default(), |mut info, block| {
            if block.free {
                info.free += block.size;
                info.largest_free = info.largest_free.max(block.size);
            } else {
                info.occupied += block.size;
            }
            info.fragments += 1;
            info
        })
    }

    fn settle<T>(&self, result: Result<T, Error>) -> Option<T> {
        match result {
            Ok(x) => Some(x),
            Err(Error::CorruptChain(c)) => P::on_corruption(self.name, c),
            Err(e) => {
                log::trace!("pool {}: {}", self.display_name(), e);
                None
            }
        }
    }

    fn alloc_at(&mut self, size: usize, origin: Option<Origin>) -> Result<NonNull<u8>, Error> {
        if !self.is_usable() {
            return Err(Error::Disabled);
        }
        self.periodic_check(false)?;
        self.alloc_unchecked(size, origin)
    }

    /// Allocate without advancing the check cadence.
    fn alloc_unchecked(&mut self, size: usize, origin: Option<Origin>) -> Result<NonNull<u8>, Error> {
        let rounded = self.round(size).ok_or(Error::Overflow)?;
        let block = self
            .find_best_fit(rounded)?
            .ok_or(Error::Exhausted(size))?;
        let ptr = self.carve(block, rounded, 0, origin)?;
        log::trace!("pool {}: alloc {} -> {:p}", self.display_name(), size, ptr);
        Ok(ptr)
    }

    fn calloc_at(
        &mut self,
        elem_size: usize,
        count: usize,
        origin: Option<Origin>,
    ) -> Result<NonNull<u8>, Error> {
        let size = elem_size.checked_mul(count).ok_or(Error::Overflow)?;
        let ptr = self.alloc_at(size, origin)?;
        // Safety: The block holds at least `size` bytes
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    unsafe fn realloc_at(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        origin: Option<Origin>,
    ) -> Result<NonNull<u8>, Error> {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return self.alloc_at(size, origin),
        };
        if !self.is_usable() {
            return Err(Error::Disabled);
        }

        let rounded = self.round(size).ok_or(Error::Overflow)?;
        self.periodic_check(false)?;
        self.coalesce_all()?;

        let block = self.block_of(ptr)?;
        if block.is_free() {
            return Err(Corruption::DoubleFree { offset: block.off }.into());
        }
        let prev_size = block.size();
        if rounded == prev_size {
            return Ok(ptr);
        }

        let mut max_contiguous = prev_size;
        if !block.is_end() {
            let next = self.load(block.next_off(self.header_size))?;
            if next.is_free() {
                max_contiguous += self.header_size + next.size();
            }
        }

        // In place only if the run can also hold a header for the remainder
        if max_contiguous >= rounded.saturating_add(self.header_size) {
            // Resize in place. The payload is kept as is.
            let tag = block.hdr.user_tag();
            let mut block = block;
            self.account_sub(prev_size)?;
            block.set(prev_size, block.flags() | BLK_FREE);
            self.store(&block);
            let block = self.coalesce_from(block)?;
            let new_ptr = self.carve(block, rounded, tag, origin)?;
            debug_assert_eq!(new_ptr, ptr);
            log::trace!(
                "pool {}: realloc {:p} in place, {} -> {}",
                self.display_name(),
                ptr,
                prev_size,
                rounded
            );
            return Ok(new_ptr);
        }

        // Allocate the new block before releasing the old one so that a
        // failure leaves the original intact
        let new_ptr = self.alloc_unchecked(size, origin)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), prev_size.min(size));

        // Carving never touches a used block's header
        self.release(block)?;
        self.coalesce_all()?;
        log::trace!(
            "pool {}: realloc {:p} -> {:p}, {} -> {}",
            self.display_name(),
            ptr,
            new_ptr,
            prev_size,
            rounded
        );
        Ok(new_ptr)
    }

    /// Round `size` up to the alignment.
    #[inline]
    fn round(&self, size: usize) -> Option<usize> {
        Some(size.checked_add(self.align - 1)? & !(self.align - 1))
    }

    #[inline]
    fn header_ptr(&self, off: usize) -> *mut P::Header {
        self.base.as_ptr().wrapping_add(off).cast()
    }

    #[inline]
    fn payload(&self, off: usize) -> NonNull<u8> {
        // Safety: Payloads lie inside the region, which starts at a non-null
        //         address
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(off + self.header_size)) }
    }

    /// Read the header at `off`, making sure the block fits in the region.
    fn load(&self, off: usize) -> Result<Block<P::Header>, Corruption> {
        let payload_off = off
            .checked_add(self.header_size)
            .filter(|&x| x <= self.size)
            .ok_or(Corruption::OutOfBounds { offset: off })?;

        // Safety: The header lies inside the region. `read_unaligned` because
        //         `P::Header` might be more aligned than the pool.
        let hdr = unsafe { self.header_ptr(off).read_unaligned() };
        if P::CHECKS && !hdr.signature_ok() {
            return Err(Corruption::BadSignature { offset: off });
        }

        let block = Block { off, hdr };
        if block.size() > self.size - payload_off {
            return Err(Corruption::OutOfBounds { offset: off });
        }
        Ok(block)
    }

    fn load_or_halt(&self, off: usize) -> Block<P::Header> {
        match self.load(off) {
            Ok(block) => block,
            Err(c) => P::on_corruption(self.name, c),
        }
    }

    #[inline]
    fn store(&mut self, block: &Block<P::Header>) {
        debug_assert!(block.off + self.header_size <= self.size);
        // Safety: Only blocks obtained from `load` or placed inside a loaded
        //         block are stored
        unsafe { self.header_ptr(block.off).write_unaligned(block.hdr) };
    }

    #[inline]
    fn fill(&mut self, off: usize, len: usize) {
        debug_assert!(off + len <= self.size);
        // Safety: The range lies inside the region
        unsafe { ptr::write_bytes(self.base.as_ptr().add(off), FILL_PATTERN, len) };
    }

    /// Locate the block whose payload starts at `ptr`.
    fn block_of(&self, ptr: NonNull<u8>) -> Result<Block<P::Header>, Corruption> {
        let addr = ptr.as_ptr() as usize;
        let foreign = Corruption::ForeignPointer { addr };
        let off = addr
            .checked_sub(self.base.as_ptr() as usize)
            .and_then(|x| x.checked_sub(self.header_size))
            .filter(|&off| off % self.align == 0 && off < self.size)
            .ok_or(foreign)?;
        self.load(off)
    }

    fn account_add(&mut self, len: usize) -> Result<(), Corruption> {
        let allocated = self.allocated.saturating_add(len);
        if allocated > self.size {
            return Err(Corruption::Overcommit {
                allocated,
                size: self.size,
            });
        }
        self.allocated = allocated;
        self.high_water = self.high_water.max(allocated);
        Ok(())
    }

    fn account_sub(&mut self, len: usize) -> Result<(), Corruption> {
        self.allocated = self
            .allocated
            .checked_sub(len)
            .ok_or(Corruption::Audit {
                what: "allocated bytes",
                counted: len,
                bookkept: self.allocated,
            })?;
        Ok(())
    }

    /// Advance the check cadence. Returns `true` if a check is due.
    fn tick(&mut self, force: bool) -> bool {
        self.check_count = self.check_count.wrapping_add(1);
        force || (self.check_every != 0 && self.check_count % self.check_every == 0)
    }

    fn periodic_check(&mut self, force: bool) -> Result<(), Corruption> {
        if P::CHECKS && self.tick(force) {
            self.check()
        } else {
            Ok(())
        }
    }

    fn find_best_fit(&self, size: usize) -> Result<Option<Block<P::Header>>, Corruption> {
        let mut best: Option<Block<P::Header>> = None;
        let mut block = self.load(0)?;
        loop {
            if block.is_free() && block.size() >= size {
                if block.size() == size {
                    // An exact match can't be beaten
                    return Ok(Some(block));
                }
                if best.map_or(true, |b| block.size() < b.size()) {
                    best = Some(block);
                }
            }
            if block.is_end() {
                return Ok(best);
            }
            block = self.load(block.next_off(self.header_size))?;
        }
    }

    /// Turn a free block into a used block of `size` bytes, splitting off the
    /// surplus if it can host a header.
    fn carve(
        &mut self,
        mut block: Block<P::Header>,
        size: usize,
        tag: i16,
        origin: Option<Origin>,
    ) -> Result<NonNull<u8>, Corruption> {
        debug_assert!(block.is_free());
        debug_assert!(block.size() >= size);

        let surplus = block.size() - size;
        if surplus <= self.header_size {
            self.account_add(block.size())?;
            block.set(block.size(), block.flags() & !BLK_FREE);
        } else {
            self.account_add(size + self.header_size)?;
            let mut rest = Block {
                off: block.off + self.header_size + size,
                hdr: P::Header::new(0),
            };
            rest.set(surplus - self.header_size, BLK_FREE | (block.flags() & BLK_END));
            self.store(&rest);
            block.set(size, 0);
            self.frags += 1;
        }
        block.hdr.set_user_tag(tag);
        block.hdr.set_origin(origin);
        self.store(&block);
        Ok(self.payload(block.off))
    }

    /// Mark a used block free.
    fn release(&mut self, mut block: Block<P::Header>) -> Result<(), Corruption> {
        if block.is_free() {
            return Err(Corruption::DoubleFree { offset: block.off });
        }
        self.account_sub(block.size())?;
        block.set(block.size(), block.flags() | BLK_FREE);
        self.store(&block);
        if P::FILL {
            self.fill(block.off + self.header_size, block.size());
        }
        Ok(())
    }

    /// Merge the free blocks following `block`, which must be free.
    fn coalesce_from(&mut self, mut block: Block<P::Header>) -> Result<Block<P::Header>, Corruption> {
        debug_assert!(block.is_free());
        let mut merged = 0;
        while !block.is_end() {
            let next = self.load(block.next_off(self.header_size))?;
            if !next.is_free() {
                break;
            }
            if P::FILL {
                self.fill(next.off, self.header_size);
            }
            block.set(
                block.size() + self.header_size + next.size(),
                BLK_FREE | next.flags(),
            );
            merged += 1;
        }

        if merged != 0 {
            self.store(&block);
            self.account_sub(merged * self.header_size)?;
            self.frags = self.frags.checked_sub(merged).ok_or(Corruption::Audit {
                what: "fragments",
                counted: merged,
                bookkept: self.frags,
            })?;
        }
        Ok(block)
    }

    /// Merge every run of adjacent free blocks.
    fn coalesce_all(&mut self) -> Result<(), Corruption> {
        let mut block = self.load(0)?;
        loop {
            if block.is_free() {
                block = self.coalesce_from(block)?;
            }
            if block.is_end() {
                return Ok(());
            }
            block = self.load(block.next_off(self.header_size))?;
        }
    }
}

/// An iterator over the blocks of a [`Pool`], created by [`Pool::blocks`].
#[derive(Debug)]
pub struct Blocks<'a, 'pool, P: Policy> {
    pool: &'a Pool<'pool, P>,
    next: Option<usize>,
}

impl<P: Policy> Iterator for Blocks<'_, '_, P> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let block = self.pool.load_or_halt(self.next?);
        self.next = (!block.is_end()).then(|| block.next_off(self.pool.header_size));
        Some(BlockInfo {
            ptr: self.pool.payload(block.off),
            size: block.size(),
            free: block.is_free(),
            tag: block.hdr.user_tag(),
            origin: block.hdr.origin(),
        })
    }
}

#[inline]
fn round_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

fn audit(what: &'static str, counted: usize, bookkept: usize) -> Result<(), Corruption> {
    if counted == bookkept {
        Ok(())
    } else {
        Err(Corruption::Audit {
            what,
            counted,
            bookkept,
        })
    }
}

fn write_origin(out: &mut dyn fmt::Write, origin: Option<Origin>) -> fmt::Result {
    match origin {
        Some(origin) => write!(out, "{}:{}", origin.file(), origin.line()),
        None => out.write_str("-"),
    }
}
