use std::alloc::{self, Layout};

use core::ptr::NonNull;

use super::Heap;

/// The alignment of blocks handed out by [`SystemHeap`], which is also the
/// length of the size prefix stored in front of each block.
const MIN_ALIGN: usize = 16;

/// The host allocator as a [`Heap`], with an optional budget so that the
/// registry's headroom check has a free size to work with.
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
#[derive(Debug, Default)]
pub struct SystemHeap {
    budget: Option<usize>,
    in_use: usize,
}

impl SystemHeap {
    /// A heap without a budget. [`Heap::free_size`] returns `None`.
    pub const fn new() -> Self {
        Self {
            budget: None,
            in_use: 0,
        }
    }

    /// A heap that pretends to hold `budget` bytes.
    pub const fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            in_use: 0,
        }
    }

    /// The payload bytes currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    #[inline]
    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size.checked_add(MIN_ALIGN)?, MIN_ALIGN).ok()
    }

    /// Get the start of the underlying allocation and the payload size.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live block allocated by `self`.
    #[inline]
    unsafe fn header(ptr: NonNull<u8>) -> (*mut u8, usize) {
        let start = ptr.as_ptr().sub(MIN_ALIGN);
        (start, start.cast::<usize>().read())
    }
}

impl Heap for SystemHeap {
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let layout = Self::layout(size)?;
        // Safety: `layout` is never zero-sized
        let start = unsafe { alloc::alloc(layout) };
        if start.is_null() {
            return None;
        }
        // Safety: The allocation is `MIN_ALIGN` bytes larger than `size`
        unsafe {
            start.cast::<usize>().write(size);
            self.in_use += size;
            Some(NonNull::new_unchecked(start.add(MIN_ALIGN)))
        }
    }

    unsafe fn realloc(&mut self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        let (start, old_size) = Self::header(ptr);
        let old_layout = Self::layout(old_size)?;
        let new_layout = Self::layout(size)?;
        let start = alloc::realloc(start, old_layout, new_layout.size());
        if start.is_null() {
            return None;
        }
        start.cast::<usize>().write(size);
        self.in_use = self.in_use - old_size + size;
        Some(NonNull::new_unchecked(start.add(MIN_ALIGN)))
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let (start, size) = Self::header(ptr);
        if let Some(layout) = Self::layout(size) {
            self.in_use -= size;
            alloc::dealloc(start, layout);
        }
    }

    fn free_size(&self) -> Option<usize> {
        self.budget
            .map(|budget| budget.saturating_sub(self.in_use))
    }
}
