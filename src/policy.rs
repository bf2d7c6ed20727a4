//! Instrumentation policies and the block headers they imply
use core::panic::Location;

use crate::Corruption;

/// Where an allocation was requested from.
pub type Origin = &'static Location<'static>;

/// The signature stamped on every header by instrumented policies ("PM").
pub const SIGNATURE: u16 = 0x4D50;

/// The byte pattern instrumented policies write over fresh and freed memory.
pub const FILL_PATTERN: u8 = 0xCD;

/// The header preceding every block payload.
///
/// `size_and_flags` holds the payload size; its two low bits are reserved for
/// the block flags, which is why pool alignment is at least 4.
///
/// Headers are accessed with unaligned reads and writes, so implementations
/// need no particular alignment.
pub trait BlockHeader: Copy {
    /// A header for a brand new block.
    fn new(size_and_flags: usize) -> Self;

    fn size_and_flags(&self) -> usize;

    fn set_size_and_flags(&mut self, size_and_flags: usize);

    /// Always `true` for headers without a signature.
    #[inline]
    fn signature_ok(&self) -> bool {
        true
    }

    #[inline]
    fn user_tag(&self) -> i16 {
        0
    }

    #[inline]
    fn set_user_tag(&mut self, _tag: i16) {}

    #[inline]
    fn origin(&self) -> Option<Origin> {
        None
    }

    #[inline]
    fn set_origin(&mut self, _origin: Option<Origin>) {}
}

/// Selects what a [`Pool`] checks and records at compile time.
///
/// [`Pool`]: crate::Pool
pub trait Policy: 'static {
    type Header: BlockHeader;

    /// Verify signatures, audit the chain on the configured cadence and keep
    /// the leak detector working.
    const CHECKS: bool;

    /// Fill fresh and freed memory with [`FILL_PATTERN`].
    const FILL: bool;

    /// Called when a chain turns out to be corrupted and the caller cannot
    /// receive an error. Halts.
    #[cold]
    fn on_corruption(pool: Option<&str>, corruption: Corruption) -> ! {
        log::error!(
            "Mem corruption:{}: {}",
            pool.unwrap_or(""),
            corruption
        );
        panic!("memory pool corrupted: {}", corruption);
    }
}

/// No instrumentation. The smallest headers and no checks beyond the bounds
/// of the region.
#[derive(Debug)]
pub enum Bare {}

/// Signatures, audits, fill patterns and leak tags.
#[derive(Debug)]
pub enum Instrumented {}

/// [`Instrumented`] plus the origin of each allocation.
#[derive(Debug)]
pub enum Traced {}

impl Policy for Bare {
    type Header = BareHeader;
    const CHECKS: bool = false;
    const FILL: bool = false;
}

impl Policy for Instrumented {
    type Header = SignedHeader;
    const CHECKS: bool = true;
    const FILL: bool = true;
}

impl Policy for Traced {
    type Header = TracedHeader;
    const CHECKS: bool = true;
    const FILL: bool = true;
}

cfg_if::cfg_if! {
    if #[cfg(feature = "named")] {
        /// The policy selected by the crate features.
        pub type DefaultPolicy = Traced;
    } else if #[cfg(feature = "instrumentation")] {
        /// The policy selected by the crate features.
        pub type DefaultPolicy = Instrumented;
    } else {
        /// The policy selected by the crate features.
        pub type DefaultPolicy = Bare;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BareHeader {
    size_and_flags: usize,
}

impl BlockHeader for BareHeader {
    #[inline]
    fn new(size_and_flags: usize) -> Self {
        Self { size_and_flags }
    }

    #[inline]
    fn size_and_flags(&self) -> usize {
        self.size_and_flags
    }

    #[inline]
    fn set_size_and_flags(&mut self, size_and_flags: usize) {
        self.size_and_flags = size_and_flags;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignedHeader {
    signature: u16,
    user_tag: i16,
    size_and_flags: usize,
}

impl BlockHeader for SignedHeader {
    #[inline]
    fn new(size_and_flags: usize) -> Self {
        Self {
            signature: SIGNATURE,
            user_tag: 0,
            size_and_flags,
        }
    }

    #[inline]
    fn size_and_flags(&self) -> usize {
        self.size_and_flags
    }

    #[inline]
    fn set_size_and_flags(&mut self, size_and_flags: usize) {
        self.size_and_flags = size_and_flags;
    }

    #[inline]
    fn signature_ok(&self) -> bool {
        self.signature == SIGNATURE
    }

    #[inline]
    fn user_tag(&self) -> i16 {
        self.user_tag
    }

    #[inline]
    fn set_user_tag(&mut self, tag: i16) {
        self.user_tag = tag;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TracedHeader {
    signed: SignedHeader,
    // Raw so that reading a damaged header never materializes a bad reference
    origin: *const Location<'static>,
}

impl BlockHeader for TracedHeader {
    #[inline]
    fn new(size_and_flags: usize) -> Self {
        Self {
            signed: SignedHeader::new(size_and_flags),
            origin: core::ptr::null(),
        }
    }

    #[inline]
    fn size_and_flags(&self) -> usize {
        self.signed.size_and_flags
    }

    #[inline]
    fn set_size_and_flags(&mut self, size_and_flags: usize) {
        self.signed.size_and_flags = size_and_flags;
    }

    #[inline]
    fn signature_ok(&self) -> bool {
        self.signed.signature_ok()
    }

    #[inline]
    fn user_tag(&self) -> i16 {
        self.signed.user_tag
    }

    #[inline]
    fn set_user_tag(&mut self, tag: i16) {
        self.signed.user_tag = tag;
    }

    #[inline]
    fn origin(&self) -> Option<Origin> {
        if !self.signed.signature_ok() {
            return None;
        }
        // Safety: With an intact signature the field was last written by
        //         `set_origin`, which only stores `'static` locations or null.
        unsafe { self.origin.as_ref() }
    }

    #[inline]
    fn set_origin(&mut self, origin: Option<Origin>) {
        self.origin = origin.map_or(core::ptr::null(), |o| o as *const _);
    }
}
