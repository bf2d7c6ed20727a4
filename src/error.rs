//! Error types
use crate::MemType;

/// The reasons a pool operation can fail.
///
/// Everything except [`Error::CorruptChain`] is recoverable: the caller keeps
/// ownership of whatever it passed in and may retry elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The pool has no capacity or carries [`PoolFlags::DISABLED`].
    ///
    /// [`PoolFlags::DISABLED`]: crate::PoolFlags::DISABLED
    #[error("the pool is disabled or has no capacity")]
    Disabled,
    /// No free block can hold the request.
    #[error("no free block can hold {0} bytes")]
    Exhausted(usize),
    /// `size * count` does not fit in `usize`.
    #[error("the requested size overflows")]
    Overflow,
    /// No usable pool is mapped to the requested type.
    #[error("{0:?} is not mapped to a usable pool")]
    Unmapped(MemType),
    /// The heap could serve the request but it would eat into the reserved
    /// headroom.
    #[error("allocating {size} bytes would leave less than {limit} bytes of heap")]
    Headroom { size: usize, limit: usize },
    /// Every pool slot of the registry is taken.
    #[error("the registry cannot hold more than {0} pools")]
    RegistryFull(usize),
    /// The deferred-free queue has no room left.
    #[error("the deferred-free queue is full")]
    DeferredFull,
    /// The block chain cannot be trusted anymore.
    #[error("corrupt block chain: {0}")]
    CorruptChain(#[from] Corruption),
}

/// Evidence that a pool's intrusive block chain is damaged.
///
/// Offsets are relative to the pool's (aligned) base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Corruption {
    #[error("block at offset {offset:#x} runs past the end of the pool")]
    OutOfBounds { offset: usize },
    #[error("block at offset {offset:#x} has a bad signature")]
    BadSignature { offset: usize },
    #[error("{allocated} allocated bytes exceed the pool size of {size} bytes")]
    Overcommit { allocated: usize, size: usize },
    #[error("audit of {what}: counted {counted}, bookkept {bookkept}")]
    Audit {
        what: &'static str,
        counted: usize,
        bookkept: usize,
    },
    #[error("block at offset {offset:#x} is already free")]
    DoubleFree { offset: usize },
    #[error("address {addr:#x} does not designate a block of this pool")]
    ForeignPointer { addr: usize },
    #[error("writing {len} bytes at offset {offset:#x} overruns its block")]
    Overrun { offset: usize, len: usize },
}
