//! This crate implements a pooled block allocator for fixed memory regions
//! and a registry that arbitrates between several such pools.
//!
//!  - **The memory is provided by the application.** Each [`Pool`] manages
//!    one region, such as a tightly coupled memory, an on-chip SRAM bank or
//!    external RAM, as a chain of variable-size blocks.
//!
//!  - **Pools are picked by logical type.** A [`Registry`] tags its pools
//!    with a [`MemType`] and serves requests from an explicit pool, from the
//!    fastest pool that fits ([`MemType::AnyFast`]) or from the slowest
//!    ([`MemType::AnySlow`]), falling back to a platform [`Heap`] that keeps
//!    a reserved headroom for code that uses it directly.
//!
//!  - **Corruption is caught early.** With the `instrumentation` feature,
//!    every block header carries a signature, the chain is audited on a
//!    configurable cadence, freed memory is filled with a pattern and a leak
//!    detector can tag blocks. The `named` feature also records where each
//!    block was allocated.
//!
//!  - **Interrupt handlers can release blocks.** A [`SendBlockPool`] queues
//!    frees coming from interrupt context and performs them on the next
//!    task-context call.
//!
//!  - **This crate supports `#![no_std]`.** It can be used in bare-metal and
//!    RTOS-based applications.
//!
//! # Examples
//!
//! ```rust
//! use pmem::{Init, LeakPhase, Pool, PoolOptions};
//! use std::mem::MaybeUninit;
//!
//! let mut region = [MaybeUninit::uninit(); 4096];
//!
//! // `'pool` represents the region's lifetime (`region` in this case).
//! let mut pool: Pool<'_> = Pool::new(&mut region, PoolOptions::INIT);
//!
//! unsafe {
//!     let ptr1 = pool.alloc(8).unwrap().cast::<u64>();
//!     let ptr2 = pool.alloc(8).unwrap().cast::<u64>();
//!     ptr1.as_ptr().write_unaligned(42);
//!     ptr2.as_ptr().write_unaligned(56);
//!     assert_eq!(ptr1.as_ptr().read_unaligned(), 42);
//!     assert_eq!(ptr2.as_ptr().read_unaligned(), 56);
//!     pool.free(ptr1.cast());
//!     pool.free(ptr2.cast());
//! }
//!
//! assert_eq!(pool.fragments(), 1);
//! assert!(pool.check().is_ok());
//! ```
//!
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

#[cfg(any(test, feature = "std"))]
extern crate std;

mod board;
mod deferred;
mod error;
mod init;
pub mod policy;
mod pool;
mod registry;

pub use self::{
    board::{Board, H7xxxBoard, Region},
    deferred::{DeferredFree, SendBlockPool, DEFAULT_PENDING},
    error::{Corruption, Error},
    init::Init,
    policy::{Bare, DefaultPolicy, Instrumented, Policy, Traced},
    pool::{
        BlockInfo, Blocks, LeakPhase, Pool, PoolFlags, PoolInfo, PoolOptions, DEFAULT_ALIGN,
    },
    registry::{
        Heap, MemType, NoHeap, PoolStatus, Registry, RegistryConfig, DEFAULT_HEAP_LIMIT, MAX_POOLS,
    },
};

#[cfg(any(test, feature = "std"))]
pub use self::registry::SystemHeap;
