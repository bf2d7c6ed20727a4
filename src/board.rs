//! Board memory maps
use core::ptr::NonNull;

use crate::{
    policy::Policy,
    registry::{Heap, Registry},
    Init, MemType, Pool, PoolFlags, PoolOptions,
};

/// A memory region a board offers for pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub mem_type: MemType,
    pub base: usize,
    /// Regions of size `0` are not registered at all.
    pub size: usize,
    pub name: &'static str,
    pub flags: PoolFlags,
}

impl Region {
    pub const fn new(
        mem_type: MemType,
        base: usize,
        size: usize,
        name: &'static str,
        flags: PoolFlags,
    ) -> Self {
        Self {
            mem_type,
            base,
            size,
            name,
            flags,
        }
    }
}

/// Describes the memory of a target.
pub trait Board {
    /// The regions to pool, from the fastest to the slowest.
    fn regions(&self) -> &[Region];

    /// The core clock in Hz, handed to [`Self::performance_index`].
    fn cpu_frequency(&self) -> u32 {
        0
    }

    /// Measure the speed of a freshly created pool. The default measures
    /// nothing.
    ///
    /// This runs while [`Registry::init`] holds the registry lock, so it must
    /// not call back into the registry.
    fn performance_index<P: Policy>(&self, _pool: &Pool<'_, P>, _cpu_frequency: u32) -> u32 {
        0
    }
}

impl<H: Heap, P: Policy> Registry<'static, H, P> {
    /// Register a pool for every non-empty region of `board`.
    ///
    /// Only the first call has an effect until [`Self::term`]; later calls
    /// return `false`. Disabled regions are registered so that they show up in
    /// [`Self::info`] but never serve allocations.
    ///
    /// # Safety
    ///
    /// Every region of `board` must be valid for reads and writes, must not be
    /// accessed by anything but this registry for the rest of the program and
    /// must not overlap another region unless it is nested in it.
    pub unsafe fn init<B: Board>(&self, board: &B) -> bool {
        let mut inner = self.lock();
        if inner.initialized {
            return false;
        }
        inner.initialized = true;

        let cpu_frequency = board.cpu_frequency();
        for region in board.regions().iter().filter(|region| region.size != 0) {
            let base = match NonNull::new(region.base as *mut u8) {
                Some(base) => base,
                None => {
                    log::warn!("region {} has a null base address", region.name);
                    continue;
                }
            };
            let mut pool = Pool::from_raw(
                base,
                region.size,
                PoolOptions {
                    flags: region.flags,
                    name: Some(region.name),
                    alias: Some(region.mem_type),
                    ..PoolOptions::INIT
                },
            );
            pool.set_performance_index(board.performance_index(&pool, cpu_frequency));
            if let Err(e) = inner.add_pool(pool) {
                log::error!("region {}: {}", region.name, e);
                break;
            }
        }
        true
    }

    /// Undo [`Self::init`]. Every pool is dropped and the next
    /// [`Self::init`] starts afresh.
    pub fn term(&self) {
        let mut inner = self.lock();
        for pool in inner.pools.iter_mut() {
            pool.term();
        }
        inner.pools.clear();
        inner.initialized = false;
    }
}

/// The memory map of an STM32H7 target.
///
/// | Type    | Name    | Base         | Size          | Default  |
/// |---------|---------|--------------|---------------|----------|
/// | `Pool1` | DTCM    | `0x20000000` | 128 KiB       | enabled  |
/// | `Pool2` | ITCM    | `0x00000010` | 64 KiB - 16   | enabled  |
/// | `Pool3` | RAMINT1 | `0x38000000` | 16 KiB        | disabled |
/// | `Pool4` | RAMINT2 | `0x30000000` | 0             | enabled  |
/// | `Pool5` | RAMINT3 | `0x24000000` | 0             | disabled |
/// | `Pool6` | RAMEXT  | `0x70100000` | 1 MiB         | enabled  |
/// | `Heap`  | HEAP    | 0            | 0             | disabled |
///
/// ITCM starts 16 bytes in so that no block ever lives at address zero.
/// RAMINT3 holds the stacks and the linker's heap by default.
#[derive(Debug, Clone)]
pub struct H7xxxBoard {
    regions: [Region; 7],
    cpu_frequency: u32,
}

impl H7xxxBoard {
    pub const DTCM: Region = Region::new(
        MemType::Pool1,
        0x2000_0000,
        128 * 1024,
        "DTCM",
        PoolFlags::EMBEDDED,
    );
    pub const ITCM: Region = Region::new(
        MemType::Pool2,
        0x0000_0010,
        64 * 1024 - 16,
        "ITCM",
        PoolFlags::EMBEDDED,
    );
    pub const RAMINT1: Region = Region::new(
        MemType::Pool3,
        0x3800_0000,
        16 * 1024,
        "RAMINT1",
        PoolFlags::EMBEDDED.union(PoolFlags::DISABLED),
    );
    pub const RAMINT2: Region = Region::new(
        MemType::Pool4,
        0x3000_0000,
        0,
        "RAMINT2",
        PoolFlags::EMBEDDED,
    );
    pub const RAMINT3: Region = Region::new(
        MemType::Pool5,
        0x2400_0000,
        0,
        "RAMINT3",
        PoolFlags::EMBEDDED.union(PoolFlags::DISABLED),
    );
    pub const RAMEXT: Region = Region::new(
        MemType::Pool6,
        0x7010_0000,
        1024 * 1024,
        "RAMEXT",
        PoolFlags::EMPTY,
    );
    pub const HEAP: Region = Region::new(MemType::Heap, 0, 0, "HEAP", PoolFlags::DISABLED);

    /// The default map. `cpu_frequency` is the core clock in Hz.
    pub const fn new(cpu_frequency: u32) -> Self {
        Self {
            regions: [
                Self::DTCM,
                Self::ITCM,
                Self::RAMINT1,
                Self::RAMINT2,
                Self::RAMINT3,
                Self::RAMEXT,
                Self::HEAP,
            ],
            cpu_frequency,
        }
    }

    /// Replace the region registered under `region.mem_type`, for boards
    /// whose linker script sizes a region differently.
    pub fn with_region(mut self, region: Region) -> Self {
        if let Some(slot) = self
            .regions
            .iter_mut()
            .find(|slot| slot.mem_type == region.mem_type)
        {
            *slot = region;
        }
        self
    }
}

impl Init for H7xxxBoard {
    const INIT: Self = Self::new(0);
}

impl Board for H7xxxBoard {
    fn regions(&self) -> &[Region] {
        &self.regions
    }

    fn cpu_frequency(&self) -> u32 {
        self.cpu_frequency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h7xxx_map() {
        let board = H7xxxBoard::new(480_000_000);
        let regions = board.regions();
        assert_eq!(regions.len(), 7);
        assert_eq!(regions[0].name, "DTCM");
        assert_eq!(regions[0].base, 0x2000_0000);
        assert_eq!(board.cpu_frequency(), 480_000_000);

        let enabled: std::vec::Vec<_> = regions
            .iter()
            .filter(|r| r.size != 0 && !r.flags.contains(PoolFlags::DISABLED))
            .map(|r| r.name)
            .collect();
        assert_eq!(enabled, ["DTCM", "ITCM", "RAMEXT"]);
    }

    #[test]
    fn with_region_replaces_by_type() {
        let board = H7xxxBoard::INIT.with_region(Region::new(
            MemType::Pool5,
            0x2400_0000,
            512 * 1024,
            "RAMINT3",
            PoolFlags::EMBEDDED,
        ));
        let ramint3 = board.regions()[4];
        assert_eq!(ramint3.size, 512 * 1024);
        assert!(!ramint3.flags.contains(PoolFlags::DISABLED));
    }
}
