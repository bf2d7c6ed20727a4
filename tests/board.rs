use pmem::{
    Bare, Board, Init, MemType, NoHeap, Policy, Pool, PoolFlags, Region, Registry, RegistryConfig,
};
use std::mem::MaybeUninit;

struct TestBoard {
    regions: Vec<Region>,
}

fn leak_region(len: usize) -> usize {
    let region: &'static mut [MaybeUninit<u8>] =
        Box::leak(vec![MaybeUninit::uninit(); len + 16].into_boxed_slice());
    let skip = region.as_ptr().align_offset(16);
    region[skip..].as_mut_ptr() as usize
}

impl TestBoard {
    fn new() -> Self {
        Self {
            regions: vec![
                Region::new(MemType::Pool1, leak_region(1024), 1024, "TCM", PoolFlags::EMBEDDED),
                Region::new(
                    MemType::Pool2,
                    leak_region(1024),
                    1024,
                    "SRAM1",
                    PoolFlags::EMBEDDED | PoolFlags::DISABLED,
                ),
                Region::new(MemType::Pool3, 0x1000, 0, "SRAM2", PoolFlags::EMBEDDED),
                Region::new(MemType::Pool4, 0, 1024, "NULL", PoolFlags::EMPTY),
                Region::new(MemType::Pool5, leak_region(8192), 8192, "SDRAM", PoolFlags::EMPTY),
            ],
        }
    }
}

impl Board for TestBoard {
    fn regions(&self) -> &[Region] {
        &self.regions
    }

    fn cpu_frequency(&self) -> u32 {
        100_000_000
    }

    fn performance_index<P: Policy>(&self, pool: &Pool<'_, P>, cpu_frequency: u32) -> u32 {
        cpu_frequency / 1_000_000 + (pool.size() / 1024) as u32
    }
}

#[test]
fn init_registers_the_board_regions() {
    let _ = env_logger::builder().is_test(true).try_init();

    let board = TestBoard::new();
    let registry: Registry<'static, NoHeap, Bare> = Registry::new(NoHeap, RegistryConfig::INIT);
    assert!(unsafe { registry.init(&board) });

    // Empty regions and regions at address zero are left out
    let info = registry.info();
    let names: Vec<_> = info.iter().map(|status| status.name.unwrap()).collect();
    assert_eq!(names, ["TCM", "SRAM1", "SDRAM"]);
    assert!(info[1].unmapped);
    assert_eq!(info[0].performance_index, 101);
    assert_eq!(registry.type_from_name("SDRAM"), MemType::Pool5);

    // The disabled region never serves allocations
    let fast = registry.alloc(MemType::AnyFast, 64).unwrap();
    assert!(registry.check_ptr(MemType::Pool1, fast));
    let big = registry.alloc(MemType::AnyFast, 2048).unwrap();
    assert!(registry.check_ptr(MemType::Pool5, big));
    assert_eq!(registry.alloc(MemType::Pool2, 8), None);

    unsafe {
        registry.free(Some(fast));
        registry.free(Some(big));
    }
}

#[test]
fn init_is_single_shot() {
    let board = TestBoard::new();
    let registry: Registry<'static, NoHeap, Bare> = Registry::new(NoHeap, RegistryConfig::INIT);
    assert!(unsafe { registry.init(&board) });
    assert!(!unsafe { registry.init(&board) });
    assert_eq!(registry.pool_count(), 3);

    registry.term();
    assert_eq!(registry.pool_count(), 0);
    assert_eq!(registry.alloc(MemType::AnyFast, 8), None);

    assert!(unsafe { registry.init(&board) });
    assert_eq!(registry.pool_count(), 3);
    assert!(registry.alloc(MemType::Pool1, 8).is_some());
}
