use nexis_sim::memory::{MemoryBlock, MemoryManager, PhysAddr, ARENA_BASE, PAGE_SIZE};
use nexis_sim::AllocationStrategy;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn manager(capacity: usize) -> MemoryManager {
    MemoryManager::initialize(capacity, AllocationStrategy::FirstFit).unwrap()
}

fn assert_tiles(mm: &MemoryManager) {
    let blocks: Vec<MemoryBlock> = mm.blocks();
    let mut cursor = 0;
    for block in &blocks {
        assert_eq!(block.offset, cursor, "gap or overlap at {:#x}", block.offset);
        assert!(block.size > 0);
        cursor = block.end();
    }
    assert_eq!(cursor, mm.total_memory());
    for pair in blocks.windows(2) {
        assert!(!(pair[0].is_free && pair[1].is_free), "adjacent free blocks left uncoalesced");
    }
}

#[test]
fn sixteen_kib_scenario() {
    let mm = manager(16 * 1024);
    let a = mm.allocate(4096).unwrap();
    let b = mm.allocate(4096).unwrap();
    assert!(mm.deallocate(a));
    assert_eq!(mm.free_memory(), 12288);
    assert!(mm.deallocate(b));
    mm.coalesce_free_blocks();
    let blocks = mm.blocks();
    assert_eq!(blocks.len(), 1);
    assert!(blocks[0].is_free);
    assert_eq!(blocks[0].size, 16384);
}

#[test]
fn random_sequences_conserve_and_tile() {
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mm = manager(64 * 1024);
    let mut live: Vec<PhysAddr> = Vec::new();

    for _ in 0..2000 {
        if live.is_empty() || rng.gen_bool(0.55) {
            if let Some(addr) = mm.allocate(rng.gen_range(1..3000)) {
                live.push(addr);
            }
        } else {
            let addr = live.swap_remove(rng.gen_range(0..live.len()));
            assert!(mm.deallocate(addr));
        }
        assert_eq!(mm.used_memory() + mm.free_memory(), mm.total_memory());
        assert_eq!(mm.allocation_count(), live.len());
        assert_tiles(&mm);
    }

    for addr in live.drain(..) {
        assert!(mm.deallocate(addr));
    }
    assert_eq!(mm.free_memory(), mm.total_memory());
}

#[test]
fn coalescing_is_idempotent() {
    let mm = manager(32 * 1024);
    let addrs: Vec<_> = (0..6).map(|_| mm.allocate(1000).unwrap()).collect();
    for addr in addrs.iter().step_by(2) {
        mm.deallocate(*addr);
    }
    mm.coalesce_free_blocks();
    let once = mm.blocks();
    mm.coalesce_free_blocks();
    assert_eq!(once, mm.blocks());
}

#[test]
fn first_fit_is_deterministic() {
    let layout = |mm: &MemoryManager| {
        let a = mm.allocate(512).unwrap();
        let _b = mm.allocate(256).unwrap();
        mm.deallocate(a);
    };
    let one = manager(8 * 1024);
    let two = manager(8 * 1024);
    layout(&one);
    layout(&two);
    let x = one.allocate(128).unwrap();
    let y = two.allocate(128).unwrap();
    assert_eq!(x, y);
    assert_eq!(x, PhysAddr(ARENA_BASE));
}

#[test]
fn aligned_allocations_are_aligned() {
    let mm = manager(256 * 1024);
    let _skew = mm.allocate(24).unwrap();
    for align in [8, 16, 64, 256, 1024, PAGE_SIZE] {
        let addr = mm.allocate_aligned(100, align).unwrap();
        assert_eq!(addr.as_usize() % align, 0);
        assert!(mm.validate_pointer(addr));
    }
    assert_eq!(mm.allocate_aligned(100, 24), None);
}

#[test]
fn best_fit_prefers_tightest_hole() {
    let mm = MemoryManager::initialize(16 * 1024, AllocationStrategy::BestFit).unwrap();
    let big = mm.allocate(2048).unwrap();
    let _sep1 = mm.allocate(8).unwrap();
    let small = mm.allocate(256).unwrap();
    let _sep2 = mm.allocate(8).unwrap();
    mm.deallocate(big);
    mm.deallocate(small);
    assert_eq!(mm.allocate(200), Some(small));
}

#[test]
fn invalid_frees_change_nothing() {
    let mm = manager(8 * 1024);
    let a = mm.allocate(64).unwrap();
    let before = mm.blocks();
    assert!(!mm.deallocate(PhysAddr(a.as_usize() + 8)));
    assert!(!mm.deallocate(PhysAddr::NULL));
    assert_eq!(mm.blocks(), before);
    assert!(mm.deallocate(a));
    assert!(!mm.deallocate(a));
}
