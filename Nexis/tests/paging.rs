use std::sync::Arc;

use nexis_sim::memory::PAGE_SIZE;
use nexis_sim::paging::VIRTUAL_BASE;
use nexis_sim::{AllocationStrategy, MemoryManager, PageMapper, PhysAddr, VirtAddr};

fn setup(pages: usize) -> (Arc<MemoryManager>, PageMapper) {
    let memory = Arc::new(MemoryManager::initialize(pages * PAGE_SIZE, AllocationStrategy::FirstFit).unwrap());
    let mapper = PageMapper::new(memory.clone());
    (memory, mapper)
}

#[test]
fn allocated_pages_translate_until_freed() {
    let (memory, mapper) = setup(64);
    let pages: Vec<VirtAddr> = (0..8).map(|_| mapper.allocate_virtual_page().unwrap()).collect();
    for page in &pages {
        let phys = mapper.virtual_to_physical(*page);
        assert!(!phys.is_null());
        assert_eq!(phys.as_usize() % PAGE_SIZE, 0);
        assert!(memory.validate_pointer(phys));
    }
    for page in &pages {
        assert!(mapper.free_virtual_page(*page));
        assert_eq!(mapper.virtual_to_physical(*page), PhysAddr::NULL);
    }
    assert!(!mapper.free_virtual_page(pages[0]));
    assert_eq!(memory.used_memory(), 0);
}

#[test]
fn translation_preserves_page_offset() {
    let (_, mapper) = setup(8);
    let vaddr = VirtAddr(VIRTUAL_BASE + 3 * PAGE_SIZE + 0x7ff);
    assert!(mapper.map_page(vaddr, PhysAddr(0x0012_3456)));
    assert_eq!(mapper.virtual_to_physical(vaddr), PhysAddr(0x0012_37ff));
    let same_page = VirtAddr(VIRTUAL_BASE + 3 * PAGE_SIZE);
    assert_eq!(mapper.virtual_to_physical(same_page), PhysAddr(0x0012_3000));
}

#[test]
fn mapping_is_isolated_per_page() {
    let (_, mapper) = setup(8);
    let a = VirtAddr(VIRTUAL_BASE);
    let b = VirtAddr(VIRTUAL_BASE + PAGE_SIZE);
    mapper.map_page(a, PhysAddr(0x0020_0000));
    assert_eq!(mapper.virtual_to_physical(b), PhysAddr::NULL);
    mapper.map_page(b, PhysAddr(0x0030_0000));
    mapper.unmap_page(a);
    assert_eq!(mapper.virtual_to_physical(a), PhysAddr::NULL);
    assert_eq!(mapper.virtual_to_physical(b), PhysAddr(0x0030_0000));
    assert_eq!(mapper.mapped_pages(), 1);
}
