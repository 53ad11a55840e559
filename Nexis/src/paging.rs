// paging.rs

use core::fmt;
use std::sync::Arc;

use log::{debug, warn};
use spin::Mutex;

use crate::memory::{MemoryManager, PhysAddr, PAGE_SIZE};

/// First virtual address handed out by [`PageMapper::allocate_virtual_page`].
pub const VIRTUAL_BASE: usize = 0x0100_0000;

const PAGE_SHIFT: u32 = 12;
const FRAME_BITS: u32 = 40;
const FRAME_MASK: u64 = ((1u64 << FRAME_BITS) - 1) << PAGE_SHIFT;

bitflags::bitflags! {
    /// Flag bits of a page table entry, laid out like an x86-64 PTE.
    pub struct PteFlags: u64 {
        /// Present; the entry maps a frame.
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLED = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

/// A virtual address in the page-granular address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    #[inline]
    pub fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Page table entry: flags in the low bits, a 40-bit frame number from bit 12.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    const fn unmapped() -> Self {
        Self(PteFlags::WRITABLE.bits() | PteFlags::USER.bits())
    }

    #[inline]
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        (self.0 & FRAME_MASK) >> PAGE_SHIFT
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn is_writable(&self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    pub fn is_user_accessible(&self) -> bool {
        self.flags().contains(PteFlags::USER)
    }

    fn map(&mut self, paddr: PhysAddr) {
        let frame = (paddr.as_usize() as u64) >> PAGE_SHIFT;
        self.0 = (self.0 & !FRAME_MASK) | ((frame << PAGE_SHIFT) & FRAME_MASK);
        self.0 |= PteFlags::PRESENT.bits();
    }

    fn unmap(&mut self) {
        self.0 &= !(FRAME_MASK | PteFlags::PRESENT.bits());
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("frame", &format_args!("{:#x}", self.frame()))
            .field("flags", &self.flags())
            .finish()
    }
}

struct PageTable {
    entries: Vec<PageTableEntry>,
    next_virtual: usize,
}

impl PageTable {
    fn index(&self, vaddr: VirtAddr) -> Option<usize> {
        let idx = vaddr.0.checked_sub(VIRTUAL_BASE)? / PAGE_SIZE;
        (idx < self.entries.len()).then(|| idx)
    }
}

/// Linear page table translating [`VIRTUAL_BASE`]-relative pages onto frames
/// taken from the allocator.
///
/// Virtual addresses come from a counter and are never handed out twice, so
/// once the counter walks past the last slot no more pages can be allocated.
pub struct PageMapper {
    memory: Arc<MemoryManager>,
    table: Mutex<PageTable>,
}

impl PageMapper {
    /// One slot per page of the allocator's arena, all unmapped.
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        let slots = memory.total_memory() / PAGE_SIZE;
        Self::with_slots(memory, slots)
    }

    pub fn with_slots(memory: Arc<MemoryManager>, slots: usize) -> Self {
        Self {
            memory,
            table: Mutex::new(PageTable {
                entries: vec![PageTableEntry::unmapped(); slots],
                next_virtual: VIRTUAL_BASE,
            }),
        }
    }

    pub fn slots(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn mapped_pages(&self) -> usize {
        self.table.lock().entries.iter().filter(|e| e.is_present()).count()
    }

    /// Back a fresh virtual page with a page-aligned frame from the allocator.
    pub fn allocate_virtual_page(&self) -> Option<VirtAddr> {
        let frame = self.memory.allocate_aligned(PAGE_SIZE, PAGE_SIZE)?;

        let mapped = {
            let mut table = self.table.lock();
            let vaddr = VirtAddr(table.next_virtual);
            match table.index(vaddr) {
                Some(idx) => {
                    table.entries[idx].map(frame);
                    table.next_virtual += PAGE_SIZE;
                    Some(vaddr)
                }
                None => None,
            }
        };

        match mapped {
            Some(vaddr) => {
                debug!(target: "paging", "mapped virtual page {} -> {}", vaddr, frame);
                Some(vaddr)
            }
            None => {
                warn!(target: "paging", "page table exhausted, releasing frame {}", frame);
                self.memory.deallocate(frame);
                None
            }
        }
    }

    /// Unmap `vaddr` and give its frame back to the allocator.
    /// Returns false if the page was not mapped.
    pub fn free_virtual_page(&self, vaddr: VirtAddr) -> bool {
        let frame = {
            let mut table = self.table.lock();
            let idx = match table.index(vaddr) {
                Some(idx) if table.entries[idx].is_present() => idx,
                _ => return false,
            };
            let frame = PhysAddr((table.entries[idx].frame() << PAGE_SHIFT) as usize);
            table.entries[idx].unmap();
            frame
        };
        debug!(target: "paging", "unmapped virtual page {}", vaddr);
        self.memory.deallocate(frame)
    }

    pub fn map_page(&self, vaddr: VirtAddr, paddr: PhysAddr) -> bool {
        let mut table = self.table.lock();
        match table.index(vaddr) {
            Some(idx) => {
                table.entries[idx].map(paddr);
                true
            }
            None => {
                warn!(target: "paging", "virtual address {} is outside the page table", vaddr);
                false
            }
        }
    }

    pub fn unmap_page(&self, vaddr: VirtAddr) {
        let mut table = self.table.lock();
        if let Some(idx) = table.index(vaddr) {
            table.entries[idx].unmap();
        }
    }

    /// Physical address behind `vaddr`, or [`PhysAddr::NULL`] when unmapped.
    pub fn virtual_to_physical(&self, vaddr: VirtAddr) -> PhysAddr {
        let table = self.table.lock();
        match table.index(vaddr).map(|idx| table.entries[idx]) {
            Some(entry) if entry.is_present() => {
                PhysAddr(((entry.frame() << PAGE_SHIFT) as usize) | vaddr.page_offset())
            }
            _ => PhysAddr::NULL,
        }
    }

    pub fn entry(&self, vaddr: VirtAddr) -> Option<PageTableEntry> {
        let table = self.table.lock();
        table.index(vaddr).map(|idx| table.entries[idx])
    }
}
