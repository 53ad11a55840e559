// memory.rs

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use spin::Mutex;

use crate::config::AllocationStrategy;
use crate::error::KernelError;

/// Page/frame size, 4 KiB.
pub const PAGE_SIZE: usize = 4096;
/// Every request is rounded up to this many bytes.
pub const ALIGNMENT: usize = 8;
/// Physical address of the first arena byte. Keeps address 0 free to mean null.
pub const ARENA_BASE: usize = 0x0010_0000;

/// Owner stamp carried by process allocations (the owning pid).
pub type OwnerId = u32;

/// A physical address inside the arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    pub const NULL: PhysAddr = PhysAddr(0);

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// One contiguous span of the arena. `offset` is relative to [`ARENA_BASE`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    pub offset: usize,
    pub size: usize,
    pub is_free: bool,
    pub owner: Option<OwnerId>,
}

impl MemoryBlock {
    fn free(offset: usize, size: usize) -> Self {
        Self {
            offset,
            size,
            is_free: true,
            owner: None,
        }
    }

    pub fn address(&self) -> PhysAddr {
        PhysAddr(ARENA_BASE + self.offset)
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Live allocation, keyed by the address handed to the caller. `block` is the
/// offset of the block backing it, which differs from the key for aligned
/// allocations.
#[derive(Copy, Clone, Debug)]
struct Allocation {
    block: usize,
    size: usize,
}

struct Arena {
    storage: Vec<u8>,
    /// Sorted by offset, tiles `[0, storage.len())`.
    blocks: Vec<MemoryBlock>,
    records: BTreeMap<usize, Allocation>,
}

impl Arena {
    fn find_block(&self, size: usize, strategy: AllocationStrategy) -> Option<usize> {
        let mut fits = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_free && b.size >= size);
        match strategy {
            AllocationStrategy::FirstFit => fits.next().map(|(i, _)| i),
            AllocationStrategy::BestFit => fits.min_by_key(|(_, b)| b.size).map(|(i, _)| i),
        }
    }

    /// Take `size` bytes from the front of free block `idx`, splitting off the
    /// tail as a new free block. Returns the offset of the taken span.
    fn carve(&mut self, idx: usize, size: usize, owner: Option<OwnerId>) -> usize {
        let block = self.blocks[idx];
        if block.size > size {
            self.blocks
                .insert(idx + 1, MemoryBlock::free(block.offset + size, block.size - size));
        }
        let taken = &mut self.blocks[idx];
        taken.size = size;
        taken.is_free = false;
        taken.owner = owner;
        taken.offset
    }

    fn reserve(
        &mut self,
        size: usize,
        owner: Option<OwnerId>,
        strategy: AllocationStrategy,
    ) -> Option<usize> {
        let idx = self.find_block(size, strategy)?;
        Some(self.carve(idx, size, owner))
    }

    fn block_index(&self, offset: usize) -> Option<usize> {
        self.blocks.binary_search_by_key(&offset, |b| b.offset).ok()
    }

    fn coalesce(&mut self) {
        self.blocks.sort_by_key(|b| b.offset);
        let mut i = 0;
        while i + 1 < self.blocks.len() {
            let (cur, next) = (self.blocks[i], self.blocks[i + 1]);
            if cur.is_free && next.is_free && cur.end() == next.offset {
                self.blocks[i].size += next.size;
                self.blocks.remove(i + 1);
                continue;
            }
            i += 1;
        }
    }

    fn free_bytes(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_free).map(|b| b.size).sum()
    }
}

/// Segment allocator over one fixed arena.
///
/// Allocation failure and bad frees are ordinary return values; nothing in
/// here panics on caller input.
pub struct MemoryManager {
    capacity: usize,
    strategy: AllocationStrategy,
    arena: Mutex<Arena>,
}

impl MemoryManager {
    /// Reserve the arena and set it up as one free block.
    pub fn initialize(capacity: usize, strategy: AllocationStrategy) -> Result<Self, KernelError> {
        if capacity == 0 || capacity % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidCapacity(capacity));
        }
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| KernelError::ArenaUnavailable(capacity))?;
        storage.resize(capacity, 0);

        info!(target: "memory", "memory manager initialized with {}KB arena at {:#x}", capacity / 1024, ARENA_BASE);
        Ok(Self {
            capacity,
            strategy,
            arena: Mutex::new(Arena {
                storage,
                blocks: vec![MemoryBlock::free(0, capacity)],
                records: BTreeMap::new(),
            }),
        })
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    pub fn allocate(&self, size: usize) -> Option<PhysAddr> {
        self.allocate_owned(size, None)
    }

    /// Same as [`allocate`](Self::allocate) but stamps the block with `owner`.
    pub fn allocate_for_process(&self, owner: OwnerId, size: usize) -> Option<PhysAddr> {
        self.allocate_owned(size, Some(owner))
    }

    fn allocate_owned(&self, size: usize, owner: Option<OwnerId>) -> Option<PhysAddr> {
        if size == 0 {
            warn!(target: "memory", "rejected zero-size allocation");
            return None;
        }
        let size = align_up(size, ALIGNMENT)?;

        let mut arena = self.arena.lock();
        match arena.reserve(size, owner, self.strategy) {
            Some(offset) => {
                let addr = ARENA_BASE + offset;
                arena.records.insert(addr, Allocation { block: offset, size });
                debug!(target: "memory", "allocated {} bytes at {:#x}", size, addr);
                Some(PhysAddr(addr))
            }
            None => {
                warn!(target: "memory", "failed to allocate {} bytes", size);
                None
            }
        }
    }

    /// Allocate `size` bytes at an `alignment` boundary (a power of two).
    ///
    /// The block is over-allocated by `alignment - 1` bytes. The allocation
    /// record is keyed by the aligned address and remembers the real block, so
    /// the returned address can be handed straight to
    /// [`deallocate`](Self::deallocate).
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Option<PhysAddr> {
        if alignment == 0 || !alignment.is_power_of_two() {
            warn!(target: "memory", "alignment {} is not a power of two", alignment);
            return None;
        }
        if size == 0 {
            warn!(target: "memory", "rejected zero-size allocation");
            return None;
        }
        let padded = align_up(size.checked_add(alignment - 1)?, ALIGNMENT)?;

        let mut arena = self.arena.lock();
        let offset = match arena.reserve(padded, None, self.strategy) {
            Some(offset) => offset,
            None => {
                warn!(target: "memory", "failed to allocate {} bytes aligned to {}", size, alignment);
                return None;
            }
        };
        // Cannot fail: the padding guarantees room for the rounded address.
        let aligned = align_up(ARENA_BASE + offset, alignment)?;
        arena.records.insert(
            aligned,
            Allocation {
                block: offset,
                size: padded,
            },
        );
        debug!(target: "memory", "allocated {} bytes at {:#x} (block {:#x})", padded, aligned, ARENA_BASE + offset);
        Some(PhysAddr(aligned))
    }

    /// Release an allocation. Returns whether anything was freed; an unknown
    /// address is reported and leaves the arena unchanged.
    pub fn deallocate(&self, addr: PhysAddr) -> bool {
        if addr.is_null() {
            return false;
        }
        let mut arena = self.arena.lock();
        let record = match arena.records.remove(&addr.0) {
            Some(record) => record,
            None => {
                warn!(target: "memory", "attempt to free unallocated address {}", addr);
                return false;
            }
        };
        if let Some(idx) = arena.block_index(record.block) {
            let block = &mut arena.blocks[idx];
            block.is_free = true;
            block.owner = None;
        }
        arena.coalesce();
        debug!(target: "memory", "freed {} bytes at {}", record.size, addr);
        true
    }

    /// Free every block stamped with `owner`. Returns the number of bytes released.
    pub fn deallocate_process_memory(&self, owner: OwnerId) -> usize {
        let mut arena = self.arena.lock();
        let mut released = BTreeSet::new();
        let mut bytes = 0;
        for block in arena.blocks.iter_mut() {
            if !block.is_free && block.owner == Some(owner) {
                block.is_free = true;
                block.owner = None;
                released.insert(block.offset);
                bytes += block.size;
            }
        }
        if released.is_empty() {
            return 0;
        }
        arena.records.retain(|_, a| !released.contains(&a.block));
        arena.coalesce();
        info!(target: "memory", "released {} bytes owned by process {}", bytes, owner);
        bytes
    }

    pub fn coalesce_free_blocks(&self) {
        self.arena.lock().coalesce();
    }

    pub fn total_memory(&self) -> usize {
        self.capacity
    }

    pub fn free_memory(&self) -> usize {
        self.arena.lock().free_bytes()
    }

    pub fn used_memory(&self) -> usize {
        self.capacity - self.free_memory()
    }

    /// True iff `addr` lies inside the arena.
    pub fn validate_pointer(&self, addr: PhysAddr) -> bool {
        addr.0 >= ARENA_BASE && addr.0 < ARENA_BASE + self.capacity
    }

    /// Snapshot of the block list, in address order.
    pub fn blocks(&self) -> Vec<MemoryBlock> {
        self.arena.lock().blocks.clone()
    }

    pub fn allocation_count(&self) -> usize {
        self.arena.lock().records.len()
    }

    /// Size recorded for a live allocation.
    pub fn allocation_size(&self, addr: PhysAddr) -> Option<usize> {
        self.arena.lock().records.get(&addr.0).map(|a| a.size)
    }

    /// True iff all of `[addr, addr + len)` lies inside the arena.
    pub fn validate_range(&self, addr: PhysAddr, len: usize) -> bool {
        self.span(addr, len).is_some()
    }

    fn span(&self, addr: PhysAddr, len: usize) -> Option<core::ops::Range<usize>> {
        if !self.validate_pointer(addr) {
            return None;
        }
        let start = addr.0 - ARENA_BASE;
        let end = start.checked_add(len)?;
        (end <= self.capacity).then(|| start..end)
    }

    /// Copy `len` bytes out of the arena starting at `addr`.
    pub fn read(&self, addr: PhysAddr, len: usize) -> Option<Vec<u8>> {
        let range = self.span(addr, len)?;
        Some(self.arena.lock().storage[range].to_vec())
    }

    /// Copy `bytes` into the arena at `addr`. Fails if the span leaves the arena.
    pub fn write(&self, addr: PhysAddr, bytes: &[u8]) -> bool {
        match self.span(addr, bytes.len()) {
            Some(range) => {
                self.arena.lock().storage[range].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }
}
