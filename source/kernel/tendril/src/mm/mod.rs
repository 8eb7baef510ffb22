// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory management for the injected kernel
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemoryManager (lookup cache, block allocator, paging systems, map/unmap)
//! DEPENDS_ON: hal::Platform
//! INVARIANTS:
//!   - Only addresses at or above the 3 GiB split are ever mapped internally
//!   - Every descriptor write is followed by a line clean and a region-scoped TLB invalidate
//!   - Intermediate tables are created only for the entry being populated

extern crate alloc;

use bitflags::bitflags;

#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicBool, Ordering};

pub mod attrs;
pub mod blocks;
pub mod descriptor;
#[cfg(any(test, all(target_arch = "arm", target_os = "none")))]
pub mod heap;
pub mod lookup;
mod map;
pub mod paging;

#[cfg(test)]
mod blocks_prop;
#[cfg(test)]
mod descriptor_prop;

pub use blocks::{AllocError, BlockAllocator};
pub use lookup::{LookupCache, Translation};
pub use map::Alias;
pub use paging::{PagingError, PagingManager, PagingSystem, Tag};

use crate::hal::Platform;
use crate::types::{PhysAddr, VirtAddr};

/// Start of the region the internal paging system covers.
pub const SPLIT: u32 = 0xC000_0000;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Target and memory-type selection for [`MemoryManager::map`].
    pub struct MapFlags: u32 {
        const CACHEABLE = 1 << 0;
        const BUFFERABLE = 1 << 1;
        const INTERNAL = 1 << 2;
        const EXTERNAL = 1 << 3;
        const NORMAL_MEMORY = 1 << 4;
        const DEVICE_MEMORY = 1 << 5;
        const STRONGLY_ORDERED = 1 << 6;
        const EXECUTE_NEVER = 1 << 7;
    }
}

/// Error returned by mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Size of zero bytes.
    EmptyRange,
    /// Range plus its offset does not fit in one section.
    TooLarge,
    /// Internal addresses must be zero or at or above the split line.
    BelowSplit,
    /// No free page or section slot from the requested index onward.
    NoFreeSlot,
    /// The frame already has an internal mapping of the same granularity.
    AlreadyMapped(VirtAddr),
    /// Neither INTERNAL nor EXTERNAL was requested.
    NoTarget,
    /// An entry expected to point at a second-level table does not.
    NotPageTable,
    /// The leaf expected to be a small page is not.
    NotSmallPage,
    /// The entry expected to be a section is not.
    NotSection,
    /// The lookup cache has no translation for the address.
    LookupMiss,
    /// The TTBR covering the address has table walks disabled.
    WalkDisabled,
    /// TEX remap is active but no region matches the memory type.
    NoRemapRegion,
    /// TEX remap is active and no memory type was requested.
    NoMemoryType,
    /// The internal paging system has not been built.
    NotBuilt,
    /// Host tables are only reachable while the internal system is live.
    InternalNotLive,
    /// The host has no translation for the address.
    Unmapped,
    /// A string ran past the accepted length without a terminator.
    Unterminated,
    /// Block allocator could not satisfy a table allocation.
    Alloc(AllocError),
    /// Failpoint injected a denial.
    Denied,
}

impl From<AllocError> for MapError {
    fn from(value: AllocError) -> Self {
        Self::Alloc(value)
    }
}

/// Test hooks that make the next operation fail.
#[cfg(feature = "failpoints")]
#[derive(Default)]
pub struct Failpoints {
    deny_next_map: AtomicBool,
    deny_next_alloc: AtomicBool,
}

#[cfg(feature = "failpoints")]
impl Failpoints {
    /// Causes the next map() call to fail with MapError::Denied.
    pub fn deny_next_map(&self) {
        self.deny_next_map.store(true, Ordering::SeqCst);
    }

    /// Causes the next block allocation to fail with AllocError::OutOfMemory.
    pub fn deny_next_alloc(&self) {
        self.deny_next_alloc.store(true, Ordering::SeqCst);
    }
}

/// Owns the lookup cache, the block allocator and both paging systems.
pub struct MemoryManager {
    lookup: LookupCache,
    blocks: BlockAllocator,
    paging: PagingManager,
    #[cfg(feature = "failpoints")]
    failpoints: Failpoints,
}

impl MemoryManager {
    pub fn new(lookup: LookupCache, blocks: BlockAllocator) -> Self {
        Self {
            lookup,
            blocks,
            paging: PagingManager::new(),
            #[cfg(feature = "failpoints")]
            failpoints: Failpoints::default(),
        }
    }

    #[cfg(feature = "failpoints")]
    pub fn failpoints(&self) -> &Failpoints {
        &self.failpoints
    }

    pub fn lookup(&self) -> &LookupCache {
        &self.lookup
    }

    pub fn blocks(&self) -> &BlockAllocator {
        &self.blocks
    }

    pub fn paging(&self) -> &PagingManager {
        &self.paging
    }

    /// Allocates `size` bytes aligned to `alignment` from the workspace.
    pub fn alloc(&mut self, alignment: u32, size: u32) -> Result<VirtAddr, AllocError> {
        #[cfg(feature = "failpoints")]
        if self.failpoints.deny_next_alloc.swap(false, Ordering::SeqCst) {
            return Err(AllocError::OutOfMemory);
        }
        self.blocks.alloc(alignment, size)
    }

    pub fn free(&mut self, va: VirtAddr) -> Result<(), AllocError> {
        self.blocks.free(va)
    }

    pub fn lookup_va(&self, pa: PhysAddr) -> Result<VirtAddr, MapError> {
        self.lookup.lookup_va(pa).ok_or(MapError::LookupMiss)
    }

    pub fn lookup_pa(&self, va: VirtAddr) -> Result<PhysAddr, MapError> {
        self.lookup.lookup_pa(va).ok_or(MapError::LookupMiss)
    }

    /// Builds the internal paging system over every page the lookup cache knows.
    pub fn build_internal<P: Platform + ?Sized>(&mut self, p: &P) -> Result<PagingSystem, PagingError> {
        paging::build_internal(self, p)
    }

    /// Makes `tag` live. See [`PagingManager::switch`].
    pub fn switch<P: Platform + ?Sized>(&mut self, p: &P, tag: Tag) -> Result<bool, PagingError> {
        self.paging.switch(p, tag)
    }

    pub fn get<P: Platform + ?Sized>(&self, p: &P, tag: Tag) -> PagingSystem {
        self.paging.get(p, tag)
    }

    pub fn live_tag(&self) -> Tag {
        self.paging.live_tag()
    }

    #[cfg(feature = "failpoints")]
    fn take_map_denial(&self) -> bool {
        self.failpoints.deny_next_map.swap(false, Ordering::SeqCst)
    }

    #[cfg(not(feature = "failpoints"))]
    fn take_map_denial(&self) -> bool {
        false
    }
}
