// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Internal/external paging-system pair
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Tag, PagingSystem, PagingManager::{switch, get, live_tag}
//! DEPENDS_ON: hal::Cpu, mm::lookup, mm::blocks
//! INVARIANTS:
//!   - Exactly one system is live; the manager stores the other one
//!   - The internal root is a quarter table: TTBR1 points 12 KiB below it
//!   - TTBCR is written before either TTBR on every switch
//!
//! The internal system uses TTBCR.N = 2 so TTBR1 translates everything at or
//! above 3 GiB, and sets PD0 so any address below the split faults. Only the
//! last quarter of the 16 KiB table TTBR1 names is ever indexed, so only that
//! quarter needs to exist.

use super::attrs::{self, MemoryAttributes};
use super::blocks::AllocError;
use super::descriptor::{
    ttbr_base, Fld, Sld, L2_TABLE_SIZE, TTBCR_N_MASK, TTBCR_PD0, TTBR_ATTR_MASK,
};
use super::{MapError, MapFlags, MemoryManager, SPLIT};
use crate::config::ROOT_SEARCH_ATTEMPTS;
use crate::hal::{Cpu, Platform};
use crate::types::{PhysAddr, VirtAddr, FOUR_KILOBYTES, ONE_KILOBYTE, SIXTEEN_KILOBYTES};

/// Offset of the quarter root within the table TTBR1 nominally points at.
pub const ROOT_SKEW: u32 = 3 * FOUR_KILOBYTES;
/// Entries in the quarter root.
pub const INTERNAL_L1_ENTRIES: u32 = FOUR_KILOBYTES / 4;

/// Which address space a descriptor describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    /// The kernel's private tables.
    Internal,
    /// The host's tables.
    External,
}

impl Tag {
    pub const fn inverse(self) -> Self {
        match self {
            Tag::Internal => Tag::External,
            Tag::External => Tag::Internal,
        }
    }
}

/// Register image of one paging system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PagingSystem {
    pub ttbr0: u32,
    pub ttbr1: u32,
    pub ttbcr: u32,
    pub tag: Tag,
}

impl PagingSystem {
    fn capture<C: Cpu + ?Sized>(cpu: &C, tag: Tag) -> Self {
        Self { ttbr0: cpu.ttbr0(), ttbr1: cpu.ttbr1(), ttbcr: cpu.ttbcr(), tag }
    }
}

/// Error returned by paging-system construction and switching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// No 4 KiB candidate sat 12 KiB above a 16 KiB physical boundary.
    NoAlignedRoot,
    /// The internal system has not been built.
    NotBuilt,
    /// A table entry could not be created.
    Map(MapError),
}

impl From<MapError> for PagingError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl From<AllocError> for PagingError {
    fn from(value: AllocError) -> Self {
        Self::Map(MapError::Alloc(value))
    }
}

/// Holds the non-live paging system and the location of the internal root.
#[derive(Debug, Default)]
pub struct PagingManager {
    stored: Option<PagingSystem>,
    internal_l1: Option<VirtAddr>,
}

impl PagingManager {
    pub const fn new() -> Self {
        Self { stored: None, internal_l1: None }
    }

    /// Workspace address of the internal quarter root, once built.
    pub fn internal_l1(&self) -> Option<VirtAddr> {
        self.internal_l1
    }

    pub fn stored(&self) -> Option<PagingSystem> {
        self.stored
    }

    /// Tag of the system currently loaded in hardware.
    pub fn live_tag(&self) -> Tag {
        self.stored.map(|s| s.tag.inverse()).unwrap_or(Tag::External)
    }

    /// Loads the stored system if its tag equals `tag`.
    ///
    /// The trigger is the stored descriptor, not the live one: bring-up
    /// builds the internal descriptor and then calls `switch(Internal)`,
    /// which swaps precisely because the stored tag matches. The live
    /// registers become the new stored descriptor. Returns whether a swap
    /// happened.
    pub fn switch<C: Cpu + ?Sized>(&mut self, cpu: &C, tag: Tag) -> Result<bool, PagingError> {
        let next = self.stored.ok_or(PagingError::NotBuilt)?;
        if next.tag != tag {
            return Ok(false);
        }
        let snapshot = PagingSystem::capture(cpu, tag.inverse());
        cpu.dsb();
        cpu.set_ttbcr(next.ttbcr);
        cpu.isb();
        cpu.set_ttbr1(next.ttbr1);
        cpu.set_ttbr0(next.ttbr0);
        cpu.isb();
        cpu.tlb_invalidate_all();
        cpu.dsb();
        cpu.isb();
        self.stored = Some(snapshot);
        crate::log_trace!(target: "mm", "paging: {:?} live", tag);
        Ok(true)
    }

    /// Descriptor for `tag` without switching: the stored one when it
    /// matches, otherwise the live registers.
    pub fn get<C: Cpu + ?Sized>(&self, cpu: &C, tag: Tag) -> PagingSystem {
        match self.stored {
            Some(stored) if stored.tag == tag => stored,
            _ => PagingSystem::capture(cpu, tag),
        }
    }
}

/// Places the quarter root, populates it with every workspace page and
/// stores the resulting descriptor.
pub(super) fn build_internal<P: Platform + ?Sized>(
    mm: &mut MemoryManager,
    p: &P,
) -> Result<PagingSystem, PagingError> {
    let l1 = place_root(mm)?;
    p.fill(l1, FOUR_KILOBYTES, 0);

    let attrs = attrs::resolve(p, MapFlags::NORMAL_MEMORY)?;
    let pages = mm.lookup.entries().to_vec();
    for page in &pages {
        if page.span != FOUR_KILOBYTES {
            return Err(MapError::TooLarge.into());
        }
        if page.va.raw() < SPLIT {
            return Err(MapError::BelowSplit.into());
        }
        populate(mm, p, l1, page.va, page.pa, attrs)?;
    }

    let root_pa = mm.lookup_pa(l1)?;
    let ttbr1 = root_pa.raw().wrapping_sub(ROOT_SKEW) | (p.ttbr1() & TTBR_ATTR_MASK);
    let ttbr0 = p.ttbr0() & TTBR_ATTR_MASK;
    let ttbcr = (p.ttbcr() & !TTBCR_N_MASK) | 2 | TTBCR_PD0;
    let system = PagingSystem { ttbr0, ttbr1, ttbcr, tag: Tag::Internal };

    p.flush_entire_cache();
    mm.paging.stored = Some(system);
    mm.paging.internal_l1 = Some(l1);
    crate::log_info!(
        target: "mm",
        "paging: internal root at {:?} ({:?}), {} pages",
        l1,
        ttbr_base(ttbr1).add(ROOT_SKEW),
        pages.len()
    );
    Ok(system)
}

/// Probes 4 KiB blocks until one sits 12 KiB past a 16 KiB physical boundary.
/// Every probe that is not kept is released again.
fn place_root(mm: &mut MemoryManager) -> Result<VirtAddr, PagingError> {
    let mut probes = [VirtAddr(0); ROOT_SEARCH_ATTEMPTS];
    let mut found = None;
    let mut result = Err(PagingError::NoAlignedRoot);
    let mut taken = 0;
    for slot in probes.iter_mut() {
        let va = match mm.alloc(FOUR_KILOBYTES, FOUR_KILOBYTES) {
            Ok(va) => va,
            Err(err) => {
                result = Err(err.into());
                break;
            }
        };
        *slot = va;
        taken += 1;
        match mm.lookup_pa(va) {
            Ok(pa) if pa.raw().wrapping_sub(ROOT_SKEW) % SIXTEEN_KILOBYTES == 0 => {
                found = Some(va);
                break;
            }
            Ok(_) => {}
            Err(err) => {
                result = Err(err.into());
                break;
            }
        }
    }
    for va in &probes[..taken] {
        if Some(*va) != found {
            let _ = mm.free(*va);
        }
    }
    match found {
        Some(va) => Ok(va),
        None => result,
    }
}

/// Writes the small-page entry for `va`, creating its second-level table on
/// first touch. Tables are reached through their workspace alias.
fn populate<P: Platform + ?Sized>(
    mm: &mut MemoryManager,
    p: &P,
    l1: VirtAddr,
    va: VirtAddr,
    pa: PhysAddr,
    attrs: MemoryAttributes,
) -> Result<(), PagingError> {
    let index = (va.raw() - SPLIT) >> 20;
    let fld_va = l1.add(index * 4);
    let mut fld = Fld(p.read_u32(fld_va));
    if fld.is_fault() {
        let l2 = mm.alloc(ONE_KILOBYTE, L2_TABLE_SIZE)?;
        p.fill(l2, L2_TABLE_SIZE, 0);
        fld = Fld::page_table(mm.lookup_pa(l2)?);
        p.write_u32(fld_va, fld.0);
    }
    if !fld.is_page_table() {
        return Err(MapError::NotPageTable.into());
    }
    let l2 = mm.lookup_va(fld.table_base())?;
    let sld_va = l2.add(super::descriptor::l2_index(va) * 4);
    p.write_u32(sld_va, Sld::small_page(pa, attrs).0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{host_fixture, layout::*, CpuOp, SimPlatform};
    use crate::mm::{BlockAllocator, LookupCache};

    fn manager(sim: &SimPlatform) -> MemoryManager {
        let lookup = LookupCache::build(sim, VirtAddr(WORKSPACE_VA), WORKSPACE_SIZE).expect("lookup");
        let blocks = BlockAllocator::new(VirtAddr(IMAGE_END), WORKSPACE_VA + WORKSPACE_SIZE - IMAGE_END);
        MemoryManager::new(lookup, blocks)
    }

    #[test]
    fn root_sits_twelve_kilobytes_past_alignment() {
        let sim = host_fixture();
        let mut mm = manager(&sim);
        let free_before = mm.blocks().free_blocks();
        let system = mm.build_internal(&sim).expect("build");
        assert_eq!(system.tag, Tag::Internal);
        assert_eq!((system.ttbr1 & 0xFFFF_C000) % SIXTEEN_KILOBYTES, 0);
        assert_eq!(system.ttbr1 & TTBR_ATTR_MASK, HOST_TTBR_ATTRS);
        assert_eq!(system.ttbr0, HOST_TTBR_ATTRS);
        assert_eq!(system.ttbcr & TTBCR_N_MASK, 2);
        assert_ne!(system.ttbcr & TTBCR_PD0, 0);
        let l1 = mm.paging().internal_l1().expect("root");
        assert_eq!(mm.lookup_pa(l1).expect("pa").raw(), (system.ttbr1 & 0xFFFF_C000) + ROOT_SKEW);
        // Only the root and the one second-level table stay allocated.
        assert_eq!(mm.blocks().free_blocks(), free_before - 4 - 1);
        assert!(sim.ops().contains(&CpuOp::FlushEntireCache));
    }

    #[test]
    fn switch_makes_the_workspace_visible_through_internal_tables() {
        let sim = host_fixture();
        let mut mm = manager(&sim);
        mm.build_internal(&sim).expect("build");
        assert_eq!(mm.live_tag(), Tag::External);
        assert_eq!(mm.switch(&sim, Tag::Internal), Ok(true));
        assert_eq!(mm.live_tag(), Tag::Internal);
        for page in 0..WORKSPACE_PAGES {
            assert_eq!(sim.walk(WORKSPACE_VA + page * 0x1000), Some(workspace_pa(page)));
        }
        // User space and the host's other mappings are gone.
        assert_eq!(sim.walk(USER_VA), None);
        assert_eq!(sim.walk(VECTORS_VA), None);
        assert_eq!(mm.get(&sim, Tag::External).ttbr0, HOST_L1 | HOST_TTBR_ATTRS);
    }

    #[test]
    fn switch_writes_control_before_roots() {
        let sim = host_fixture();
        let mut mm = manager(&sim);
        mm.build_internal(&sim).expect("build");
        sim.clear_ops();
        mm.switch(&sim, Tag::Internal).expect("switch");
        let ops = sim.ops();
        let ttbcr = ops.iter().position(|op| matches!(op, CpuOp::SetTtbcr(_))).expect("ttbcr");
        let ttbr1 = ops.iter().position(|op| matches!(op, CpuOp::SetTtbr1(_))).expect("ttbr1");
        let ttbr0 = ops.iter().position(|op| matches!(op, CpuOp::SetTtbr0(_))).expect("ttbr0");
        let flush = ops.iter().position(|op| *op == CpuOp::TlbInvalidateAll).expect("tlb");
        assert_eq!(ops[0], CpuOp::Dsb);
        assert!(ttbcr < ttbr1 && ttbr1 < ttbr0 && ttbr0 < flush);
    }

    #[test]
    fn switch_only_acts_when_the_stored_tag_matches() {
        let sim = host_fixture();
        let mut mm = manager(&sim);
        assert_eq!(mm.switch(&sim, Tag::Internal), Err(PagingError::NotBuilt));
        mm.build_internal(&sim).expect("build");
        assert_eq!(mm.switch(&sim, Tag::External), Ok(false));
        assert_eq!(mm.switch(&sim, Tag::Internal), Ok(true));
        assert_eq!(mm.switch(&sim, Tag::Internal), Ok(false));
        assert_eq!(mm.switch(&sim, Tag::External), Ok(true));
        assert_eq!(sim.regs().ttbr0, HOST_L1 | HOST_TTBR_ATTRS);
        assert_eq!(sim.regs().ttbcr, 0);
        assert_eq!(mm.live_tag(), Tag::External);
    }

    #[test]
    fn get_falls_back_to_live_registers() {
        let sim = host_fixture();
        let mm = manager(&sim);
        let live = mm.get(&sim, Tag::Internal);
        assert_eq!(live.ttbr1, HOST_L1 | HOST_TTBR_ATTRS);
        assert_eq!(live.tag, Tag::Internal);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn allocation_failure_surfaces() {
        let sim = host_fixture();
        let mut mm = manager(&sim);
        mm.failpoints().deny_next_alloc();
        assert_eq!(
            mm.build_internal(&sim),
            Err(PagingError::Map(MapError::Alloc(AllocError::OutOfMemory)))
        );
        assert!(mm.paging().stored().is_none());
    }
}
