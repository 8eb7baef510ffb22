// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mapping engine: on-demand population of the internal quarter root and of
//! the host's tables.
//!
//! Host tables are never touched through host addresses. Each table page is
//! given a temporary internal alias, edited, and unmapped again, so every
//! external operation requires the internal system to be live.

extern crate alloc;

use alloc::vec::Vec;

use super::attrs::{self, MemoryAttributes};
use super::descriptor::{
    l1_index, l2_index, select_root, ttbr_base, Fld, Sld, L1_ENTRIES, L1_TABLE_SIZE, L2_ENTRIES,
    L2_TABLE_SIZE,
};
use super::paging::{PagingSystem, Tag, INTERNAL_L1_ENTRIES, ROOT_SKEW};
use super::{MapError, MapFlags, MemoryManager, SPLIT};
use crate::hal::Platform;
use crate::types::{PhysAddr, VirtAddr, FOUR_KILOBYTES, ONE_MEGABYTE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Granule {
    Page,
    Section,
}

impl Granule {
    fn for_request(pa: PhysAddr, size: u32) -> Result<Self, MapError> {
        if size == 0 {
            return Err(MapError::EmptyRange);
        }
        if pa.offset_in(FOUR_KILOBYTES) as u64 + size as u64 <= FOUR_KILOBYTES as u64 {
            Ok(Granule::Page)
        } else if pa.offset_in(ONE_MEGABYTE) as u64 + size as u64 <= ONE_MEGABYTE as u64 {
            Ok(Granule::Section)
        } else {
            Err(MapError::TooLarge)
        }
    }

    /// Unmap requests carry no physical offset; only the size decides.
    fn for_size(size: u32) -> Result<Self, MapError> {
        match size {
            0 => Err(MapError::EmptyRange),
            s if s <= FOUR_KILOBYTES => Ok(Granule::Page),
            s if s <= ONE_MEGABYTE => Ok(Granule::Section),
            _ => Err(MapError::TooLarge),
        }
    }

    const fn span(self) -> u32 {
        match self {
            Granule::Page => FOUR_KILOBYTES,
            Granule::Section => ONE_MEGABYTE,
        }
    }
}

/// Temporary internal view of a physical range.
///
/// An alias that reused a mapping somebody else owns is not unmapped on
/// release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub struct Alias {
    va: VirtAddr,
    size: u32,
    owned: bool,
}

impl Alias {
    pub fn va(&self) -> VirtAddr {
        self.va
    }
}

impl MemoryManager {
    /// Maps `size` bytes at `pa` as one small page or one section.
    ///
    /// `hint` is the requested virtual address (0 for the first free slot).
    /// With both INTERNAL and EXTERNAL set, each walk may use only the slot
    /// the address names, and the internal address feeds the external walk
    /// so the mapping lands at the same place in both spaces.
    pub fn map<P: Platform + ?Sized>(
        &mut self,
        p: &P,
        pa: PhysAddr,
        size: u32,
        flags: MapFlags,
        hint: VirtAddr,
    ) -> Result<VirtAddr, MapError> {
        if self.take_map_denial() {
            return Err(MapError::Denied);
        }
        if !flags.intersects(MapFlags::INTERNAL | MapFlags::EXTERNAL) {
            return Err(MapError::NoTarget);
        }
        let granule = Granule::for_request(pa, size)?;
        let attrs = attrs::resolve(p, flags)?;
        let exact = flags.contains(MapFlags::INTERNAL | MapFlags::EXTERNAL);

        let mut va = hint;
        if flags.contains(MapFlags::INTERNAL) {
            va = self.map_internal(p, pa, granule, attrs, va, exact)?;
        }
        if flags.contains(MapFlags::EXTERNAL) {
            match self.map_external(p, pa, granule, attrs, va, exact) {
                Ok(mapped) => va = mapped,
                Err(err) => {
                    if flags.contains(MapFlags::INTERNAL) {
                        let _ = self.unmap_internal(p, va, granule.span());
                    }
                    return Err(err);
                }
            }
        }
        crate::log_debug!(target: "mm", "map: {:?} -> {:?} ({:?}, {:?})", pa, va, granule, flags);
        Ok(va)
    }

    /// Clears the leaf entry for `va`. Emptied second-level tables are kept.
    pub fn unmap<P: Platform + ?Sized>(
        &mut self,
        p: &P,
        va: VirtAddr,
        size: u32,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        if !flags.intersects(MapFlags::INTERNAL | MapFlags::EXTERNAL) {
            return Err(MapError::NoTarget);
        }
        if flags.contains(MapFlags::INTERNAL) {
            self.unmap_internal(p, va, size)?;
        }
        if flags.contains(MapFlags::EXTERNAL) {
            self.unmap_external(p, va, size)?;
        }
        Ok(())
    }

    /// Maps `[pa, pa + size)` into the internal space for the kernel's own
    /// use, reusing an existing mapping of the same frame when there is one.
    pub fn map_alias<P: Platform + ?Sized>(&mut self, p: &P, pa: PhysAddr, size: u32) -> Result<Alias, MapError> {
        let granule = Granule::for_request(pa, size)?;
        let attrs = attrs::resolve(p, MapFlags::NORMAL_MEMORY)?;
        match self.map_internal(p, pa, granule, attrs, VirtAddr(0), false) {
            Ok(va) => Ok(Alias { va, size, owned: true }),
            Err(MapError::AlreadyMapped(va)) => Ok(Alias { va, size, owned: false }),
            Err(err) => Err(err),
        }
    }

    pub fn release_alias<P: Platform + ?Sized>(&mut self, p: &P, alias: Alias) -> Result<(), MapError> {
        if alias.owned {
            self.unmap_internal(p, alias.va, alias.size)
        } else {
            Ok(())
        }
    }

    /// Resolves a host virtual address through the host's tables.
    pub fn translate_external<P: Platform + ?Sized>(&mut self, p: &P, va: VirtAddr) -> Result<PhysAddr, MapError> {
        let host = self.paging.get(p, Tag::External);
        self.translate_in(p, &host, va)
    }

    /// Resolves `va` through the tables `host` describes.
    pub fn translate_in<P: Platform + ?Sized>(
        &mut self,
        p: &P,
        host: &PagingSystem,
        va: VirtAddr,
    ) -> Result<PhysAddr, MapError> {
        self.require_internal_live()?;
        let (root, size) = select_root(va, host.ttbr0, host.ttbr1, host.ttbcr).ok_or(MapError::WalkDisabled)?;
        let l1 = self.map_alias(p, root, size)?;
        let fld = Fld(p.read_u32(l1.va().add(l1_index(va) * 4)));
        self.release_alias(p, l1)?;

        if fld.is_section() {
            return Ok(fld.section_base().add(va.offset_in(ONE_MEGABYTE)));
        }
        if !fld.is_page_table() {
            return Err(MapError::Unmapped);
        }
        let l2 = self.map_alias(p, fld.table_base(), L2_TABLE_SIZE)?;
        let sld = Sld(p.read_u32(l2.va().add(l2_index(va) * 4)));
        self.release_alias(p, l2)?;
        sld.resolve(va).ok_or(MapError::Unmapped)
    }

    /// Copies host memory at `va` into `out`, one page at a time.
    pub fn copy_from_external<P: Platform + ?Sized>(
        &mut self,
        p: &P,
        va: VirtAddr,
        out: &mut [u8],
    ) -> Result<(), MapError> {
        let mut done = 0usize;
        while done < out.len() {
            let at = va.add(done as u32);
            let chunk = ((FOUR_KILOBYTES - at.offset_in(FOUR_KILOBYTES)) as usize).min(out.len() - done);
            let alias = self.page_alias(p, at, chunk as u32)?;
            p.read_bytes(alias.va(), &mut out[done..done + chunk]);
            self.release_alias(p, alias)?;
            done += chunk;
        }
        Ok(())
    }

    /// Copies `bytes` into host memory at `va`, one page at a time.
    pub fn copy_to_external<P: Platform + ?Sized>(&mut self, p: &P, va: VirtAddr, bytes: &[u8]) -> Result<(), MapError> {
        let mut done = 0usize;
        while done < bytes.len() {
            let at = va.add(done as u32);
            let chunk = ((FOUR_KILOBYTES - at.offset_in(FOUR_KILOBYTES)) as usize).min(bytes.len() - done);
            let alias = self.page_alias(p, at, chunk as u32)?;
            p.write_bytes(alias.va(), &bytes[done..done + chunk]);
            self.release_alias(p, alias)?;
            done += chunk;
        }
        Ok(())
    }

    pub fn read_external_u32<P: Platform + ?Sized>(&mut self, p: &P, va: VirtAddr) -> Result<u32, MapError> {
        let mut word = [0u8; 4];
        self.copy_from_external(p, va, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Reads a NUL-terminated host string of at most `max` bytes.
    pub fn read_external_cstr<P: Platform + ?Sized>(
        &mut self,
        p: &P,
        va: VirtAddr,
        max: usize,
    ) -> Result<Vec<u8>, MapError> {
        let mut out = Vec::new();
        loop {
            let at = va.add(out.len() as u32);
            let chunk = FOUR_KILOBYTES - at.offset_in(FOUR_KILOBYTES);
            let alias = self.page_alias(p, at, chunk)?;
            let mut terminated = false;
            for i in 0..chunk {
                let byte = p.read_u8(alias.va().add(i));
                if byte == 0 {
                    terminated = true;
                    break;
                }
                if out.len() == max {
                    break;
                }
                out.push(byte);
            }
            self.release_alias(p, alias)?;
            if terminated {
                return Ok(out);
            }
            if out.len() == max {
                return Err(MapError::Unterminated);
            }
        }
    }

    fn page_alias<P: Platform + ?Sized>(&mut self, p: &P, va: VirtAddr, len: u32) -> Result<Alias, MapError> {
        let pa = self.translate_external(p, va)?;
        self.map_alias(p, pa, len)
    }

    fn require_internal_live(&self) -> Result<(), MapError> {
        if self.paging.internal_l1().is_none() {
            return Err(MapError::NotBuilt);
        }
        if self.paging.live_tag() != Tag::Internal {
            return Err(MapError::InternalNotLive);
        }
        Ok(())
    }

    /// Workspace alias of the internal quarter root.
    fn internal_root<P: Platform + ?Sized>(&self, p: &P) -> Result<VirtAddr, MapError> {
        if self.paging.internal_l1().is_none() {
            return Err(MapError::NotBuilt);
        }
        let system = self.paging.get(p, Tag::Internal);
        self.lookup_va(ttbr_base(system.ttbr1).add(ROOT_SKEW))
    }

    fn map_internal<P: Platform + ?Sized>(
        &mut self,
        p: &P,
        pa: PhysAddr,
        granule: Granule,
        attrs: MemoryAttributes,
        hint: VirtAddr,
        exact: bool,
    ) -> Result<VirtAddr, MapError> {
        if !hint.is_null() && hint.raw() < SPLIT {
            return Err(MapError::BelowSplit);
        }
        let l1 = self.internal_root(p)?;
        // Only the slots walked below are checked for an existing mapping of `pa`.
        let relative = if hint.is_null() { VirtAddr(0) } else { VirtAddr(hint.raw() - SPLIT) };
        let first = l1_index(relative);
        let last = if exact { first + 1 } else { INTERNAL_L1_ENTRIES };
        for i in first..last {
            let fld_va = l1.add(i * 4);
            let mut fld = Fld(p.read_u32(fld_va));
            match granule {
                Granule::Section => {
                    if fld.is_section() && fld.section_base() == pa.align_down(ONE_MEGABYTE) {
                        return Err(MapError::AlreadyMapped(VirtAddr(SPLIT + (i << 20) + pa.offset_in(ONE_MEGABYTE))));
                    }
                    if fld.is_fault() {
                        p.write_u32(fld_va, Fld::section(pa, attrs).0);
                        p.dcache_clean_region(fld_va, 4);
                        let va = VirtAddr(SPLIT + (i << 20) + pa.offset_in(ONE_MEGABYTE));
                        p.tlb_invalidate_region(va.align_down(ONE_MEGABYTE), ONE_MEGABYTE);
                        return Ok(va);
                    }
                }
                Granule::Page => {
                    if fld.is_fault() {
                        let l2 = self.alloc(L2_TABLE_SIZE, L2_TABLE_SIZE)?;
                        p.fill(l2, L2_TABLE_SIZE, 0);
                        p.dcache_clean_region(l2, L2_TABLE_SIZE);
                        fld = Fld::page_table(self.lookup_pa(l2)?);
                        p.write_u32(fld_va, fld.0);
                        p.dcache_clean_region(fld_va, 4);
                    }
                    if !fld.is_page_table() {
                        continue;
                    }
                    let l2 = self.lookup_va(fld.table_base())?;
                    let start = if i == first { l2_index(relative) } else { 0 };
                    let end = if exact { start + 1 } else { L2_ENTRIES };
                    for j in start..end {
                        let sld_va = l2.add(j * 4);
                        let sld = Sld(p.read_u32(sld_va));
                        let va = VirtAddr(SPLIT + (i << 20) + (j << 12) + pa.offset_in(FOUR_KILOBYTES));
                        if sld.is_small_page() && sld.page_base() == pa.align_down(FOUR_KILOBYTES) {
                            return Err(MapError::AlreadyMapped(va));
                        }
                        if sld.is_fault() {
                            p.write_u32(sld_va, Sld::small_page(pa, attrs).0);
                            p.dcache_clean_region(sld_va, 4);
                            p.tlb_invalidate_region(va.align_down(FOUR_KILOBYTES), FOUR_KILOBYTES);
                            return Ok(va);
                        }
                    }
                }
            }
        }
        Err(MapError::NoFreeSlot)
    }

    fn unmap_internal<P: Platform + ?Sized>(&mut self, p: &P, va: VirtAddr, size: u32) -> Result<(), MapError> {
        if va.raw() < SPLIT {
            return Err(MapError::BelowSplit);
        }
        let granule = Granule::for_size(size)?;
        let l1 = self.internal_root(p)?;
        let fld_va = l1.add(((va.raw() - SPLIT) >> 20) * 4);
        let fld = Fld(p.read_u32(fld_va));
        match granule {
            Granule::Page => {
                if !fld.is_page_table() {
                    return Err(MapError::NotPageTable);
                }
                let l2 = self.lookup_va(fld.table_base())?;
                let sld_va = l2.add(l2_index(va) * 4);
                if !Sld(p.read_u32(sld_va)).is_small_page() {
                    return Err(MapError::NotSmallPage);
                }
                p.write_u32(sld_va, Sld::FAULT.0);
                p.tlb_invalidate_region(va.align_down(FOUR_KILOBYTES), FOUR_KILOBYTES);
                p.dcache_clean_region(sld_va, 4);
            }
            Granule::Section => {
                if !fld.is_section() {
                    return Err(MapError::NotSection);
                }
                p.write_u32(fld_va, Fld::FAULT.0);
                p.tlb_invalidate_region(va.align_down(ONE_MEGABYTE), ONE_MEGABYTE);
                p.dcache_clean_region(fld_va, 4);
            }
        }
        Ok(())
    }

    /// Host root used for mapping: the table TTBR1 of the external system names.
    fn host_root<P: Platform + ?Sized>(&self, p: &P) -> PhysAddr {
        ttbr_base(self.paging.get(p, Tag::External).ttbr1)
    }

    fn map_external<P: Platform + ?Sized>(
        &mut self,
        p: &P,
        pa: PhysAddr,
        granule: Granule,
        attrs: MemoryAttributes,
        hint: VirtAddr,
        exact: bool,
    ) -> Result<VirtAddr, MapError> {
        self.require_internal_live()?;
        let root = self.host_root(p);
        let l1 = self.map_alias(p, root, L1_TABLE_SIZE)?;
        let claimed = self.claim_external(p, l1.va(), pa, granule, attrs, hint, exact);
        let released = self.release_alias(p, l1);
        let va = claimed?;
        released?;
        Ok(va)
    }

    #[allow(clippy::too_many_arguments)]
    fn claim_external<P: Platform + ?Sized>(
        &mut self,
        p: &P,
        l1: VirtAddr,
        pa: PhysAddr,
        granule: Granule,
        attrs: MemoryAttributes,
        hint: VirtAddr,
        exact: bool,
    ) -> Result<VirtAddr, MapError> {
        let first = l1_index(hint);
        let last = if exact { first + 1 } else { L1_ENTRIES };
        for i in first..last {
            let fld_va = l1.add(i * 4);
            let fld = Fld(p.read_u32(fld_va));
            match granule {
                Granule::Section => {
                    if fld.is_section() && fld.section_base() == pa.align_down(ONE_MEGABYTE) {
                        return Err(MapError::AlreadyMapped(VirtAddr((i << 20) | pa.offset_in(ONE_MEGABYTE))));
                    }
                    if fld.is_fault() {
                        p.write_u32(fld_va, Fld::section(pa, attrs).0);
                        p.dcache_clean_region(fld_va, 4);
                        let va = VirtAddr((i << 20) | pa.offset_in(ONE_MEGABYTE));
                        p.tlb_invalidate_region(va.align_down(ONE_MEGABYTE), ONE_MEGABYTE);
                        return Ok(va);
                    }
                }
                Granule::Page => {
                    if !fld.is_page_table() {
                        continue;
                    }
                    let l2 = self.map_alias(p, fld.table_base(), L2_TABLE_SIZE)?;
                    let start = if i == first { l2_index(hint) } else { 0 };
                    let end = if exact { start + 1 } else { L2_ENTRIES };
                    let claimed = claim_page(p, l2.va(), i, start..end, pa, attrs);
                    self.release_alias(p, l2)?;
                    if let Some(outcome) = claimed {
                        return outcome;
                    }
                }
            }
        }
        Err(MapError::NoFreeSlot)
    }

    fn unmap_external<P: Platform + ?Sized>(&mut self, p: &P, va: VirtAddr, size: u32) -> Result<(), MapError> {
        let granule = Granule::for_size(size)?;
        self.require_internal_live()?;
        let root = self.host_root(p);
        let l1 = self.map_alias(p, root, L1_TABLE_SIZE)?;
        let cleared = self.clear_external(p, l1.va(), va, granule);
        let released = self.release_alias(p, l1);
        cleared?;
        released
    }

    fn clear_external<P: Platform + ?Sized>(
        &mut self,
        p: &P,
        l1: VirtAddr,
        va: VirtAddr,
        granule: Granule,
    ) -> Result<(), MapError> {
        let fld_va = l1.add(l1_index(va) * 4);
        let fld = Fld(p.read_u32(fld_va));
        match granule {
            Granule::Page => {
                if !fld.is_page_table() {
                    return Err(MapError::NotPageTable);
                }
                let l2 = self.map_alias(p, fld.table_base(), L2_TABLE_SIZE)?;
                let sld_va = l2.va().add(l2_index(va) * 4);
                let outcome = if Sld(p.read_u32(sld_va)).is_small_page() {
                    p.write_u32(sld_va, Sld::FAULT.0);
                    p.tlb_invalidate_region(va.align_down(FOUR_KILOBYTES), FOUR_KILOBYTES);
                    p.dcache_clean_region(sld_va, 4);
                    Ok(())
                } else {
                    Err(MapError::NotSmallPage)
                };
                self.release_alias(p, l2)?;
                outcome
            }
            Granule::Section => {
                if !fld.is_section() {
                    return Err(MapError::NotSection);
                }
                p.write_u32(fld_va, Fld::FAULT.0);
                p.tlb_invalidate_region(va.align_down(ONE_MEGABYTE), ONE_MEGABYTE);
                p.dcache_clean_region(fld_va, 4);
                Ok(())
            }
        }
    }
}

/// Claims the first free slot of `slots` in a host second-level table.
/// `None` means the range was exhausted without a decision.
fn claim_page<P: Platform + ?Sized>(
    p: &P,
    l2: VirtAddr,
    l1_slot: u32,
    slots: core::ops::Range<u32>,
    pa: PhysAddr,
    attrs: MemoryAttributes,
) -> Option<Result<VirtAddr, MapError>> {
    for j in slots {
        let sld_va = l2.add(j * 4);
        let sld = Sld(p.read_u32(sld_va));
        let va = VirtAddr((l1_slot << 20) | (j << 12) | pa.offset_in(FOUR_KILOBYTES));
        if sld.is_small_page() && sld.page_base() == pa.align_down(FOUR_KILOBYTES) {
            return Some(Err(MapError::AlreadyMapped(va)));
        }
        if sld.is_fault() {
            p.write_u32(sld_va, Sld::small_page(pa, attrs).0);
            p.dcache_clean_region(sld_va, 4);
            p.tlb_invalidate_region(va.align_down(FOUR_KILOBYTES), FOUR_KILOBYTES);
            return Some(Ok(va));
        }
    }
    None
}
