// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-page virtual/physical translations of the kernel workspace.
//!
//! Built once from the host's live tables at bring-up, before the kernel
//! owns any tables of its own; immutable afterwards.

extern crate alloc;

use alloc::vec::Vec;

use super::MapError;
use crate::hal::Cpu;
use crate::types::{PhysAddr, VirtAddr, FOUR_KILOBYTES};

/// One page of the workspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    pub va: VirtAddr,
    pub pa: PhysAddr,
    pub span: u32,
}

#[derive(Debug, Default)]
pub struct LookupCache {
    entries: Vec<Translation>,
}

impl LookupCache {
    /// Records the translation of every 4 KiB page of `[va, va + size)`.
    pub fn build<C: Cpu + ?Sized>(cpu: &C, va: VirtAddr, size: u32) -> Result<Self, MapError> {
        let start = va.align_down(FOUR_KILOBYTES);
        let end = va.raw().checked_add(size).ok_or(MapError::TooLarge)?;
        let mut entries = Vec::new();
        let mut page = start;
        while page.raw() < end {
            let pa = cpu.translate(page).ok_or(MapError::LookupMiss)?;
            entries.push(Translation { va: page, pa: pa.align_down(FOUR_KILOBYTES), span: FOUR_KILOBYTES });
            match page.raw().checked_add(FOUR_KILOBYTES) {
                Some(next) => page = VirtAddr(next),
                None => break,
            }
        }
        crate::log_debug!(target: "mm", "lookup: {} pages from {:?}", entries.len(), start);
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[Translation] {
        &self.entries
    }

    /// Workspace alias of `pa`.
    pub fn lookup_va(&self, pa: PhysAddr) -> Option<VirtAddr> {
        self.entries
            .iter()
            .find(|e| pa.align_down(e.span) == e.pa)
            .map(|e| e.va.add(pa.offset_in(e.span)))
    }

    /// Physical address behind workspace address `va`.
    pub fn lookup_pa(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.entries
            .iter()
            .find(|e| va.align_down(e.span) == e.va)
            .map(|e| e.pa.add(va.offset_in(e.span)))
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.lookup_pa(va).is_some()
    }
}
