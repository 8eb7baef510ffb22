// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Memory-type attribute policy.
//!
//! With TEX remap enabled (SCTLR.TRE) and PRRR/NMRR implemented, the TEX[0],
//! C and B bits select one of eight remap regions; the region matching the
//! requested memory type is searched for. Otherwise a fixed table applies:
//! shareable, TEX = 0, write-back normal memory, bufferable device memory.

use super::{MapError, MapFlags};
use crate::hal::{Cpu, SCTLR_TRE};

const PRRR_SO: u32 = 0b00;
const PRRR_DEVICE: u32 = 0b01;
const PRRR_NORMAL: u32 = 0b10;
const PRRR_DS0: u32 = 1 << 16;
const PRRR_DS1: u32 = 1 << 17;
const PRRR_NS0: u32 = 1 << 18;
const PRRR_NS1: u32 = 1 << 19;
const NMRR_WB_NO_WA: u32 = 0b11;
const REMAP_REGIONS: u32 = 8;

/// Attribute bits shared by section and small-page descriptors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryAttributes {
    pub tex: u8,
    pub cacheable: bool,
    pub bufferable: bool,
    pub shareable: bool,
    pub execute_never: bool,
}

impl MemoryAttributes {
    fn from_region(index: u32, shareable: bool) -> Self {
        Self {
            tex: ((index >> 2) & 1) as u8,
            cacheable: (index >> 1) & 1 != 0,
            bufferable: index & 1 != 0,
            shareable,
            execute_never: false,
        }
    }
}

/// Resolves attributes for `flags` against the live remap registers.
pub fn resolve<C: Cpu + ?Sized>(cpu: &C, flags: MapFlags) -> Result<MemoryAttributes, MapError> {
    resolve_with(cpu.sctlr(), cpu.prrr(), cpu.nmrr(), flags)
}

/// Register-value form of [`resolve`].
pub fn resolve_with(sctlr: u32, prrr: u32, nmrr: u32, flags: MapFlags) -> Result<MemoryAttributes, MapError> {
    // Some cores set TRE but implement PRRR/NMRR as RAZ/WI.
    let remap = sctlr & SCTLR_TRE != 0 && prrr != 0 && nmrr != 0;
    let mut attrs = if remap { remapped(prrr, nmrr, flags)? } else { fallback(flags) };
    attrs.execute_never = flags.contains(MapFlags::EXECUTE_NEVER);
    Ok(attrs)
}

fn tr(prrr: u32, i: u32) -> u32 {
    (prrr >> (2 * i)) & 0b11
}

fn remapped(prrr: u32, nmrr: u32, flags: MapFlags) -> Result<MemoryAttributes, MapError> {
    if flags.contains(MapFlags::NORMAL_MEMORY) {
        let shareable = shareability(prrr, PRRR_NS0, PRRR_NS1)?;
        (0..REMAP_REGIONS)
            .find(|&i| {
                let nos = prrr & (1 << (24 + i)) != 0;
                let inner = (nmrr >> (2 * i)) & 0b11;
                let outer = (nmrr >> (16 + 2 * i)) & 0b11;
                tr(prrr, i) == PRRR_NORMAL && nos && inner == NMRR_WB_NO_WA && outer == NMRR_WB_NO_WA
            })
            .map(|i| MemoryAttributes::from_region(i, shareable))
            .ok_or(MapError::NoRemapRegion)
    } else if flags.contains(MapFlags::DEVICE_MEMORY) {
        let shareable = shareability(prrr, PRRR_DS0, PRRR_DS1)?;
        (0..REMAP_REGIONS)
            .find(|&i| tr(prrr, i) == PRRR_DEVICE)
            .map(|i| MemoryAttributes::from_region(i, shareable))
            .ok_or(MapError::NoRemapRegion)
    } else if flags.contains(MapFlags::STRONGLY_ORDERED) {
        (0..REMAP_REGIONS)
            .find(|&i| tr(prrr, i) == PRRR_SO)
            .map(|i| MemoryAttributes::from_region(i, false))
            .ok_or(MapError::NoRemapRegion)
    } else {
        Err(MapError::NoMemoryType)
    }
}

/// The S bit maps to whichever of the two PRRR shareability slots is set.
fn shareability(prrr: u32, when_clear: u32, when_set: u32) -> Result<bool, MapError> {
    if prrr & when_clear != 0 {
        Ok(false)
    } else if prrr & when_set != 0 {
        Ok(true)
    } else {
        Err(MapError::NoRemapRegion)
    }
}

fn fallback(flags: MapFlags) -> MemoryAttributes {
    let (cacheable, bufferable) = if flags.contains(MapFlags::NORMAL_MEMORY) {
        (true, true)
    } else if flags.contains(MapFlags::DEVICE_MEMORY) {
        (false, true)
    } else if flags.contains(MapFlags::STRONGLY_ORDERED) {
        (false, false)
    } else {
        (flags.contains(MapFlags::CACHEABLE), flags.contains(MapFlags::BUFFERABLE))
    };
    MemoryAttributes { tex: 0, cacheable, bufferable, shareable: true, execute_never: false }
}
