// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! ARMv7 short-descriptor encodings: first-level (FLD) and second-level
//! (SLD) entries, TTBR/TTBCR fields and virtual-address indexing.

use super::attrs::MemoryAttributes;
use crate::types::{PhysAddr, VirtAddr};

/// Entries in an architectural first-level table.
pub const L1_ENTRIES: u32 = 4096;
/// Entries in a second-level table.
pub const L2_ENTRIES: u32 = 256;
/// Bytes spanned by a full first-level table.
pub const L1_TABLE_SIZE: u32 = L1_ENTRIES * 4;
/// Bytes spanned by a second-level table.
pub const L2_TABLE_SIZE: u32 = L2_ENTRIES * 4;

/// TTBR bits [31:14] hold the table base when N = 0.
pub const TTBR_BASE_MASK: u32 = 0xFFFF_C000;
pub const TTBR_ATTR_MASK: u32 = !TTBR_BASE_MASK;

pub const TTBCR_N_MASK: u32 = 0x7;
pub const TTBCR_PD0: u32 = 1 << 4;
pub const TTBCR_PD1: u32 = 1 << 5;

const TYPE_MASK: u32 = 0b11;
const FLD_PAGE_TABLE: u32 = 0b01;
const FLD_SECTION: u32 = 0b10;
const FLD_SUPERSECTION: u32 = 1 << 18;

const SEC_B: u32 = 1 << 2;
const SEC_C: u32 = 1 << 3;
const SEC_XN: u32 = 1 << 4;
const SEC_AP_SHIFT: u32 = 10;
const SEC_TEX_SHIFT: u32 = 12;
const SEC_S: u32 = 1 << 16;

const SLD_LARGE: u32 = 0b01;
const SLD_SMALL: u32 = 0b10;
const SLD_XN: u32 = 1 << 0;
const SLD_B: u32 = 1 << 2;
const SLD_C: u32 = 1 << 3;
const SLD_AP_SHIFT: u32 = 4;
const SLD_TEX_SHIFT: u32 = 6;
const SLD_S: u32 = 1 << 10;

/// AP[1:0] = 0b11 with AP[2] clear: read/write at every privilege level.
const AP_READ_WRITE: u32 = 0b11;

pub const fn l1_index(va: VirtAddr) -> u32 {
    va.raw() >> 20
}

pub const fn l2_index(va: VirtAddr) -> u32 {
    (va.raw() >> 12) & 0xFF
}

/// First-level descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Fld(pub u32);

impl Fld {
    pub const FAULT: Fld = Fld(0);

    pub const fn page_table(table: PhysAddr) -> Self {
        Fld((table.raw() & 0xFFFF_FC00) | FLD_PAGE_TABLE)
    }

    pub fn section(pa: PhysAddr, attrs: MemoryAttributes) -> Self {
        let mut raw = (pa.raw() & 0xFFF0_0000) | FLD_SECTION | (AP_READ_WRITE << SEC_AP_SHIFT);
        raw |= (attrs.tex as u32 & 0x7) << SEC_TEX_SHIFT;
        if attrs.cacheable {
            raw |= SEC_C;
        }
        if attrs.bufferable {
            raw |= SEC_B;
        }
        if attrs.shareable {
            raw |= SEC_S;
        }
        if attrs.execute_never {
            raw |= SEC_XN;
        }
        Fld(raw)
    }

    pub const fn is_fault(self) -> bool {
        self.0 & TYPE_MASK == 0
    }

    pub const fn is_page_table(self) -> bool {
        self.0 & TYPE_MASK == FLD_PAGE_TABLE
    }

    pub const fn is_section(self) -> bool {
        self.0 & TYPE_MASK == FLD_SECTION && self.0 & FLD_SUPERSECTION == 0
    }

    /// Physical base of the second-level table.
    pub const fn table_base(self) -> PhysAddr {
        PhysAddr(self.0 & 0xFFFF_FC00)
    }

    pub const fn section_base(self) -> PhysAddr {
        PhysAddr(self.0 & 0xFFF0_0000)
    }
}

/// Second-level descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Sld(pub u32);

impl Sld {
    pub const FAULT: Sld = Sld(0);

    pub fn small_page(pa: PhysAddr, attrs: MemoryAttributes) -> Self {
        let mut raw = (pa.raw() & 0xFFFF_F000) | SLD_SMALL | (AP_READ_WRITE << SLD_AP_SHIFT);
        raw |= (attrs.tex as u32 & 0x7) << SLD_TEX_SHIFT;
        if attrs.cacheable {
            raw |= SLD_C;
        }
        if attrs.bufferable {
            raw |= SLD_B;
        }
        if attrs.shareable {
            raw |= SLD_S;
        }
        if attrs.execute_never {
            raw |= SLD_XN;
        }
        Sld(raw)
    }

    pub const fn is_fault(self) -> bool {
        self.0 & TYPE_MASK == 0
    }

    pub const fn is_large_page(self) -> bool {
        self.0 & TYPE_MASK == SLD_LARGE
    }

    /// Small pages use either encoding of bit 1 (bit 0 is XN).
    pub const fn is_small_page(self) -> bool {
        self.0 & SLD_SMALL != 0
    }

    /// Physical address `va` resolves to through this entry.
    pub const fn resolve(self, va: VirtAddr) -> Option<PhysAddr> {
        if self.is_small_page() {
            Some(PhysAddr((self.0 & 0xFFFF_F000) | (va.raw() & 0xFFF)))
        } else if self.is_large_page() {
            Some(PhysAddr((self.0 & 0xFFFF_0000) | (va.raw() & 0xFFFF)))
        } else {
            None
        }
    }

    pub const fn page_base(self) -> PhysAddr {
        PhysAddr(self.0 & 0xFFFF_F000)
    }
}

/// Base and size of the first-level table that translates `va` under
/// `ttbcr`. With N > 0 the TTBR0 table shrinks to 16 KiB >> N.
///
/// Returns `None` when the selected half has table walks disabled.
pub const fn select_root(va: VirtAddr, ttbr0: u32, ttbr1: u32, ttbcr: u32) -> Option<(PhysAddr, u32)> {
    let n = ttbcr & TTBCR_N_MASK;
    if n == 0 {
        return Some((ttbr_base(ttbr0), L1_TABLE_SIZE));
    }
    if va.raw() >> (32 - n) == 0 {
        if ttbcr & TTBCR_PD0 != 0 {
            return None;
        }
        let size = L1_TABLE_SIZE >> n;
        Some((PhysAddr(ttbr0 & !(size - 1)), size))
    } else if ttbcr & TTBCR_PD1 != 0 {
        None
    } else {
        Some((ttbr_base(ttbr1), L1_TABLE_SIZE))
    }
}

pub const fn ttbr_base(ttbr: u32) -> PhysAddr {
    PhysAddr(ttbr & TTBR_BASE_MASK)
}
