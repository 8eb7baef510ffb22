// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! ARMv7-A implementation of the HAL traits.
//!
//! Coprocessor accesses compile to CP15 instructions on the bare-metal ARM
//! target; on every other target they are inert stubs so the crate still
//! type-checks and the host test suite can link.

use super::{Cpu, Exec, Memory};
use crate::types::{PhysAddr, VirtAddr};

/// The core the kernel was injected onto.
pub struct Armv7 {
    _private: (),
}

impl Armv7 {
    /// # Safety
    /// Only one instance may exist and only while running privileged on
    /// an ARMv7-A core with the VMSA enabled.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
macro_rules! mrc {
    ($op1:literal, $crn:literal, $crm:literal, $op2:literal) => {{
        let value: u32;
        unsafe {
            core::arch::asm!(
                concat!("mrc p15, ", $op1, ", {0}, ", $crn, ", ", $crm, ", ", $op2),
                out(reg) value,
                options(nomem, nostack, preserves_flags)
            );
        }
        value
    }};
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
macro_rules! mcr {
    ($op1:literal, $crn:literal, $crm:literal, $op2:literal, $value:expr) => {{
        let value: u32 = $value;
        unsafe {
            core::arch::asm!(
                concat!("mcr p15, ", $op1, ", {0}, ", $crn, ", ", $crm, ", ", $op2),
                in(reg) value,
                options(nostack, preserves_flags)
            );
        }
    }};
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
macro_rules! mrc {
    ($op1:literal, $crn:literal, $crm:literal, $op2:literal) => {{
        0u32
    }};
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
macro_rules! mcr {
    ($op1:literal, $crn:literal, $crm:literal, $op2:literal, $value:expr) => {{
        let _ = $value;
    }};
}

impl Cpu for Armv7 {
    fn sctlr(&self) -> u32 {
        mrc!("0", "c1", "c0", "0")
    }

    fn ttbcr(&self) -> u32 {
        mrc!("0", "c2", "c0", "2")
    }

    fn set_ttbcr(&self, value: u32) {
        mcr!("0", "c2", "c0", "2", value)
    }

    fn ttbr0(&self) -> u32 {
        mrc!("0", "c2", "c0", "0")
    }

    fn set_ttbr0(&self, value: u32) {
        mcr!("0", "c2", "c0", "0", value)
    }

    fn ttbr1(&self) -> u32 {
        mrc!("0", "c2", "c0", "1")
    }

    fn set_ttbr1(&self, value: u32) {
        mcr!("0", "c2", "c0", "1", value)
    }

    fn prrr(&self) -> u32 {
        mrc!("0", "c10", "c2", "0")
    }

    fn nmrr(&self) -> u32 {
        mrc!("0", "c10", "c2", "1")
    }

    fn spsr(&self) -> u32 {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            let value: u32;
            unsafe { core::arch::asm!("mrs {0}, spsr", out(reg) value, options(nomem, nostack)) };
            value
        }
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            0
        }
    }

    fn dsb(&self) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        unsafe {
            core::arch::asm!("dsb", options(nostack, preserves_flags));
        }
    }

    fn isb(&self) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        unsafe {
            core::arch::asm!("isb", options(nostack, preserves_flags));
        }
    }

    fn tlb_invalidate_all(&self) {
        mcr!("0", "c8", "c7", "0", 0);
        self.dsb();
        self.isb();
    }

    fn tlb_invalidate_mva(&self, va: VirtAddr) {
        mcr!("0", "c8", "c7", "1", va.raw() & !0xFFF)
    }

    fn dcache_clean_mva(&self, va: VirtAddr) {
        mcr!("0", "c7", "c10", "1", va.raw())
    }

    fn flush_entire_cache(&self) {
        // Clean and invalidate by set/way up to the level of coherency.
        let clidr = mrc!("1", "c0", "c0", "1");
        let loc = (clidr >> 24) & 0x7;
        for level in 0..loc {
            let ctype = (clidr >> (level * 3)) & 0x7;
            if ctype < 2 {
                continue;
            }
            mcr!("2", "c0", "c0", "0", level << 1);
            self.isb();
            let ccsidr = mrc!("1", "c0", "c0", "0");
            let line_shift = (ccsidr & 0x7) + 4;
            let ways = ((ccsidr >> 3) & 0x3FF) + 1;
            let sets = ((ccsidr >> 13) & 0x7FFF) + 1;
            let way_shift = (ways - 1).leading_zeros() & 31;
            for way in 0..ways {
                for set in 0..sets {
                    let word = (way.checked_shl(way_shift).unwrap_or(0)) | (set << line_shift) | (level << 1);
                    mcr!("0", "c7", "c14", "2", word);
                }
            }
        }
        self.dsb();
        mcr!("0", "c7", "c5", "0", 0);
        self.dsb();
        self.isb();
    }

    fn disable_fiq(&self) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        unsafe {
            core::arch::asm!("cpsid f", options(nomem, nostack));
        }
    }

    fn enable_fiq(&self) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        unsafe {
            core::arch::asm!("cpsie f", options(nomem, nostack));
        }
    }

    fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        mcr!("0", "c7", "c8", "0", va.raw());
        self.isb();
        let par = mrc!("0", "c7", "c4", "0");
        if !cfg!(all(target_arch = "arm", target_os = "none")) || par & 1 != 0 {
            return None;
        }
        Some(PhysAddr((par & 0xFFFF_F000) | va.offset_in(0x1000)))
    }
}

impl Memory for Armv7 {
    fn read_u32(&self, va: VirtAddr) -> u32 {
        // SAFETY: callers only pass addresses mapped in the live tables.
        unsafe { core::ptr::read_volatile(va.raw() as usize as *const u32) }
    }

    fn write_u32(&self, va: VirtAddr, value: u32) {
        // SAFETY: see read_u32.
        unsafe { core::ptr::write_volatile(va.raw() as usize as *mut u32, value) }
    }

    fn read_u8(&self, va: VirtAddr) -> u8 {
        // SAFETY: see read_u32.
        unsafe { core::ptr::read_volatile(va.raw() as usize as *const u8) }
    }

    fn write_u8(&self, va: VirtAddr, value: u8) {
        // SAFETY: see read_u32.
        unsafe { core::ptr::write_volatile(va.raw() as usize as *mut u8, value) }
    }
}

impl Exec for Armv7 {
    unsafe fn call(&self, entry: VirtAddr, args: [u32; 3]) -> u32 {
        let function: extern "C" fn(u32, u32, u32) -> u32 =
            core::mem::transmute::<usize, extern "C" fn(u32, u32, u32) -> u32>(entry.raw() as usize);
        function(args[0], args[1], args[2])
    }
}
