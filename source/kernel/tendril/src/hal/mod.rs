// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.
//!
//! Everything the kernel does to the core goes through these traits so the
//! table walks, vector patching and dispatch logic run unchanged against
//! [`sim::SimPlatform`] on the build host.

extern crate alloc;

use alloc::vec::Vec;

use crate::config::DCACHE_LINE;
use crate::types::{PhysAddr, VirtAddr, FOUR_KILOBYTES};
use crate::vector::Frame;

pub mod armv7;
#[cfg(test)]
pub mod sim;

/// SCTLR.V: exception vectors at 0xFFFF_0000.
pub const SCTLR_V: u32 = 1 << 13;
/// SCTLR.TRE: TEX remap enabled.
pub const SCTLR_TRE: u32 = 1 << 28;
/// CPSR/SPSR F bit: FIQ masked.
pub const PSR_F: u32 = 1 << 6;

/// Coprocessor register access plus barrier and maintenance primitives.
pub trait Cpu {
    fn sctlr(&self) -> u32;
    fn ttbcr(&self) -> u32;
    fn set_ttbcr(&self, value: u32);
    fn ttbr0(&self) -> u32;
    fn set_ttbr0(&self, value: u32);
    fn ttbr1(&self) -> u32;
    fn set_ttbr1(&self, value: u32);
    fn prrr(&self) -> u32;
    fn nmrr(&self) -> u32;
    /// Saved program status of the mode that took the current exception.
    fn spsr(&self) -> u32;

    fn dsb(&self);
    fn isb(&self);

    /// TLBIALL.
    fn tlb_invalidate_all(&self);
    /// TLBIMVA for the page containing `va`.
    fn tlb_invalidate_mva(&self, va: VirtAddr);
    /// DCCMVAC for the line containing `va`.
    fn dcache_clean_mva(&self, va: VirtAddr);
    /// Clean and invalidate every data and instruction cache level.
    fn flush_entire_cache(&self);

    fn disable_fiq(&self);
    fn enable_fiq(&self);

    /// Stage 1 privileged-read translation through the live tables.
    fn translate(&self, va: VirtAddr) -> Option<PhysAddr>;

    /// Invalidates every 4 KiB page of `[va, va + size)`, then synchronises.
    fn tlb_invalidate_region(&self, va: VirtAddr, size: u32) {
        let mut page = va.align_down(FOUR_KILOBYTES).raw();
        let end = va.raw().saturating_add(size.max(1));
        while page < end {
            self.tlb_invalidate_mva(VirtAddr(page));
            match page.checked_add(FOUR_KILOBYTES) {
                Some(next) => page = next,
                None => break,
            }
        }
        self.dsb();
        self.isb();
    }

    /// Cleans every data cache line overlapping `[va, va + size)`.
    fn dcache_clean_region(&self, va: VirtAddr, size: u32) {
        let mut line = va.align_down(DCACHE_LINE).raw();
        let end = va.raw().saturating_add(size.max(1));
        while line < end {
            self.dcache_clean_mva(VirtAddr(line));
            match line.checked_add(DCACHE_LINE) {
                Some(next) => line = next,
                None => break,
            }
        }
        self.dsb();
    }
}

/// Word and byte access at kernel virtual addresses.
///
/// Accesses that fault are not recoverable; callers only touch addresses
/// they mapped or that the lookup cache vouches for.
pub trait Memory {
    fn read_u32(&self, va: VirtAddr) -> u32;
    fn write_u32(&self, va: VirtAddr, value: u32);
    fn read_u8(&self, va: VirtAddr) -> u8;
    fn write_u8(&self, va: VirtAddr, value: u8);

    fn fill(&self, va: VirtAddr, len: u32, byte: u8) {
        if byte == 0 && va.raw() % 4 == 0 && len % 4 == 0 {
            for off in (0..len).step_by(4) {
                self.write_u32(va.add(off), 0);
            }
            return;
        }
        for off in 0..len {
            self.write_u8(va.add(off), byte);
        }
    }

    fn read_bytes(&self, va: VirtAddr, out: &mut [u8]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read_u8(va.add(i as u32));
        }
    }

    fn write_bytes(&self, va: VirtAddr, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.write_u8(va.add(i as u32), *byte);
        }
    }

    /// Reads a NUL-terminated string of at most `max` bytes (terminator excluded).
    fn read_cstr(&self, va: VirtAddr, max: usize) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        for i in 0..=max {
            let byte = self.read_u8(va.add(i as u32));
            if byte == 0 {
                return Some(out);
            }
            out.push(byte);
        }
        None
    }
}

/// Transfers control to foreign code (module entry points and handlers).
pub trait Exec {
    /// Calls `entry` with the AAPCS arguments r0..r2 and returns r0.
    ///
    /// # Safety
    /// `entry` must be the address of code that follows the AAPCS and is
    /// mapped executable in the live address space.
    unsafe fn call(&self, entry: VirtAddr, args: [u32; 3]) -> u32;

    /// Calls a module handler as `u32 entry(u32 context, u32 *handled, Frame *frame)`.
    ///
    /// # Safety
    /// As for [`Exec::call`]; `handled` and `frame` must stay valid for the
    /// duration of the call.
    unsafe fn call_handler(&self, entry: VirtAddr, context: u32, handled: &mut u32, frame: &mut Frame) -> u32 {
        let handled = handled as *mut u32 as usize as u32;
        let frame = frame as *mut Frame as usize as u32;
        unsafe { self.call(entry, [context, handled, frame]) }
    }
}

/// Everything the kernel needs from the machine it runs on.
pub trait Platform: Cpu + Memory + Exec {}

impl<T: Cpu + Memory + Exec> Platform for T {}
