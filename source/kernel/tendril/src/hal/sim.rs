// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Simulated ARMv7 core for host tests
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! Physical memory is sparse (4 KiB frames allocated on first touch). Every
//! virtual access walks the live TTBCR/TTBR0/TTBR1 using the short-descriptor
//! rules, so a test fails loudly when the kernel touches an address its own
//! tables do not map. Maintenance and barrier operations are recorded in
//! order for assertions on the clean/invalidate discipline.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::{Cpu, Exec, Memory, SCTLR_V};
use crate::types::{PhysAddr, VirtAddr};
use crate::vector::Frame;

/// One recorded side effect on the simulated core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuOp {
    Dsb,
    Isb,
    SetTtbcr(u32),
    SetTtbr0(u32),
    SetTtbr1(u32),
    TlbInvalidateAll,
    TlbInvalidateMva(u32),
    CleanDcacheMva(u32),
    FlushEntireCache,
    DisableFiq,
    EnableFiq,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SimRegs {
    pub sctlr: u32,
    pub ttbcr: u32,
    pub ttbr0: u32,
    pub ttbr1: u32,
    pub prrr: u32,
    pub nmrr: u32,
    pub spsr: u32,
}

type EntryFn = Box<dyn FnMut(u32, [u32; 3]) -> u32 + Send>;
type HandlerFn = Box<dyn FnMut(u32, u32, &mut u32, &mut Frame) -> u32 + Send>;

struct SimState {
    regs: SimRegs,
    frames: BTreeMap<u32, Box<[u8; 4096]>>,
    ops: Vec<CpuOp>,
    fiq_masked: bool,
    exec: Option<EntryFn>,
    handler: Option<HandlerFn>,
    calls: Vec<(u32, [u32; 3])>,
}

/// Clones share one simulated core, so a test can keep a handle on a
/// platform it moved into the kernel.
#[derive(Clone)]
pub struct SimPlatform {
    state: Arc<Mutex<SimState>>,
}

impl SimState {
    fn phys_read_u8(&self, pa: u32) -> u8 {
        self.frames.get(&(pa >> 12)).map(|frame| frame[(pa & 0xFFF) as usize]).unwrap_or(0)
    }

    fn phys_write_u8(&mut self, pa: u32, value: u8) {
        let frame = self.frames.entry(pa >> 12).or_insert_with(|| Box::new([0u8; 4096]));
        frame[(pa & 0xFFF) as usize] = value;
    }

    fn phys_read_u32(&self, pa: u32) -> u32 {
        u32::from_le_bytes([
            self.phys_read_u8(pa),
            self.phys_read_u8(pa.wrapping_add(1)),
            self.phys_read_u8(pa.wrapping_add(2)),
            self.phys_read_u8(pa.wrapping_add(3)),
        ])
    }

    fn phys_write_u32(&mut self, pa: u32, value: u32) {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.phys_write_u8(pa.wrapping_add(i as u32), *byte);
        }
    }

    fn walk(&self, va: u32) -> Option<u32> {
        let n = self.regs.ttbcr & 0x7;
        let use_ttbr0 = n == 0 || (va >> (32 - n)) == 0;
        let ttbr = if use_ttbr0 {
            if n != 0 && self.regs.ttbcr & (1 << 4) != 0 {
                return None;
            }
            self.regs.ttbr0
        } else {
            if self.regs.ttbcr & (1 << 5) != 0 {
                return None;
            }
            self.regs.ttbr1
        };
        let base = if use_ttbr0 { ttbr & !((0x4000 >> n) - 1) } else { ttbr & 0xFFFF_C000 };
        let fld = self.phys_read_u32(base.wrapping_add((va >> 20) * 4));
        match fld & 0b11 {
            0b01 => {
                let l2 = fld & 0xFFFF_FC00;
                let sld = self.phys_read_u32(l2 + ((va >> 12) & 0xFF) * 4);
                match sld & 0b11 {
                    0b00 => None,
                    0b01 => Some((sld & 0xFFFF_0000) | (va & 0xFFFF)),
                    _ => Some((sld & 0xFFFF_F000) | (va & 0xFFF)),
                }
            }
            0b10 if fld & (1 << 18) == 0 => Some((fld & 0xFFF0_0000) | (va & 0xF_FFFF)),
            _ => None,
        }
    }

    fn must_walk(&self, va: u32) -> u32 {
        match self.walk(va) {
            Some(pa) => pa,
            None => panic!("simulated translation fault at va 0x{va:08x}"),
        }
    }
}

impl SimPlatform {
    pub fn new(regs: SimRegs) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                regs,
                frames: BTreeMap::new(),
                ops: Vec::new(),
                fiq_masked: false,
                exec: None,
                handler: None,
                calls: Vec::new(),
            })),
        }
    }

    pub fn regs(&self) -> SimRegs {
        self.state.lock().regs
    }

    pub fn set_spsr(&self, spsr: u32) {
        self.state.lock().regs.spsr = spsr;
    }

    pub fn set_remap(&self, sctlr: u32, prrr: u32, nmrr: u32) {
        let mut state = self.state.lock();
        state.regs.sctlr = sctlr;
        state.regs.prrr = prrr;
        state.regs.nmrr = nmrr;
    }

    pub fn phys_read_u32(&self, pa: u32) -> u32 {
        self.state.lock().phys_read_u32(pa)
    }

    pub fn phys_write_u32(&self, pa: u32, value: u32) {
        self.state.lock().phys_write_u32(pa, value)
    }

    pub fn phys_write_bytes(&self, pa: u32, bytes: &[u8]) {
        let mut state = self.state.lock();
        for (i, byte) in bytes.iter().enumerate() {
            state.phys_write_u8(pa + i as u32, *byte);
        }
    }

    pub fn phys_read_bytes(&self, pa: u32, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        (0..len).map(|i| state.phys_read_u8(pa + i as u32)).collect()
    }

    /// Walks the live tables without faulting.
    pub fn walk(&self, va: u32) -> Option<u32> {
        self.state.lock().walk(va)
    }

    pub fn ops(&self) -> Vec<CpuOp> {
        self.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    pub fn fiq_masked(&self) -> bool {
        self.state.lock().fiq_masked
    }

    /// Installs the behaviour of every foreign entry point.
    pub fn on_call(&self, f: impl FnMut(u32, [u32; 3]) -> u32 + Send + 'static) {
        self.state.lock().exec = Some(Box::new(f));
    }

    /// Installs the behaviour of every module handler, called with
    /// `(entry, context, handled, frame)`.
    pub fn on_handler(&self, f: impl FnMut(u32, u32, &mut u32, &mut Frame) -> u32 + Send + 'static) {
        self.state.lock().handler = Some(Box::new(f));
    }

    pub fn calls(&self) -> Vec<(u32, [u32; 3])> {
        self.state.lock().calls.clone()
    }

    fn record(&self, op: CpuOp) {
        self.state.lock().ops.push(op);
    }
}

impl Cpu for SimPlatform {
    fn sctlr(&self) -> u32 {
        self.state.lock().regs.sctlr
    }

    fn ttbcr(&self) -> u32 {
        self.state.lock().regs.ttbcr
    }

    fn set_ttbcr(&self, value: u32) {
        let mut state = self.state.lock();
        state.regs.ttbcr = value;
        state.ops.push(CpuOp::SetTtbcr(value));
    }

    fn ttbr0(&self) -> u32 {
        self.state.lock().regs.ttbr0
    }

    fn set_ttbr0(&self, value: u32) {
        let mut state = self.state.lock();
        state.regs.ttbr0 = value;
        state.ops.push(CpuOp::SetTtbr0(value));
    }

    fn ttbr1(&self) -> u32 {
        self.state.lock().regs.ttbr1
    }

    fn set_ttbr1(&self, value: u32) {
        let mut state = self.state.lock();
        state.regs.ttbr1 = value;
        state.ops.push(CpuOp::SetTtbr1(value));
    }

    fn prrr(&self) -> u32 {
        self.state.lock().regs.prrr
    }

    fn nmrr(&self) -> u32 {
        self.state.lock().regs.nmrr
    }

    fn spsr(&self) -> u32 {
        self.state.lock().regs.spsr
    }

    fn dsb(&self) {
        self.record(CpuOp::Dsb)
    }

    fn isb(&self) {
        self.record(CpuOp::Isb)
    }

    fn tlb_invalidate_all(&self) {
        self.record(CpuOp::TlbInvalidateAll)
    }

    fn tlb_invalidate_mva(&self, va: VirtAddr) {
        self.record(CpuOp::TlbInvalidateMva(va.raw() & !0xFFF))
    }

    fn dcache_clean_mva(&self, va: VirtAddr) {
        self.record(CpuOp::CleanDcacheMva(va.raw()))
    }

    fn flush_entire_cache(&self) {
        self.record(CpuOp::FlushEntireCache)
    }

    fn disable_fiq(&self) {
        let mut state = self.state.lock();
        state.fiq_masked = true;
        state.ops.push(CpuOp::DisableFiq);
    }

    fn enable_fiq(&self) {
        let mut state = self.state.lock();
        state.fiq_masked = false;
        state.ops.push(CpuOp::EnableFiq);
    }

    fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.state.lock().walk(va.raw()).map(PhysAddr)
    }
}

impl Memory for SimPlatform {
    fn read_u32(&self, va: VirtAddr) -> u32 {
        let state = self.state.lock();
        let pa = state.must_walk(va.raw());
        state.phys_read_u32(pa)
    }

    fn write_u32(&self, va: VirtAddr, value: u32) {
        let mut state = self.state.lock();
        let pa = state.must_walk(va.raw());
        state.phys_write_u32(pa, value)
    }

    fn read_u8(&self, va: VirtAddr) -> u8 {
        let state = self.state.lock();
        let pa = state.must_walk(va.raw());
        state.phys_read_u8(pa)
    }

    fn write_u8(&self, va: VirtAddr, value: u8) {
        let mut state = self.state.lock();
        let pa = state.must_walk(va.raw());
        state.phys_write_u8(pa, value)
    }
}

impl Exec for SimPlatform {
    unsafe fn call(&self, entry: VirtAddr, args: [u32; 3]) -> u32 {
        // Take the closure out so it may call back into the platform.
        let mut exec = {
            let mut state = self.state.lock();
            state.calls.push((entry.raw(), args));
            state.exec.take()
        };
        let status = match exec.as_mut() {
            Some(f) => f(entry.raw(), args),
            None => 0,
        };
        let mut state = self.state.lock();
        if state.exec.is_none() {
            state.exec = exec;
        }
        status
    }

    unsafe fn call_handler(&self, entry: VirtAddr, context: u32, handled: &mut u32, frame: &mut Frame) -> u32 {
        let mut handler = {
            let mut state = self.state.lock();
            state.calls.push((entry.raw(), [context, *handled, frame.reg(0)]));
            state.handler.take()
        };
        let status = match handler.as_mut() {
            Some(f) => f(entry.raw(), context, handled, frame),
            None => 0,
        };
        let mut state = self.state.lock();
        if state.handler.is_none() {
            state.handler = handler;
        }
        status
    }
}

/// Host-side layout produced by [`host_fixture`].
pub mod layout {
    /// Host first-level table (TTBR0 == TTBR1, N = 0).
    pub const HOST_L1: u32 = 0x8000_0000;
    /// Attribute bits the host keeps in its TTBRs.
    pub const HOST_TTBR_ATTRS: u32 = 0x4A;
    /// Second-level table covering the kernel workspace.
    pub const HOST_L2_WORKSPACE: u32 = 0x8000_4000;
    /// Second-level table covering the high vector page.
    pub const HOST_L2_VECTORS: u32 = 0x8000_4400;
    /// Empty second-level table the host owns at 0xC050_0000.
    pub const HOST_L2_SPARE: u32 = 0x8000_4800;
    /// Second-level table covering a host user buffer.
    pub const HOST_L2_USER: u32 = 0x8000_4C00;

    /// Kernel workspace (image + allocator arena), as injected by the host.
    pub const WORKSPACE_VA: u32 = 0xC040_0000;
    pub const WORKSPACE_PAGES: u32 = 64;
    pub const WORKSPACE_SIZE: u32 = WORKSPACE_PAGES * 0x1000;
    /// The image occupies the first 16 KiB of the workspace.
    pub const IMAGE_END: u32 = WORKSPACE_VA + 0x4000;
    pub const WORKSPACE_PA_TOP: u32 = 0x9000_0000;

    pub const VECTORS_VA: u32 = 0xFFFF_0000;
    pub const VECTORS_PA: u32 = 0x8010_0000;

    pub const USER_VA: u32 = 0x0040_0000;
    pub const USER_PA: u32 = 0x8800_0000;
    pub const USER_PAGES: u32 = 4;

    pub const SPARE_VA: u32 = 0xC050_0000;

    /// Original handler addresses encoded in the fixture vector table.
    pub const ORIG_UND: u32 = 0xFFFF_1000;
    pub const ORIG_SVC: u32 = 0xC010_2000;
    pub const ORIG_PABT: u32 = 0xFFFF_0100;
    pub const ORIG_DABT: u32 = 0xC010_3000;
    pub const ORIG_IRQ: u32 = 0xFFFF_0300;

    /// Physical frame of workspace page `index`. Frames run backwards so the
    /// mapping is contiguous in VA only.
    pub const fn workspace_pa(index: u32) -> u32 {
        WORKSPACE_PA_TOP + (WORKSPACE_PAGES - index) * 0x1000
    }
}

/// Builds a host address space resembling an injected environment: high
/// vectors, a workspace scattered over physical memory, a spare host L2
/// with free slots, and a user buffer below the split line.
pub fn host_fixture() -> SimPlatform {
    use layout::*;

    let ttbr = HOST_L1 | HOST_TTBR_ATTRS;
    let sim = SimPlatform::new(SimRegs {
        sctlr: SCTLR_V | 0x1,
        ttbcr: 0,
        ttbr0: ttbr,
        ttbr1: ttbr,
        prrr: 0,
        nmrr: 0,
        spsr: 0x13,
    });
    let table = |l2: u32| l2 | 0b01;
    let small = |pa: u32| (pa & 0xFFFF_F000) | 0b10 | (0b11 << 4) | 0b1100;

    sim.phys_write_u32(HOST_L1 + (WORKSPACE_VA >> 20) * 4, table(HOST_L2_WORKSPACE));
    for page in 0..WORKSPACE_PAGES {
        let l2i = ((WORKSPACE_VA >> 12) & 0xFF) + page;
        sim.phys_write_u32(HOST_L2_WORKSPACE + l2i * 4, small(workspace_pa(page)));
    }

    sim.phys_write_u32(HOST_L1 + (VECTORS_VA >> 20) * 4, table(HOST_L2_VECTORS));
    sim.phys_write_u32(HOST_L2_VECTORS + ((VECTORS_VA >> 12) & 0xFF) * 4, small(VECTORS_PA));

    sim.phys_write_u32(HOST_L1 + (SPARE_VA >> 20) * 4, table(HOST_L2_SPARE));

    sim.phys_write_u32(HOST_L1 + (USER_VA >> 20) * 4, table(HOST_L2_USER));
    for page in 0..USER_PAGES {
        let l2i = ((USER_VA >> 12) & 0xFF) + page;
        sim.phys_write_u32(HOST_L2_USER + l2i * 4, small(USER_PA + page * 0x1000));
    }

    // Vector table as a typical host lays it out.
    let vectors: [u32; 8] = [
        0xEF00_0000, // svc #0, never decoded
        0xEA00_03FD, // b 0xFFFF_1000
        0xE59F_F410, // ldr pc, [pc, #0x410]
        0xEA00_003B, // b 0xFFFF_0100
        0xE51F_F004, // ldr pc, [pc, #-4]
        0x0000_0000,
        0xEA00_00B8, // b 0xFFFF_0300
        0xE1A0_F009, // mov pc, r9
    ];
    for (i, word) in vectors.iter().enumerate() {
        sim.phys_write_u32(VECTORS_PA + i as u32 * 4, *word);
    }
    sim.phys_write_u32(VECTORS_PA + 0x420, ORIG_SVC);
    sim.phys_write_u32(VECTORS_PA + 0x14, ORIG_DABT);
    sim
}

#[cfg(test)]
mod tests {
    use super::layout::*;
    use super::*;

    #[test]
    fn fixture_walks_host_mappings() {
        let sim = host_fixture();
        assert_eq!(sim.walk(WORKSPACE_VA + 0x10), Some(workspace_pa(0) + 0x10));
        assert_eq!(sim.walk(WORKSPACE_VA + 0x3_F000), Some(workspace_pa(63)));
        assert_eq!(sim.walk(VECTORS_VA + 4), Some(VECTORS_PA + 4));
        assert_eq!(sim.walk(USER_VA + 0x1004), Some(USER_PA + 0x1004));
        assert_eq!(sim.walk(SPARE_VA), None);
        assert_eq!(sim.walk(0x1234_0000), None);
    }

    #[test]
    fn fixture_branch_targets_are_consistent() {
        // b at 0xFFFF_0004 with imm24 0x3FD lands on ORIG_UND.
        assert_eq!(VECTORS_VA + 4 + 8 + (0x3FD << 2), ORIG_UND);
        assert_eq!(VECTORS_VA + 0xC + 8 + (0x3B << 2), ORIG_PABT);
        assert_eq!(VECTORS_VA + 0x18 + 8 + (0xB8 << 2), ORIG_IRQ);
    }

    #[test]
    fn honours_ttbcr_split_and_pd0() {
        let sim = host_fixture();
        sim.set_ttbcr(2 | (1 << 4));
        // Below 1 GiB now goes through TTBR0 with walks disabled.
        assert_eq!(sim.walk(USER_VA), None);
        // Above it TTBR1 still points at the host table.
        assert_eq!(sim.walk(WORKSPACE_VA), Some(workspace_pa(0)));
    }

    #[test]
    fn exec_records_calls() {
        let sim = host_fixture();
        sim.on_call(|entry, args| entry + args[0]);
        let status = unsafe { sim.call(VirtAddr(0x100), [1, 2, 3]) };
        assert_eq!(status, 0x101);
        assert_eq!(sim.calls(), alloc::vec![(0x100, [1, 2, 3])]);
    }
}
