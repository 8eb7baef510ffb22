// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Rust view of the assembly trampolines and their per-vector slots.

use core::mem::size_of;
use core::sync::atomic::{AtomicU32, Ordering};

use static_assertions::const_assert_eq;

use super::{Vector, VECTOR_COUNT};
use crate::types::VirtAddr;

#[cfg(all(target_arch = "arm", target_os = "none"))]
core::arch::global_asm!(include_str!("../arch/armv7/vectors.S"), options(raw));

/// Words a trampoline reads and writes around a dispatch.
#[repr(C)]
#[derive(Debug, Default)]
pub struct VectorSlot {
    /// Host handler to chain to when the trap is not handled.
    pub original: AtomicU32,
    /// Non-zero when the dispatch handled the trap.
    pub handled: AtomicU32,
    /// Trapped sp, parked while the private stack is in use.
    pub saved_sp: AtomicU32,
    /// Top of the vector's private stack.
    pub stack_top: AtomicU32,
}

const_assert_eq!(size_of::<VectorSlot>(), 16);

pub type Slots = [VectorSlot; VECTOR_COUNT];

impl VectorSlot {
    pub const fn new() -> Self {
        Self {
            original: AtomicU32::new(0),
            handled: AtomicU32::new(0),
            saved_sp: AtomicU32::new(0),
            stack_top: AtomicU32::new(0),
        }
    }

    pub fn publish(&self, original: VirtAddr, stack_top: VirtAddr) {
        self.original.store(original.raw(), Ordering::Release);
        self.stack_top.store(stack_top.raw(), Ordering::Release);
    }

    pub fn set_handled(&self, handled: bool) {
        self.handled.store(handled as u32, Ordering::Release);
    }

    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Acquire) != 0
    }
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
extern "C" {
    static tendril_vector_slots: Slots;
    fn tendril_vector_trampoline_1();
    fn tendril_vector_trampoline_2();
    fn tendril_vector_trampoline_3();
    fn tendril_vector_trampoline_4();
    fn tendril_vector_trampoline_6();
}

/// The slot table the trampolines use.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn slots() -> &'static Slots {
    // SAFETY: the table is defined in vectors.S with exactly this layout and
    // is only accessed through atomics.
    unsafe { &*core::ptr::addr_of!(tendril_vector_slots) }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
static HOST_SLOTS: Slots = [const { VectorSlot::new() }; VECTOR_COUNT];

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub fn slots() -> &'static Slots {
    &HOST_SLOTS
}

/// Entry address of the trampoline for `vector`, if one is assembled.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn entry(vector: Vector) -> Option<VirtAddr> {
    let f: unsafe extern "C" fn() = match vector {
        Vector::UndefinedInstruction => tendril_vector_trampoline_1,
        Vector::SupervisorCall => tendril_vector_trampoline_2,
        Vector::PrefetchAbort => tendril_vector_trampoline_3,
        Vector::DataAbort => tendril_vector_trampoline_4,
        Vector::Interrupt => tendril_vector_trampoline_6,
        _ => return None,
    };
    Some(VirtAddr(f as usize as u32))
}

/// Host builds carry no trampolines; distinct placeholders keep the patched
/// literal pool observable in tests.
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub fn entry(vector: Vector) -> Option<VirtAddr> {
    vector.is_patched().then(|| VirtAddr(0xC0F0_0000 + vector as u32 * 0x40))
}
