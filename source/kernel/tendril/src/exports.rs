// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: C ABI surface of the kernel
//! OWNERS: @kernel-team
//! PUBLIC API: tendril_start, tendril_vector_dispatch, EXPORT_NAMES, export_table()
//! DEPENDS_ON: boot::bring_up, kernel::Kernel, hal::armv7::Armv7
//! INVARIANTS:
//!   - Every service returns SUCCESS or FAILURE in r0; values travel through out pointers
//!   - Out pointers are kernel-space addresses written through the platform
//!
//! The register-level wrappers are generic over the platform so the same
//! conversions run in host tests; the `extern "C"` shims only look up the
//! installed kernel.

use core::fmt::Debug;

use spin::Once;

use crate::boot::{self, BootHeader};
use crate::hal::armv7::Armv7;
use crate::hal::{Memory, Platform};
use crate::handler::Handler;
use crate::kernel::Kernel;
use crate::mm::MapFlags;
use crate::types::{PhysAddr, VirtAddr, FAILURE, SUCCESS};
use crate::vector::{trampoline, Frame};

static KERNEL: Once<Kernel<Armv7>> = Once::new();

/// Names the kernel exports to modules, in [`export_table`] order.
pub const EXPORT_NAMES: [&[u8]; 11] = [
    b"printf",
    b"malloc",
    b"free",
    b"mmu_map",
    b"mmu_unmap",
    b"mmu_lookup_va",
    b"mmu_lookup_pa",
    b"call_register",
    b"call_unregister",
    b"vec_register",
    b"vec_unregister",
];

/// Exported services with their entry addresses.
pub fn export_table() -> [(&'static [u8], VirtAddr); 11] {
    let entries: [usize; 11] = [
        tendril_printf as usize,
        tendril_malloc as usize,
        tendril_free as usize,
        tendril_mmu_map as usize,
        tendril_mmu_unmap as usize,
        tendril_mmu_lookup_va as usize,
        tendril_mmu_lookup_pa as usize,
        tendril_call_register as usize,
        tendril_call_unregister as usize,
        tendril_vec_register as usize,
        tendril_vec_unregister as usize,
    ];
    core::array::from_fn(|i| (EXPORT_NAMES[i], VirtAddr(entries[i] as u32)))
}

fn status<T, E: Debug>(what: &str, result: Result<T, E>) -> u32 {
    match result {
        Ok(_) => SUCCESS,
        Err(err) => {
            crate::log_debug!(target: "abi", "{} failed: {:?}", what, err);
            FAILURE
        }
    }
}

fn foreign(function: u32, context: u32) -> Option<Handler> {
    (function != 0).then_some(Handler::Foreign { entry: VirtAddr(function), context })
}

// -------------------------------------------------------------------------
// Register-level wrappers
// -------------------------------------------------------------------------

pub fn printf<P: Platform>(k: &Kernel<P>, fmt: u32, args: [u32; 4]) -> u32 {
    match k.printf(VirtAddr(fmt), &args) {
        Some(_) => SUCCESS,
        None => FAILURE,
    }
}

/// Returns the block address, or 0.
pub fn malloc<P: Platform>(k: &Kernel<P>, size: u32) -> u32 {
    k.malloc(size).map(VirtAddr::raw).unwrap_or(0)
}

pub fn free<P: Platform>(k: &Kernel<P>, va: u32) -> u32 {
    status("free", k.free(VirtAddr(va)))
}

/// `*va` carries the requested address in and the mapped address out.
pub fn mmu_map<P: Platform>(k: &Kernel<P>, pa: u32, size: u32, flags: u32, va: u32) -> u32 {
    let (Some(flags), false) = (MapFlags::from_bits(flags), va == 0) else {
        return FAILURE;
    };
    let hint = VirtAddr(k.platform().read_u32(VirtAddr(va)));
    match k.map(PhysAddr(pa), size, flags, hint) {
        Ok(mapped) => {
            k.platform().write_u32(VirtAddr(va), mapped.raw());
            SUCCESS
        }
        Err(err) => status("mmu_map", Err::<(), _>(err)),
    }
}

pub fn mmu_unmap<P: Platform>(k: &Kernel<P>, va: u32, size: u32, flags: u32) -> u32 {
    let Some(flags) = MapFlags::from_bits(flags) else {
        return FAILURE;
    };
    status("mmu_unmap", k.unmap(VirtAddr(va), size, flags))
}

pub fn mmu_lookup_va<P: Platform>(k: &Kernel<P>, pa: u32, out: u32) -> u32 {
    if out == 0 {
        return FAILURE;
    }
    match k.lookup_va(PhysAddr(pa)) {
        Ok(va) => {
            k.platform().write_u32(VirtAddr(out), va.raw());
            SUCCESS
        }
        Err(err) => status("mmu_lookup_va", Err::<(), _>(err)),
    }
}

pub fn mmu_lookup_pa<P: Platform>(k: &Kernel<P>, va: u32, out: u32) -> u32 {
    if out == 0 {
        return FAILURE;
    }
    match k.lookup_pa(VirtAddr(va)) {
        Ok(pa) => {
            k.platform().write_u32(VirtAddr(out), pa.raw());
            SUCCESS
        }
        Err(err) => status("mmu_lookup_pa", Err::<(), _>(err)),
    }
}

pub fn call_register<P: Platform>(k: &Kernel<P>, identifier: u32, function: u32, context: u32) -> u32 {
    let Some(handler) = foreign(function, context) else { return FAILURE };
    status("call_register", k.register_call(identifier, handler))
}

pub fn call_unregister<P: Platform>(k: &Kernel<P>, identifier: u32, function: u32) -> u32 {
    let Some(handler) = foreign(function, 0) else { return FAILURE };
    status("call_unregister", k.unregister_call(identifier, &handler))
}

pub fn vec_register<P: Platform>(k: &Kernel<P>, vector: u32, function: u32, context: u32) -> u32 {
    let Some(handler) = foreign(function, context) else { return FAILURE };
    status("vec_register", k.register_vector(vector, handler))
}

pub fn vec_unregister<P: Platform>(k: &Kernel<P>, vector: u32, function: u32) -> u32 {
    let Some(handler) = foreign(function, 0) else { return FAILURE };
    status("vec_unregister", k.unregister_vector(vector, &handler))
}

// -------------------------------------------------------------------------
// C entry points
// -------------------------------------------------------------------------

/// Called by the boot stub with the image's `.header` record.
#[no_mangle]
pub extern "C" fn tendril_start(header: *const BootHeader) -> u32 {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    crate::mm::heap::init();

    // SAFETY: the boot stub passes the address of the linked header.
    let Some(header) = (unsafe { header.as_ref() }).copied() else {
        return FAILURE;
    };
    let result = KERNEL.try_call_once(|| {
        // SAFETY: bring-up runs once, privileged, on the core the host
        // injected us onto.
        let platform = unsafe { Armv7::new() };
        boot::bring_up(platform, &header, trampoline::slots(), &export_table())
    });
    status("bring-up", result)
}

/// Called by every trampoline with the frame it pushed.
#[no_mangle]
pub extern "C" fn tendril_vector_dispatch(vector: u32, frame: *mut Frame) {
    // SAFETY: the trampoline passes its own stack frame.
    let frame = unsafe { frame.as_mut() };
    match (KERNEL.get(), frame) {
        (Some(kernel), Some(frame)) => {
            kernel.dispatch(vector, frame);
        }
        _ => {
            if let Some(slot) = trampoline::slots().get(vector as usize) {
                slot.set_handled(false);
            }
        }
    }
}

fn with_kernel(f: impl FnOnce(&Kernel<Armv7>) -> u32) -> u32 {
    KERNEL.get().map_or(FAILURE, f)
}

extern "C" fn tendril_printf(fmt: u32, a0: u32, a1: u32, a2: u32, a3: u32) -> u32 {
    with_kernel(|k| printf(k, fmt, [a0, a1, a2, a3]))
}

extern "C" fn tendril_malloc(size: u32) -> u32 {
    KERNEL.get().map_or(0, |k| malloc(k, size))
}

extern "C" fn tendril_free(va: u32) -> u32 {
    with_kernel(|k| free(k, va))
}

extern "C" fn tendril_mmu_map(pa: u32, size: u32, flags: u32, va: u32) -> u32 {
    with_kernel(|k| mmu_map(k, pa, size, flags, va))
}

extern "C" fn tendril_mmu_unmap(va: u32, size: u32, flags: u32) -> u32 {
    with_kernel(|k| mmu_unmap(k, va, size, flags))
}

extern "C" fn tendril_mmu_lookup_va(pa: u32, out: u32) -> u32 {
    with_kernel(|k| mmu_lookup_va(k, pa, out))
}

extern "C" fn tendril_mmu_lookup_pa(va: u32, out: u32) -> u32 {
    with_kernel(|k| mmu_lookup_pa(k, va, out))
}

extern "C" fn tendril_call_register(identifier: u32, function: u32, context: u32) -> u32 {
    with_kernel(|k| call_register(k, identifier, function, context))
}

extern "C" fn tendril_call_unregister(identifier: u32, function: u32) -> u32 {
    with_kernel(|k| call_unregister(k, identifier, function))
}

extern "C" fn tendril_vec_register(vector: u32, function: u32, context: u32) -> u32 {
    with_kernel(|k| vec_register(k, vector, function, context))
}

extern "C" fn tendril_vec_unregister(vector: u32, function: u32) -> u32 {
    with_kernel(|k| vec_unregister(k, vector, function))
}
