// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Polled PL011 UART for debug output.
//!
//! The device only exists in the internal address space, so output is
//! dropped until [`attach`] records its mapping and whenever the external
//! system is live.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

const UART_DR: u32 = 0x00;
const UART_FR: u32 = 0x18;
const FR_TXFF: u32 = 1 << 5;

/// Virtual base of the mapped UART, 0 while detached.
static BASE: AtomicU32 = AtomicU32::new(0);
/// Whether the mapping is reachable through the live tables.
static REACHABLE: AtomicBool = AtomicBool::new(false);

static UART0: Mutex<KernelUart> = Mutex::new(KernelUart);

/// Records the internal mapping of the UART registers.
pub fn attach(va: u32) {
    BASE.store(va, Ordering::Release);
}

pub fn detach() {
    BASE.store(0, Ordering::Release);
}

/// Tracks whether the internal system (and thus the UART mapping) is live.
pub fn set_reachable(reachable: bool) {
    REACHABLE.store(reachable, Ordering::Release);
}

fn live_base() -> Option<u32> {
    let base = BASE.load(Ordering::Acquire);
    (base != 0 && REACHABLE.load(Ordering::Acquire)).then_some(base)
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
fn put(base: u32, byte: u8) {
    // SAFETY: `base` is the device mapping recorded by `attach` and the
    // internal tables are live.
    unsafe {
        while core::ptr::read_volatile((base + UART_FR) as *const u32) & FR_TXFF != 0 {}
        core::ptr::write_volatile((base + UART_DR) as *mut u32, byte as u32);
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn put(_base: u32, _byte: u8) {
    let _ = (UART_DR, UART_FR, FR_TXFF);
}

fn emit(base: u32, bytes: &[u8]) {
    for &byte in bytes {
        if byte == b'\n' {
            put(base, b'\r');
        }
        put(base, byte);
    }
}

/// Locked UART writer used by the logger.
pub struct KernelUart;

impl KernelUart {
    fn write_bytes(&mut self, base: u32, bytes: &[u8]) {
        emit(base, bytes);
    }
}

/// Writes raw bytes if the UART is free; output is dropped otherwise.
pub fn write_bytes(bytes: &[u8]) {
    let Some(base) = live_base() else { return };
    if let Some(mut uart) = UART0.try_lock() {
        uart.write_bytes(base, bytes);
    }
}

/// Lock-free writer for panic context where the mutex may already be held.
pub struct RawUart;

impl Write for RawUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(base) = live_base() {
            emit(base, s.as_bytes());
        }
        Ok(())
    }
}

pub fn raw_writer() -> RawUart {
    RawUart
}
