// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler for standalone kernel images
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std, feature `panic_handler`)
//! DEPENDS_ON: uart::raw_writer(), vector::frame::recent()
//! INVARIANTS: No allocations; no locks beyond try_lock; output only while the UART is reachable

use core::fmt::Write;
use core::panic::PanicInfo;

use crate::uart;
use crate::vector::frame::{self, fmt_frame};
use crate::vector::Frame;

/// Frames printed after the panic message.
const SHOWN_FRAMES: usize = 4;

/// Emits the panic location and the most recent trampoline frames, then parks the core.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut w = uart::raw_writer();

    let _ = w.write_str("\nPANIC: ");
    if let Some(location) = info.location() {
        let _ = write!(w, "{}:{}: ", location.file(), location.line());
    }
    match info.message().as_str() {
        Some(msg) => {
            let _ = w.write_str(msg);
        }
        None => {
            let _ = w.write_str("<complex msg>");
        }
    }
    let _ = w.write_str("\n");

    let mut recent: [Option<(u32, Frame)>; SHOWN_FRAMES] = [None; SHOWN_FRAMES];
    let count = frame::recent(&mut recent);
    for (vector, frame) in recent[..count].iter().flatten() {
        let _ = w.write_str("PANIC: trap ");
        let _ = fmt_frame(*vector, frame, &mut w);
        let _ = w.write_str("\n");
    }

    loop {
        core::hint::spin_loop();
    }
}
