// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot image for the Tendril kernel. Carries the `.header` record the host
//! injector fills in, the end callsign, and a `_start` stub that preserves
//! the host's registers and stack around `tendril::exports::tendril_start`.
#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

// Links the library's C surface into the image.
use tendril::exports::tendril_start as _;

// r0 on return is the bring-up status (0 on success). Interrupts stay masked
// until the host's CPSR is restored.
#[cfg(all(target_arch = "arm", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .header, "aw"
    .align 2
    .global tendril_header
tendril_header:
    .word {callsign}
    .word __image_end - tendril_header
    .word 0, 0, 0

    .section .end, "a"
    .align 2
    .word {callsign}

    .section .text._start, "ax"
    .arm
    .global _start
_start:
    push    {{r1-r12, lr}}
    mrs     r12, cpsr
    cpsid   if
    mov     r11, sp
    ldr     sp, =__boot_stack_top
    push    {{r11, r12}}
    ldr     r0, =tendril_header
    bl      tendril_start
    pop     {{r11, r12}}
    mov     sp, r11
    msr     cpsr_c, r12
    pop     {{r1-r12, pc}}
    .ltorg
"#,
    callsign = const tendril::config::CALLSIGN,
);

#[cfg(not(target_os = "none"))]
fn main() {}
