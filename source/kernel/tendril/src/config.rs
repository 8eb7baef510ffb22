// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Build-time configuration knobs
//! OWNERS: @kernel-team
//! PUBLIC API: CALLSIGN, HEAP_SIZE, LOG_CAPACITY, UART_BASE, DCACHE_LINE
//! INVARIANTS: Values are fixed at compile time; malformed overrides fail the build
//!
//! Every knob may be overridden through the environment of the build
//! (`TENDRIL_CALLSIGN=0x1234 cargo build ...`). Values accept decimal or a
//! `0x` prefixed hexadecimal literal, with optional `_` separators.

/// Magic value the caller places in r0 to address the call multiplexer. The
/// boot header carries the same value at both ends of the image.
pub const CALLSIGN: u32 = parse_or(option_env!("TENDRIL_CALLSIGN"), 0x5445_4E44);

/// Size of the arena backing the kernel's own Rust heap.
pub const HEAP_SIZE: usize = parse_or(option_env!("TENDRIL_HEAP_SIZE"), 256 * 1024) as usize;

/// Capacity of the in-memory log ring.
pub const LOG_CAPACITY: usize = parse_or(option_env!("TENDRIL_LOG_CAPACITY"), 16 * 1024) as usize;

/// Physical base of the PL011 debug UART.
pub const UART_BASE: u32 = parse_or(option_env!("TENDRIL_UART_BASE"), 0x1000_9000);

/// Data cache line length used for clean-by-MVA loops.
pub const DCACHE_LINE: u32 = 32;

/// Size of each per-vector dispatch stack.
pub const VECTOR_STACK_SIZE: u32 = 8 * 1024;

/// Longest NUL-terminated string accepted from a caller.
pub const MAX_STRING: usize = 256;

/// Number of 4 KiB candidates probed when placing the internal root.
pub const ROOT_SEARCH_ATTEMPTS: usize = 64;

const fn parse_or(value: Option<&str>, default: u32) -> u32 {
    match value {
        Some(text) => parse_u32(text),
        None => default,
    }
}

const fn parse_u32(text: &str) -> u32 {
    let bytes = text.as_bytes();
    let (radix, mut i) = if bytes.len() > 2 && bytes[0] == b'0' && (bytes[1] == b'x' || bytes[1] == b'X') {
        (16u32, 2usize)
    } else {
        (10u32, 0usize)
    };
    let mut value: u32 = 0;
    let mut digits = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        if b == b'_' {
            continue;
        }
        let digit = match b {
            b'0'..=b'9' => (b - b'0') as u32,
            b'a'..=b'f' if radix == 16 => (b - b'a' + 10) as u32,
            b'A'..=b'F' if radix == 16 => (b - b'A' + 10) as u32,
            _ => panic!("invalid digit in tendril configuration value"),
        };
        value = match value.checked_mul(radix) {
            Some(v) => match v.checked_add(digit) {
                Some(v) => v,
                None => panic!("tendril configuration value overflows u32"),
            },
            None => panic!("tendril configuration value overflows u32"),
        };
        digits += 1;
    }
    if digits == 0 {
        panic!("empty tendril configuration value");
    }
    value
}
