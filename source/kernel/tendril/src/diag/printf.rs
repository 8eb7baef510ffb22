// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! `printf` for modules: `%s %c %o %x %d %p` over word-sized arguments.
//!
//! Rendering is byte-oriented and allocation-free apart from `%s`, whose
//! argument is a module address resolved by the caller.

extern crate alloc;

use alloc::vec::Vec;

fn digits(mut value: u32, radix: u32, out: &mut impl FnMut(u8)) {
    let mut buf = [0u8; 11];
    let mut i = buf.len();
    loop {
        i -= 1;
        let digit = (value % radix) as u8;
        buf[i] = if digit < 10 { b'0' + digit } else { b'a' + digit - 10 };
        value /= radix;
        if value == 0 {
            break;
        }
    }
    for &b in &buf[i..] {
        out(b);
    }
}

/// Renders `fmt` with `args`, passing each output byte to `out`.
///
/// Missing arguments render as zero. An unknown conversion emits the
/// conversion character itself; a trailing `%` is dropped. `\n` becomes
/// `\r\n`.
pub fn render(
    fmt: &[u8],
    args: &[u32],
    resolve_str: impl Fn(u32) -> Option<Vec<u8>>,
    out: &mut impl FnMut(u8),
) {
    let mut next = args.iter().copied();
    let mut bytes = fmt.iter().copied();
    while let Some(byte) = bytes.next() {
        match byte {
            b'%' => {
                let Some(conv) = bytes.next() else { break };
                match conv {
                    b's' => match resolve_str(next.next().unwrap_or(0)) {
                        Some(text) => {
                            for b in text {
                                emit_byte(b, out);
                            }
                        }
                        None => b"(null)".iter().for_each(|b| out(*b)),
                    },
                    b'c' => emit_byte(next.next().unwrap_or(0) as u8, out),
                    b'o' => digits(next.next().unwrap_or(0), 8, out),
                    b'x' | b'p' => digits(next.next().unwrap_or(0), 16, out),
                    b'd' => {
                        let value = next.next().unwrap_or(0) as i32;
                        if value < 0 {
                            out(b'-');
                        }
                        digits(value.unsigned_abs(), 10, out);
                    }
                    other => emit_byte(other, out),
                }
            }
            other => emit_byte(other, out),
        }
    }
}

fn emit_byte(byte: u8, out: &mut impl FnMut(u8)) {
    if byte == b'\n' {
        out(b'\r');
    }
    out(byte);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn run(fmt: &[u8], args: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        render(
            fmt,
            args,
            |addr| if addr == 0x1000 { Some(b"mod".to_vec()) } else { None },
            &mut |b| out.push(b),
        );
        out
    }

    #[test]
    fn numeric_conversions() {
        assert_eq!(run(b"%x %o %d %d", &[0xBEEF, 8, 42, (-7i32) as u32]), b"beef 10 42 -7".to_vec());
        assert_eq!(run(b"%p", &[0xC040_0000]), b"c0400000".to_vec());
        assert_eq!(run(b"%d", &[0x8000_0000]), b"-2147483648".to_vec());
    }

    #[test]
    fn strings_and_chars() {
        assert_eq!(run(b"[%s|%c]", &[0x1000, b'z' as u32]), b"[mod|z]".to_vec());
        assert_eq!(run(b"%s", &[0x2000]), b"(null)".to_vec());
    }

    #[test]
    fn newline_and_unknown_conversions() {
        assert_eq!(run(b"a\nb%q%", &[]), vec![b'a', b'\r', b'\n', b'b', b'q']);
        assert_eq!(run(b"%x", &[]), b"0".to_vec());
    }
}
