// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Register frame built by the trampolines, plus the trap ring
//! OWNERS: @kernel-team
//! PUBLIC API: Frame, record(), recent(), fmt_frame(), Shown
//! INVARIANTS: Frame layout matches the push order in arch/armv7/vectors.S

use core::fmt::{self, Write};
use core::mem::size_of;

use static_assertions::const_assert_eq;

#[cfg(feature = "trap_ring")]
use spin::Mutex;

/// General registers of the trapped context, in push order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    /// r0..r12.
    pub r: [u32; 13],
    /// Stack pointer of the trapped mode.
    pub sp: u32,
    /// Banked lr of the exception mode (return address plus the mode's offset).
    pub lr: u32,
}

const_assert_eq!(size_of::<Frame>(), 15 * 4);

impl Frame {
    /// Frame with r0..r12 taken from `regs`.
    pub fn with_regs(regs: &[u32]) -> Self {
        let mut frame = Self::default();
        for (slot, value) in frame.r.iter_mut().zip(regs) {
            *slot = *value;
        }
        frame
    }

    /// Register `index` (0..=12); out-of-range reads are zero.
    pub fn reg(&self, index: usize) -> u32 {
        self.r.get(index).copied().unwrap_or(0)
    }

    pub fn set_reg(&mut self, index: usize, value: u32) {
        if let Some(slot) = self.r.get_mut(index) {
            *slot = value;
        }
    }
}

#[cfg(feature = "trap_ring")]
const TRAP_RING_LEN: usize = 8;

#[cfg(feature = "trap_ring")]
struct TrapRing {
    frames: [Option<(u32, Frame)>; TRAP_RING_LEN],
    next: usize,
}

#[cfg(feature = "trap_ring")]
static TRAP_RING: Mutex<TrapRing> = Mutex::new(TrapRing { frames: [None; TRAP_RING_LEN], next: 0 });

/// Remembers the frame a vector was entered with.
pub fn record(vector: u32, frame: &Frame) {
    #[cfg(feature = "trap_ring")]
    if let Some(mut ring) = TRAP_RING.try_lock() {
        let slot = ring.next % TRAP_RING_LEN;
        ring.frames[slot] = Some((vector, *frame));
        ring.next = (slot + 1) % TRAP_RING_LEN;
    }
    #[cfg(not(feature = "trap_ring"))]
    let _ = (vector, frame);
}

/// Recorded frames, most recent first. Empty without `trap_ring` or when the
/// ring is busy.
pub fn recent(out: &mut [Option<(u32, Frame)>]) -> usize {
    #[cfg(feature = "trap_ring")]
    if let Some(ring) = TRAP_RING.try_lock() {
        let mut count = 0;
        for i in 0..TRAP_RING_LEN {
            if count == out.len() {
                break;
            }
            let slot = (ring.next + TRAP_RING_LEN - 1 - i) % TRAP_RING_LEN;
            if let Some(entry) = ring.frames[slot] {
                out[count] = Some(entry);
                count += 1;
            }
        }
        return count;
    }
    let _ = out;
    0
}

/// `Display` adapter for [`fmt_frame`].
pub struct Shown<'a>(pub u32, pub &'a Frame);

impl fmt::Display for Shown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_frame(self.0, self.1, f)
    }
}

pub fn fmt_frame<W: Write>(vector: u32, frame: &Frame, f: &mut W) -> fmt::Result {
    write!(f, "vector={} lr=0x{:08x} sp=0x{:08x}", vector, frame.lr, frame.sp)?;
    for (i, value) in frame.r.iter().enumerate() {
        write!(f, " r{}=0x{:08x}", i, value)?;
    }
    Ok(())
}
