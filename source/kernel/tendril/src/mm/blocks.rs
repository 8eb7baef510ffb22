// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! First-fit allocator over fixed 1 KiB blocks of the kernel workspace.
//!
//! Each block is described by one state byte: a used bit and an extend bit
//! that chains it to the following block of the same allocation. Memory is
//! handed out uninitialised.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::types::{VirtAddr, ONE_KILOBYTE};

pub const BLOCK_SIZE: u32 = ONE_KILOBYTE;

const USED: u8 = 1 << 0;
const EXTEND: u8 = 1 << 1;

/// Error returned by the block allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Zero-byte requests are refused.
    ZeroSize,
    /// Alignment is not a power of two.
    BadAlignment,
    /// No aligned run of free blocks is large enough.
    OutOfMemory,
    /// Pointer is outside the arena or does not start a live allocation.
    InvalidPointer,
}

pub struct BlockAllocator {
    base: VirtAddr,
    table: Vec<u8>,
}

impl BlockAllocator {
    /// Manages `[base, base + size)`; `base` is rounded up to a block boundary.
    pub fn new(base: VirtAddr, size: u32) -> Self {
        let aligned = (base.raw().wrapping_add(BLOCK_SIZE - 1)) & !(BLOCK_SIZE - 1);
        let lost = aligned.wrapping_sub(base.raw());
        let blocks = size.saturating_sub(lost) / BLOCK_SIZE;
        Self { base: VirtAddr(aligned), table: vec![0; blocks as usize] }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn capacity(&self) -> u32 {
        self.table.len() as u32 * BLOCK_SIZE
    }

    pub fn free_blocks(&self) -> usize {
        self.table.iter().filter(|s| **s & USED == 0).count()
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.base && va.raw() - self.base.raw() < self.capacity()
    }

    fn block_va(&self, index: usize) -> VirtAddr {
        self.base.add(index as u32 * BLOCK_SIZE)
    }

    pub fn alloc(&mut self, alignment: u32, size: u32) -> Result<VirtAddr, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() {
            return Err(AllocError::BadAlignment);
        }
        let needed = size.div_ceil(BLOCK_SIZE) as usize;
        let mut i = 0;
        while i < self.table.len() {
            if self.table[i] & USED != 0 || self.block_va(i).raw() & (alignment - 1) != 0 {
                i += 1;
                continue;
            }
            // Past this point no start index can fit the request.
            if i + needed > self.table.len() {
                return Err(AllocError::OutOfMemory);
            }
            match (i..i + needed).find(|&j| self.table[j] & USED != 0) {
                None => {
                    self.mark_used(i, needed);
                    return Ok(self.block_va(i));
                }
                // Nothing between i and the used block can fit either.
                Some(j) => i = j + 1,
            }
        }
        Err(AllocError::OutOfMemory)
    }

    fn mark_used(&mut self, start: usize, count: usize) {
        for slot in &mut self.table[start..start + count - 1] {
            *slot = USED | EXTEND;
        }
        self.table[start + count - 1] = USED;
    }

    /// Releases the allocation starting at `va` by following its extend chain.
    pub fn free(&mut self, va: VirtAddr) -> Result<(), AllocError> {
        if !self.contains(va) || va.offset_in(BLOCK_SIZE) != 0 {
            return Err(AllocError::InvalidPointer);
        }
        let mut i = ((va.raw() - self.base.raw()) / BLOCK_SIZE) as usize;
        if self.table[i] & USED == 0 {
            return Err(AllocError::InvalidPointer);
        }
        while i < self.table.len() {
            let state = self.table[i];
            self.table[i] = 0;
            if state & EXTEND == 0 {
                break;
            }
            i += 1;
        }
        Ok(())
    }

    /// Bytes reserved by the allocation starting at `va`.
    pub fn allocation_size(&self, va: VirtAddr) -> Option<u32> {
        if !self.contains(va) || va.offset_in(BLOCK_SIZE) != 0 {
            return None;
        }
        let start = ((va.raw() - self.base.raw()) / BLOCK_SIZE) as usize;
        if self.table[start] & USED == 0 {
            return None;
        }
        let run = self.table[start..].iter().take_while(|s| **s & EXTEND != 0).count() + 1;
        Some(run as u32 * BLOCK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 0xC040_4000;

    #[test]
    fn rounds_base_up_to_a_block() {
        let blocks = BlockAllocator::new(VirtAddr(BASE + 0x10), 8 * BLOCK_SIZE);
        assert_eq!(blocks.base(), VirtAddr(BASE + BLOCK_SIZE));
        assert_eq!(blocks.capacity(), 7 * BLOCK_SIZE);
    }

    #[test]
    fn first_fit_and_chain_free() {
        let mut blocks = BlockAllocator::new(VirtAddr(BASE), 16 * BLOCK_SIZE);
        let a = blocks.alloc(1, 3000).expect("a");
        let b = blocks.alloc(1, 1).expect("b");
        assert_eq!(a, VirtAddr(BASE));
        assert_eq!(b, VirtAddr(BASE + 3 * BLOCK_SIZE));
        assert_eq!(blocks.allocation_size(a), Some(3 * BLOCK_SIZE));
        blocks.free(a).expect("free a");
        assert_eq!(blocks.free_blocks(), 15);
        // The hole is reused first.
        assert_eq!(blocks.alloc(1, 2048).expect("c"), VirtAddr(BASE));
    }

    #[test]
    fn honours_alignment() {
        let mut blocks = BlockAllocator::new(VirtAddr(BASE + BLOCK_SIZE), 32 * BLOCK_SIZE);
        let page = blocks.alloc(0x1000, 0x1000).expect("page");
        assert_eq!(page.raw() % 0x1000, 0);
        assert_eq!(page, VirtAddr(BASE + 0x1000));
    }

    #[test]
    fn skips_runs_interrupted_by_used_blocks() {
        let mut blocks = BlockAllocator::new(VirtAddr(BASE), 6 * BLOCK_SIZE);
        let _a = blocks.alloc(1, 1).expect("a");
        let b = blocks.alloc(1, 1).expect("b");
        let _c = blocks.alloc(1, 1).expect("c");
        blocks.free(b).expect("free b");
        // The single free block at index 1 cannot hold two blocks.
        assert_eq!(blocks.alloc(1, 2 * BLOCK_SIZE).expect("d"), VirtAddr(BASE + 3 * BLOCK_SIZE));
    }

    #[test]
    fn rejects_bad_requests() {
        let mut blocks = BlockAllocator::new(VirtAddr(BASE), 4 * BLOCK_SIZE);
        assert_eq!(blocks.alloc(1, 0), Err(AllocError::ZeroSize));
        assert_eq!(blocks.alloc(3, 16), Err(AllocError::BadAlignment));
        assert_eq!(blocks.alloc(1, 5 * BLOCK_SIZE), Err(AllocError::OutOfMemory));
        assert_eq!(blocks.free(VirtAddr(BASE)), Err(AllocError::InvalidPointer));
        assert_eq!(blocks.free(VirtAddr(0x1000)), Err(AllocError::InvalidPointer));
    }
}
