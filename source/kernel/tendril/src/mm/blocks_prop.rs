// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the block allocator
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Returned addresses honour the requested power-of-two alignment
//!   - An alloc/free pair leaves the allocator able to repeat the request
//!   - Live allocations never overlap
//!
//! TEST_SCENARIOS:
//!   - alloc_is_aligned(): any successful allocation is aligned
//!   - alloc_free_does_not_leak(): the same request succeeds again after free
//!   - live_allocations_are_disjoint(): a random sequence keeps ranges disjoint

extern crate alloc;

use alloc::vec::Vec;

use super::blocks::{BlockAllocator, BLOCK_SIZE};
use crate::types::VirtAddr;
use proptest::prelude::*;

const BASE: u32 = 0xC040_4000;
const BLOCKS: u32 = 64;

fn arb_alignment() -> impl Strategy<Value = u32> {
    (0u32..15).prop_map(|shift| 1u32 << shift)
}

proptest! {
    #[test]
    fn alloc_is_aligned(align in arb_alignment(), size in 1u32..(16 * BLOCK_SIZE)) {
        let mut blocks = BlockAllocator::new(VirtAddr(BASE), BLOCKS * BLOCK_SIZE);
        if let Ok(va) = blocks.alloc(align, size) {
            prop_assert_eq!(va.raw() % align, 0);
            prop_assert!(blocks.allocation_size(va).unwrap_or(0) >= size);
        }
    }

    #[test]
    fn alloc_free_does_not_leak(
        prefill in proptest::collection::vec(1u32..(4 * BLOCK_SIZE), 0..8),
        align in arb_alignment(),
        size in 1u32..(8 * BLOCK_SIZE),
    ) {
        let mut blocks = BlockAllocator::new(VirtAddr(BASE), BLOCKS * BLOCK_SIZE);
        for request in prefill {
            let _ = blocks.alloc(1, request);
        }
        let before = blocks.free_blocks();
        if let Ok(first) = blocks.alloc(align, size) {
            blocks.free(first).expect("free");
            prop_assert_eq!(blocks.free_blocks(), before);
            let again = blocks.alloc(align, size).expect("repeat");
            prop_assert_eq!(again, first);
        }
    }

    #[test]
    fn live_allocations_are_disjoint(ops in proptest::collection::vec((any::<bool>(), 1u32..(3 * BLOCK_SIZE)), 1..40)) {
        let mut blocks = BlockAllocator::new(VirtAddr(BASE), BLOCKS * BLOCK_SIZE);
        let mut live: Vec<(u32, u32)> = Vec::new();
        for (free, size) in ops {
            if free && !live.is_empty() {
                let (va, _) = live.remove(size as usize % live.len());
                blocks.free(VirtAddr(va)).expect("free live");
            } else if let Ok(va) = blocks.alloc(1, size) {
                let len = blocks.allocation_size(va).expect("size");
                for &(other, other_len) in &live {
                    prop_assert!(va.raw() + len <= other || other + other_len <= va.raw());
                }
                live.push((va.raw(), len));
            }
        }
    }
}
