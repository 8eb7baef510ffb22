// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for short-descriptor encodings
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Section and small-page encoders keep the frame base and the type bits
//!   - Attribute bits never leak into the address field
//!
//! TEST_SCENARIOS:
//!   - section_preserves_base(): any attributes, base is the 1 MiB frame
//!   - small_page_resolves_offsets(): any va offset resolves into the same frame

use super::attrs::MemoryAttributes;
use super::descriptor::{Fld, Sld};
use crate::types::{PhysAddr, VirtAddr};
use proptest::prelude::*;

fn arb_attrs() -> impl Strategy<Value = MemoryAttributes> {
    (0u8..8, any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(tex, cacheable, bufferable, shareable, execute_never)| MemoryAttributes {
            tex,
            cacheable,
            bufferable,
            shareable,
            execute_never,
        },
    )
}

proptest! {
    #[test]
    fn section_preserves_base(pa in any::<u32>(), attrs in arb_attrs()) {
        let fld = Fld::section(PhysAddr(pa), attrs);
        prop_assert!(fld.is_section());
        prop_assert!(!fld.is_fault());
        prop_assert_eq!(fld.section_base(), PhysAddr(pa & 0xFFF0_0000));
    }

    #[test]
    fn small_page_resolves_offsets(pa in any::<u32>(), va in any::<u32>(), attrs in arb_attrs()) {
        let sld = Sld::small_page(PhysAddr(pa), attrs);
        prop_assert!(sld.is_small_page());
        prop_assert_eq!(sld.page_base(), PhysAddr(pa & 0xFFFF_F000));
        prop_assert_eq!(sld.resolve(VirtAddr(va)), Some(PhysAddr((pa & 0xFFFF_F000) | (va & 0xFFF))));
    }
}
