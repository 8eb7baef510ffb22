// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared kernel types: address newtypes and register-level result codes.

use core::fmt;

/// Result code placed in r0 when a call succeeds.
pub const SUCCESS: u32 = 0;
/// Result code placed in r0 when a call fails.
pub const FAILURE: u32 = 1;

pub const ONE_KILOBYTE: u32 = 0x400;
pub const FOUR_KILOBYTES: u32 = 0x1000;
pub const SIXTEEN_KILOBYTES: u32 = 0x4000;
pub const ONE_MEGABYTE: u32 = 0x10_0000;

/// Virtual address in whichever address space is live.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub u32);

/// Physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(pub u32);

macro_rules! addr_impl {
    ($ty:ident, $prefix:literal) => {
        impl $ty {
            pub const fn raw(self) -> u32 {
                self.0
            }

            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Wrapping offset; table walks rely on modular arithmetic.
            pub const fn add(self, offset: u32) -> Self {
                Self(self.0.wrapping_add(offset))
            }

            pub const fn align_down(self, align: u32) -> Self {
                Self(self.0 & !(align - 1))
            }

            pub const fn offset_in(self, span: u32) -> u32 {
                self.0 & (span - 1)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "(0x{:08x})"), self.0)
            }
        }

        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

addr_impl!(VirtAddr, "va");
addr_impl!(PhysAddr, "pa");

/// Failure reported by a registered vector or call handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerError {
    /// A kernel-native handler rejected the request.
    Failed,
    /// A module-provided handler returned a non-zero status.
    Foreign(u32),
}
