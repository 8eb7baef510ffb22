// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Handler references shared by the vector and call registries.
//!
//! Module handlers follow one ABI for both registries:
//! `u32 handler(u32 context, u32 *handled, Frame *frame)`, returning 0 on
//! success. Call handlers may ignore `handled`; the multiplexer sets it.

use crate::types::VirtAddr;

/// Services the kernel itself registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    /// Per-vector catch-all that only traces the frame.
    VectorDefault,
    /// The call multiplexer, installed on the undefined-instruction vector.
    CallMultiplexer,
    /// Catch-all at the end of the call chain.
    CallDefault,
    /// Memory-log access.
    Log,
    /// Module loader access.
    Loader,
}

/// A registered function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handler {
    Native(Service),
    /// Module function and the opaque context it was registered with.
    Foreign { entry: VirtAddr, context: u32 },
}

impl Handler {
    /// Whether both refer to the same function; contexts are not compared.
    pub fn same_function(&self, other: &Handler) -> bool {
        match (self, other) {
            (Handler::Native(a), Handler::Native(b)) => a == b,
            (Handler::Foreign { entry: a, .. }, Handler::Foreign { entry: b, .. }) => a == b,
            _ => false,
        }
    }
}
