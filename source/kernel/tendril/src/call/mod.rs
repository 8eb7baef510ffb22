// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Call multiplexer behind the undefined-instruction vector
//! OWNERS: @kernel-team
//! PUBLIC API: CallMultiplexer::{init, register, unregister, resolve}, request_identifier()
//! DEPENDS_ON: list::HandlerList, handler::Handler
//! INVARIANTS:
//!   - Only frames with CALLSIGN in r0 are requests; r1 is the identifier
//!   - The first entry whose identifier matches, or that carries the default identifier, wins
//!
//! Registration inserts at the head, so the default entry installed by
//! `init` stays at the tail and only catches identifiers nobody claimed.

extern crate alloc;

use alloc::vec::Vec;

use crate::config::CALLSIGN;
use crate::handler::{Handler, Service};
use crate::list::{Handle, HandlerList};
use crate::vector::Frame;

/// Identifier of the catch-all entry.
pub const DEFAULT_IDENTIFIER: u32 = 0xFFFF;

/// Error returned by call registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    /// `init` has not run.
    NotInitialized,
    /// `init` already ran.
    AlreadyInitialized,
    /// No entry matched both identifier and function.
    NotRegistered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallEntry {
    pub identifier: u32,
    pub handler: Handler,
}

/// Identifier of the call `frame` carries, if it is a call at all.
pub fn request_identifier(frame: &Frame) -> Option<u32> {
    (frame.reg(0) == CALLSIGN).then(|| frame.reg(1))
}

#[derive(Default)]
pub struct CallMultiplexer {
    chain: HandlerList<CallEntry>,
    initialized: bool,
}

impl CallMultiplexer {
    pub fn new() -> Self {
        Self { chain: HandlerList::new(), initialized: false }
    }

    /// Installs the default entry.
    pub fn init(&mut self) -> Result<(), CallError> {
        if self.initialized {
            return Err(CallError::AlreadyInitialized);
        }
        self.chain.insert_after_head(CallEntry {
            identifier: DEFAULT_IDENTIFIER,
            handler: Handler::Native(Service::CallDefault),
        });
        self.initialized = true;
        Ok(())
    }

    pub fn register(&mut self, identifier: u32, handler: Handler) -> Result<Handle, CallError> {
        if !self.initialized {
            return Err(CallError::NotInitialized);
        }
        crate::log_debug!(target: "call", "register {:#x}: {:?}", identifier, handler);
        Ok(self.chain.insert_after_head(CallEntry { identifier, handler }))
    }

    /// Removes the first entry whose identifier and function both match.
    pub fn unregister(&mut self, identifier: u32, handler: &Handler) -> Result<(), CallError> {
        let handle = self
            .chain
            .find(|e| e.identifier == identifier && e.handler.same_function(handler))
            .ok_or(CallError::NotRegistered)?;
        self.chain.remove(handle);
        Ok(())
    }

    /// Handler that serves `identifier`.
    pub fn resolve(&self, identifier: u32) -> Option<Handler> {
        self.chain
            .iter()
            .find(|(_, e)| e.identifier == identifier || e.identifier == DEFAULT_IDENTIFIER)
            .map(|(_, e)| e.handler)
    }

    pub fn entries(&self) -> Vec<CallEntry> {
        self.chain.iter().map(|(_, e)| *e).collect()
    }
}
