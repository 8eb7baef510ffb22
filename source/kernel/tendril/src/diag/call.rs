// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Log call: lets the host drain the memory log word by word.
//!
//! Registers: r2 selects the function, r1 carries data, r0 receives the
//! result code.

extern crate alloc;

use alloc::vec::Vec;

use super::log::{self, Level};
use super::memlog;
use crate::types::{HandlerError, FAILURE, SUCCESS};
use crate::vector::Frame;

/// Call identifier the log call is registered on.
pub const LOG_CALL_IDENTIFIER: u32 = 0;

pub const INIT: u32 = 0;
pub const BUFFER_SIZE: u32 = 1;
pub const BUFFER_VALUE: u32 = 2;
pub const FINI: u32 = 3;
pub const GET_LEVEL: u32 = 4;
pub const SET_LEVEL: u32 = 5;

/// Snapshot being drained and the read position within it.
#[derive(Debug, Default)]
pub struct LogCall {
    snapshot: Vec<u8>,
    index: usize,
}

impl LogCall {
    pub const fn new() -> Self {
        Self { snapshot: Vec::new(), index: 0 }
    }

    /// Serves one request and writes the result code into r0.
    pub fn handle(&mut self, frame: &mut Frame) -> Result<(), HandlerError> {
        let result = match frame.reg(2) {
            INIT => {
                self.snapshot = memlog::snapshot();
                self.index = 0;
                Ok(())
            }
            BUFFER_SIZE => {
                frame.set_reg(1, self.snapshot.len() as u32);
                Ok(())
            }
            BUFFER_VALUE => self.next_word().map(|word| frame.set_reg(1, word)),
            FINI => {
                self.snapshot = Vec::new();
                self.index = 0;
                memlog::clear();
                Ok(())
            }
            GET_LEVEL => {
                frame.set_reg(1, log::max_level() as u32);
                Ok(())
            }
            SET_LEVEL => Level::from_raw(frame.reg(1)).map(log::set_max_level).ok_or(HandlerError::Failed),
            other => {
                crate::log_debug!(target: "log", "unknown log function {}", other);
                Err(HandlerError::Failed)
            }
        };
        frame.set_reg(0, if result.is_ok() { SUCCESS } else { FAILURE });
        Ok(())
    }

    /// Next four bytes, little-endian; a short tail is zero-padded.
    fn next_word(&mut self) -> Result<u32, HandlerError> {
        let rest = self.snapshot.get(self.index..).filter(|r| !r.is_empty()).ok_or(HandlerError::Failed)?;
        let take = rest.len().min(4);
        let mut word = [0u8; 4];
        word[..take].copy_from_slice(&rest[..take]);
        self.index += take;
        Ok(u32::from_le_bytes(word))
    }
}
