// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity ring holding the most recent log output.

extern crate alloc;

use alloc::vec::Vec;
use spin::Mutex;

use crate::config::LOG_CAPACITY;

/// Byte ring that overwrites its oldest contents when full.
pub struct Ring<const N: usize> {
    buf: [u8; N],
    head: usize,
    len: usize,
}

impl<const N: usize> Ring<N> {
    pub const fn new() -> Self {
        Self { buf: [0; N], head: 0, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if N == 0 {
            return;
        }
        for &byte in bytes {
            self.buf[self.head] = byte;
            self.head = (self.head + 1) % N;
            self.len = (self.len + 1).min(N);
        }
    }

    /// Contents, oldest byte first.
    pub fn snapshot(&self) -> Vec<u8> {
        let start = (self.head + N - self.len) % N.max(1);
        (0..self.len).map(|i| self.buf[(start + i) % N]).collect()
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

impl<const N: usize> Default for Ring<N> {
    fn default() -> Self {
        Self::new()
    }
}

static MEMLOG: Mutex<Ring<LOG_CAPACITY>> = Mutex::new(Ring::new());

/// Appends to the ring. Output is dropped when the ring is busy, which only
/// happens when a trap interrupts a writer.
pub fn write(bytes: &[u8]) {
    if let Some(mut ring) = MEMLOG.try_lock() {
        ring.push(bytes);
    }
}

pub fn snapshot() -> Vec<u8> {
    MEMLOG.lock().snapshot()
}

pub fn clear() {
    MEMLOG.lock().clear();
}
