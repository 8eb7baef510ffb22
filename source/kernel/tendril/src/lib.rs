// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tendril: a kernel injected into a running ARMv7-A host. It builds its own
//! translation tables beside the host's, hooks the host's exception vectors
//! through trampolines, multiplexes calls on the undefined-instruction
//! vector, and loads relocatable modules that link against its exports.
//!
//! All hardware access goes through [`hal`], so everything except the
//! assembly and the `extern "C"` surface runs on the build host in tests.

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

// Logging macros are used by every module below.
#[macro_use]
pub mod diag;
pub use diag::log;

pub mod boot;
pub mod call;
pub mod config;
pub mod exports;
pub mod hal;
pub mod handler;
pub mod kernel;
pub mod list;
pub mod loader;
pub mod mm;
#[cfg(all(feature = "panic_handler", target_os = "none", not(test)))]
mod panic;
#[cfg(any(test, feature = "selftest"))]
pub mod selftest;
pub mod types;
pub mod uart;
pub mod vector;

pub use boot::{bring_up, BootError, BootHeader};
pub use kernel::Kernel;
