// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics: structured logging, the in-memory log ring, the module
//! printf formatter and the log call that drains the ring.

pub mod call;
pub mod log;
pub mod memlog;
pub mod printf;
