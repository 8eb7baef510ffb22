// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Loader call: register decoding for module management requests.
//!
//! r2 selects the operation; the remaining registers are typed by
//! [`Request::decode`] and validated by [`Request::check`] before anything
//! touches caller memory. Execution lives with the kernel context, which
//! owns the locks the operations need.

extern crate alloc;

use alloc::vec::Vec;

use super::LoaderError;
use crate::config::MAX_STRING;
use crate::hal::Platform;
use crate::mm::MemoryManager;
use crate::types::VirtAddr;
use crate::vector::Frame;

pub const LOADER_CALL_IDENTIFIER: u32 = 1;

pub const ADD_MODULE: u32 = 0;
pub const REMOVE_MODULE: u32 = 1;
pub const COPY_MODULE_HEADER: u32 = 2;

/// Most arguments a caller may forward to init or fini.
pub const MAX_ARGS: u32 = 32;

/// A decoded loader request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    Add { image: VirtAddr, size: u32, argc: u32, argv: VirtAddr },
    Remove { name: VirtAddr, argc: u32, argv: VirtAddr },
    CopyHeader { index: u32, dest: VirtAddr, capacity: u32 },
}

impl Request {
    pub fn decode(frame: &Frame) -> Result<Self, LoaderError> {
        let reg = |i| frame.reg(i);
        match reg(2) {
            ADD_MODULE => Ok(Self::Add { image: VirtAddr(reg(3)), size: reg(4), argc: reg(5), argv: VirtAddr(reg(6)) }),
            REMOVE_MODULE => Ok(Self::Remove { name: VirtAddr(reg(3)), argc: reg(4), argv: VirtAddr(reg(5)) }),
            COPY_MODULE_HEADER => Ok(Self::CopyHeader { index: reg(3), dest: VirtAddr(reg(4)), capacity: reg(5) }),
            other => Err(LoaderError::UnknownOperation(other)),
        }
    }

    pub fn check(&self) -> Result<(), LoaderError> {
        let args_ok = |argc: u32, argv: VirtAddr| argc != 0 && argc <= MAX_ARGS && !argv.is_null();
        let ok = match *self {
            Self::Add { image, size, argc, argv } => !image.is_null() && size != 0 && args_ok(argc, argv),
            Self::Remove { name, argc, argv } => !name.is_null() && args_ok(argc, argv),
            Self::CopyHeader { dest, .. } => !dest.is_null(),
        };
        if ok {
            Ok(())
        } else {
            Err(LoaderError::BadRequest)
        }
    }
}

/// Copies `argc` strings from the caller's argument vector.
pub fn read_args<P: Platform + ?Sized>(
    mm: &mut MemoryManager,
    p: &P,
    argc: u32,
    argv: VirtAddr,
) -> Result<Vec<Vec<u8>>, LoaderError> {
    let mut args = Vec::with_capacity(argc as usize);
    for i in 0..argc {
        let at = VirtAddr(mm.read_external_u32(p, argv.add(i * 4))?);
        if at.is_null() {
            return Err(LoaderError::BadRequest);
        }
        args.push(mm.read_external_cstr(p, at, MAX_STRING)?);
    }
    Ok(args)
}
