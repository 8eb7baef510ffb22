// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot-time self checks, run with the internal system live just before
//! bring-up hands control back to the host.
//!
//! A failed check aborts bring-up with [`BootError::Selftest`] instead of
//! panicking: the host is still running and must keep its own vectors.

use crate::boot::BootError;
use crate::diag::call::LOG_CALL_IDENTIFIER;
use crate::hal::Platform;
use crate::handler::{Handler, Service};
use crate::kernel::Kernel;
use crate::mm::Tag;
use crate::vector::{Vector, VectorState};

/// Fails the enclosing check with `$msg` unless `$cond` holds.
macro_rules! st_check {
    ($cond:expr, $msg:expr $(,)?) => {
        if !$cond {
            $crate::log_error!(target: "selftest", "fail: {}", $msg);
            return Err(BootError::Selftest($msg));
        }
    };
}

pub fn run<P: Platform>(kernel: &Kernel<P>) -> Result<(), BootError> {
    crate::log_info!(target: "selftest", "begin");
    check_paging(kernel)?;
    crate::log_info!(target: "selftest", "paging ok");
    check_blocks(kernel)?;
    crate::log_info!(target: "selftest", "blocks ok");
    check_vectors(kernel)?;
    crate::log_info!(target: "selftest", "vectors ok");
    check_services(kernel)?;
    crate::log_info!(target: "selftest", "end");
    Ok(())
}

fn check_paging<P: Platform>(kernel: &Kernel<P>) -> Result<(), BootError> {
    st_check!(kernel.live_tag() == Tag::Internal, "internal system not live");
    Ok(())
}

fn check_blocks<P: Platform>(kernel: &Kernel<P>) -> Result<(), BootError> {
    let before = kernel.mm.lock().blocks().free_blocks();
    let Ok(block) = kernel.malloc(64) else {
        return Err(BootError::Selftest("malloc failed"));
    };
    let cached = kernel.lookup_pa(block).ok();
    st_check!(cached.is_some(), "allocated block missing from the lookup cache");
    st_check!(cached == kernel.platform().translate(block), "lookup cache disagrees with the tables");
    st_check!(kernel.free(block).is_ok(), "free failed");
    st_check!(kernel.mm.lock().blocks().free_blocks() == before, "free did not return the block");
    Ok(())
}

fn check_vectors<P: Platform>(kernel: &Kernel<P>) -> Result<(), BootError> {
    let vectors = kernel.vectors.lock();
    for vector in Vector::PATCHED {
        st_check!(vectors.state(vector) == VectorState::Patched, "vector not patched");
        st_check!(vectors.original(vector).is_some(), "host handler not saved");
    }
    st_check!(
        vectors.handlers(Vector::UndefinedInstruction).first() == Some(&Handler::Native(Service::CallMultiplexer)),
        "call multiplexer not installed"
    );
    Ok(())
}

fn check_services<P: Platform>(kernel: &Kernel<P>) -> Result<(), BootError> {
    st_check!(
        kernel.calls.lock().resolve(LOG_CALL_IDENTIFIER) == Some(Handler::Native(Service::Log)),
        "log call not registered"
    );
    st_check!(kernel.lookup_export(b"printf").is_some(), "printf not exported");
    Ok(())
}
