// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Exception-vector hijacking and per-vector handler chains
//! OWNERS: @kernel-team
//! PUBLIC API: Vector, VectorEngine::{init, patch, register, unregister, begin, step, finish}
//! DEPENDS_ON: mm::MemoryManager (host table access), vector::decode, vector::trampoline
//! INVARIANTS:
//!   - Reset and FIQ are never patched
//!   - A patch either rewrites every patchable vector or none
//!   - Every vector chain ends with its default handler until somebody removes it
//!
//! The host's vector table is edited through a temporary internal alias of
//! its physical page. Each patched slot becomes `ldr pc, [pc, #0x18]`, and
//! the literal it loads (eight slots further on) holds the trampoline.

extern crate alloc;

use alloc::vec::Vec;

pub mod decode;
pub mod frame;
pub mod trampoline;

pub use decode::DecodeError;
pub use frame::Frame;
pub use trampoline::{Slots, VectorSlot};

use crate::config::VECTOR_STACK_SIZE;
use crate::handler::{Handler, Service};
use crate::hal::{Platform, SCTLR_V};
use crate::list::{Handle, HandlerList};
use crate::mm::{AllocError, MapError, MemoryManager, PagingError, PagingSystem};
use crate::types::{HandlerError, VirtAddr, FOUR_KILOBYTES};
use decode::{Target, LDR_PC_LITERAL_18};

pub const VECTOR_COUNT: usize = 8;

pub const LOW_VECTORS: u32 = 0x0000_0000;
pub const HIGH_VECTORS: u32 = 0xFFFF_0000;

/// Architectural exception vectors, by table slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Vector {
    Reset = 0,
    UndefinedInstruction = 1,
    SupervisorCall = 2,
    PrefetchAbort = 3,
    DataAbort = 4,
    NotUsed = 5,
    Interrupt = 6,
    FastInterrupt = 7,
}

impl Vector {
    /// Vectors that get a trampoline.
    pub const PATCHED: [Vector; 5] = [
        Vector::UndefinedInstruction,
        Vector::SupervisorCall,
        Vector::PrefetchAbort,
        Vector::DataAbort,
        Vector::Interrupt,
    ];

    /// Vectors that get a default handler.
    pub const HANDLED: [Vector; 7] = [
        Vector::Reset,
        Vector::UndefinedInstruction,
        Vector::SupervisorCall,
        Vector::PrefetchAbort,
        Vector::DataAbort,
        Vector::Interrupt,
        Vector::FastInterrupt,
    ];

    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Vector::Reset),
            1 => Some(Vector::UndefinedInstruction),
            2 => Some(Vector::SupervisorCall),
            3 => Some(Vector::PrefetchAbort),
            4 => Some(Vector::DataAbort),
            5 => Some(Vector::NotUsed),
            6 => Some(Vector::Interrupt),
            7 => Some(Vector::FastInterrupt),
            _ => None,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn is_patched(self) -> bool {
        matches!(
            self,
            Vector::UndefinedInstruction
                | Vector::SupervisorCall
                | Vector::PrefetchAbort
                | Vector::DataAbort
                | Vector::Interrupt
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorState {
    Unpatched,
    Patched,
    Dispatching,
}

/// Error returned by the vector engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorError {
    /// `init` has not run.
    NotInitialized,
    /// `init` already ran.
    AlreadyInitialized,
    /// The table was already rewritten; decoding it again would find our own loads.
    AlreadyPatched,
    /// No vector has this number.
    UnknownVector(u32),
    /// Dispatch on a vector without a trampoline.
    NotPatched(Vector),
    /// A host vector instruction could not be decoded.
    Decode { vector: Vector, error: DecodeError },
    /// No trampoline is assembled for the vector.
    NoTrampoline(Vector),
    /// No entry matched both vector and function.
    NotRegistered,
    /// Host tables could not be reached.
    Map(MapError),
    /// A per-vector stack could not be allocated.
    Alloc(AllocError),
    /// A handler in the chain failed.
    Handler(HandlerError),
    /// The trap interrupted the kernel while it held the state it needs.
    Busy,
    /// The paging system could not be switched.
    Paging(PagingError),
}

impl From<MapError> for VectorError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl From<AllocError> for VectorError {
    fn from(value: AllocError) -> Self {
        Self::Alloc(value)
    }
}

impl From<PagingError> for VectorError {
    fn from(value: PagingError) -> Self {
        Self::Paging(value)
    }
}

impl From<HandlerError> for VectorError {
    fn from(value: HandlerError) -> Self {
        Self::Handler(value)
    }
}

/// One link of a vector chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VectorEntry {
    pub vector: Vector,
    pub handler: Handler,
}

pub struct VectorEngine {
    slots: &'static Slots,
    states: [VectorState; VECTOR_COUNT],
    originals: [Option<VirtAddr>; VECTOR_COUNT],
    stacks: [Option<VirtAddr>; VECTOR_COUNT],
    chain: HandlerList<VectorEntry>,
    initialized: bool,
}

impl VectorEngine {
    pub fn new(slots: &'static Slots) -> Self {
        Self {
            slots,
            states: [VectorState::Unpatched; VECTOR_COUNT],
            originals: [None; VECTOR_COUNT],
            stacks: [None; VECTOR_COUNT],
            chain: HandlerList::new(),
            initialized: false,
        }
    }

    /// Allocates the private stacks and registers every default handler.
    /// Stacks already taken are released when a later one cannot be had.
    pub fn init(&mut self, mm: &mut MemoryManager) -> Result<(), VectorError> {
        if self.initialized {
            return Err(VectorError::AlreadyInitialized);
        }
        for vector in Vector::PATCHED {
            match mm.alloc(8, VECTOR_STACK_SIZE) {
                Ok(stack) => self.stacks[vector.index()] = Some(stack),
                Err(err) => {
                    for stack in self.stacks.iter_mut().filter_map(Option::take) {
                        let _ = mm.free(stack);
                    }
                    return Err(err.into());
                }
            }
        }
        for vector in Vector::HANDLED {
            self.register(vector, Handler::Native(Service::VectorDefault));
        }
        self.initialized = true;
        crate::log_debug!(target: "vec", "init: {} stacks of {:#x} bytes", Vector::PATCHED.len(), VECTOR_STACK_SIZE);
        Ok(())
    }

    pub fn state(&self, vector: Vector) -> VectorState {
        self.states[vector.index()]
    }

    /// Host handler recovered for `vector` by the patch.
    pub fn original(&self, vector: Vector) -> Option<VirtAddr> {
        self.originals[vector.index()]
    }

    pub fn slot(&self, vector: Vector) -> &'static VectorSlot {
        &self.slots[vector.index()]
    }

    /// Rewrites the host's live vector table described by `system`.
    pub fn patch<P: Platform + ?Sized>(
        &mut self,
        mm: &mut MemoryManager,
        p: &P,
        system: &PagingSystem,
    ) -> Result<(), VectorError> {
        if !self.initialized {
            return Err(VectorError::NotInitialized);
        }
        if self.states.iter().any(|s| *s != VectorState::Unpatched) {
            return Err(VectorError::AlreadyPatched);
        }
        let base = VirtAddr(if p.sctlr() & SCTLR_V != 0 { HIGH_VECTORS } else { LOW_VECTORS });
        let page = mm.translate_in(p, system, base)?;
        let alias = mm.map_alias(p, page, FOUR_KILOBYTES)?;
        let result = self.rewrite(mm, p, base, alias.va());
        mm.release_alias(p, alias)?;
        result?;
        crate::log_info!(target: "vec", "patched vector table at {:?} ({:?})", base, page);
        Ok(())
    }

    fn rewrite<P: Platform + ?Sized>(
        &mut self,
        mm: &mut MemoryManager,
        p: &P,
        base: VirtAddr,
        table: VirtAddr,
    ) -> Result<(), VectorError> {
        let mut originals = [None; VECTOR_COUNT];
        let mut entries = [None; VECTOR_COUNT];
        for vector in Vector::PATCHED {
            let slot = vector.index() as u32 * 4;
            let instruction = p.read_u32(table.add(slot));
            let target = decode::decode(instruction, base.raw().wrapping_add(slot))
                .map_err(|error| VectorError::Decode { vector, error })?;
            let original = match target {
                Target::Direct(address) => address,
                Target::Literal(literal) => {
                    let offset = literal.wrapping_sub(base.raw());
                    if offset < FOUR_KILOBYTES - 3 {
                        p.read_u32(table.add(offset))
                    } else {
                        mm.read_external_u32(p, VirtAddr(literal))?
                    }
                }
            };
            originals[vector.index()] = Some(VirtAddr(original));
            entries[vector.index()] = Some(trampoline::entry(vector).ok_or(VectorError::NoTrampoline(vector))?);
            crate::log_debug!(target: "vec", "{:?}: {:#010x} -> {:#010x}", vector, instruction, original);
        }

        for vector in Vector::PATCHED {
            let i = vector.index();
            let (Some(original), Some(entry)) = (originals[i], entries[i]) else { continue };
            let slot = i as u32 * 4;
            p.write_u32(table.add(slot), LDR_PC_LITERAL_18);
            p.write_u32(table.add(slot + VECTOR_COUNT as u32 * 4), entry.raw());
            let stack_top = self.stacks[i].map(|s| s.add(VECTOR_STACK_SIZE)).unwrap_or_default();
            self.slots[i].publish(original, stack_top);
            self.originals[i] = Some(original);
            self.states[i] = VectorState::Patched;
        }
        p.dcache_clean_region(table, 2 * VECTOR_COUNT as u32 * 4);
        p.flush_entire_cache();
        Ok(())
    }

    /// Adds `handler` at the front of the chain.
    pub fn register(&mut self, vector: Vector, handler: Handler) -> Handle {
        self.chain.insert_after_head(VectorEntry { vector, handler })
    }

    /// Removes the first entry for `vector` whose function matches.
    pub fn unregister(&mut self, vector: Vector, handler: &Handler) -> Result<(), VectorError> {
        let handle = self
            .chain
            .find(|e| e.vector == vector && e.handler.same_function(handler))
            .ok_or(VectorError::NotRegistered)?;
        self.chain.remove(handle);
        Ok(())
    }

    /// Handlers registered for `vector`, in dispatch order.
    pub fn handlers(&self, vector: Vector) -> Vec<Handler> {
        self.chain.iter().filter(|(_, e)| e.vector == vector).map(|(_, e)| e.handler).collect()
    }

    /// Enters dispatch: clears the handled flag and returns the first entry of
    /// the vector's chain. The chain is then walked with [`Self::step`]
    /// without allocating, so it is safe on the trap path.
    pub fn begin(&mut self, raw: u32) -> Result<(Vector, Option<Handle>), VectorError> {
        let vector = Vector::from_raw(raw).ok_or(VectorError::UnknownVector(raw))?;
        if self.states[vector.index()] == VectorState::Unpatched {
            return Err(VectorError::NotPatched(vector));
        }
        self.states[vector.index()] = VectorState::Dispatching;
        self.slots[vector.index()].set_handled(false);
        Ok((vector, self.seek(vector, self.chain.first())))
    }

    /// Handler at `at` and the entry after it in the vector's chain. Returns
    /// `None` once `at` has been unregistered, which ends the walk. Entries
    /// registered mid-walk land at the head and are not visited.
    pub fn step(&self, vector: Vector, at: Handle) -> Option<(Handler, Option<Handle>)> {
        let entry = self.chain.get(at)?;
        Some((entry.handler, self.seek(vector, self.chain.next(at))))
    }

    /// First entry for `vector` at or after `cursor`.
    fn seek(&self, vector: Vector, mut cursor: Option<Handle>) -> Option<Handle> {
        while let Some(at) = cursor {
            if self.chain.get(at).is_some_and(|e| e.vector == vector) {
                return Some(at);
            }
            cursor = self.chain.next(at);
        }
        None
    }

    /// Leaves dispatch and publishes the verdict to the trampoline.
    pub fn finish(&mut self, vector: Vector, handled: bool) {
        self.slots[vector.index()].set_handled(handled);
        if self.states[vector.index()] == VectorState::Dispatching {
            self.states[vector.index()] = VectorState::Patched;
        }
    }
}
