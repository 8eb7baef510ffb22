// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bring-up: verify the injected image, build the internal system, install the kernel
//! OWNERS: @kernel-team
//! PUBLIC API: BootHeader, ImportDescriptor, bring_up(), Kernel::start_run()
//! DEPENDS_ON: mm (lookup cache, block allocator, paging), kernel::Kernel
//! INVARIANTS:
//!   - Both callsigns are checked before anything else is touched
//!   - The allocator arena starts past the image end, on a block boundary
//!   - bring_up returns with the external system live
//!
//! The host injector fills the import descriptor in `.header` before it
//! jumps to the entry stub. The image itself ends with a second callsign
//! word so a truncated copy is detected.

use core::mem::size_of;

use static_assertions::const_assert_eq;

use crate::call::CallError;
use crate::config::CALLSIGN;
use crate::diag::call::LOG_CALL_IDENTIFIER;
use crate::handler::{Handler, Service};
use crate::hal::Platform;
use crate::kernel::Kernel;
use crate::loader::call::LOADER_CALL_IDENTIFIER;
use crate::loader::LoaderError;
use crate::mm::blocks::BLOCK_SIZE;
use crate::mm::{BlockAllocator, LookupCache, MapError, MemoryManager, PagingError, Tag};
use crate::types::VirtAddr;
use crate::vector::{Slots, Vector, VectorError};

/// Name of the pseudo-module carrying the kernel's own exports.
pub const KERNEL_MODULE: &[u8] = b"tendril";

/// Region the host injector prepared for the kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportDescriptor {
    pub va: u32,
    pub pa: u32,
    pub size: u32,
}

/// Record at the start of the image.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BootHeader {
    pub callsign: u32,
    /// Bytes from the image start through the end callsign.
    pub image_size: u32,
    pub import: ImportDescriptor,
}

const_assert_eq!(size_of::<ImportDescriptor>(), 12);
const_assert_eq!(size_of::<BootHeader>(), 20);

impl BootHeader {
    /// Header as linked into the image, before the injector fills `import`.
    pub const fn blank(image_size: u32) -> Self {
        Self { callsign: CALLSIGN, image_size, import: ImportDescriptor { va: 0, pa: 0, size: 0 } }
    }

    /// Address of the end callsign word.
    pub fn end_marker(&self) -> VirtAddr {
        VirtAddr(self.import.va).add(self.image_size.saturating_sub(4))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// A callsign word does not hold the expected value.
    BadCallsign { at: VirtAddr, found: u32 },
    /// The image leaves no room for the allocator arena.
    NoWorkspace,
    Map(MapError),
    Paging(PagingError),
    Vector(VectorError),
    Call(CallError),
    Loader(LoaderError),
    /// A boot-time self check failed.
    Selftest(&'static str),
}

impl From<MapError> for BootError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl From<PagingError> for BootError {
    fn from(value: PagingError) -> Self {
        Self::Paging(value)
    }
}

impl From<VectorError> for BootError {
    fn from(value: VectorError) -> Self {
        Self::Vector(value)
    }
}

impl From<CallError> for BootError {
    fn from(value: CallError) -> Self {
        Self::Call(value)
    }
}

impl From<LoaderError> for BootError {
    fn from(value: LoaderError) -> Self {
        Self::Loader(value)
    }
}

fn verify<P: Platform>(p: &P, header: &BootHeader) -> Result<(), BootError> {
    if header.callsign != CALLSIGN {
        return Err(BootError::BadCallsign { at: VirtAddr(header.import.va), found: header.callsign });
    }
    let end = header.end_marker();
    let found = p.read_u32(end);
    if found != CALLSIGN {
        return Err(BootError::BadCallsign { at: end, found });
    }
    Ok(())
}

/// Brings the kernel up inside the region `header` describes and returns
/// it with the host's system live again.
pub fn bring_up<P: Platform>(
    p: P,
    header: &BootHeader,
    slots: &'static Slots,
    exports: &[(&[u8], VirtAddr)],
) -> Result<Kernel<P>, BootError> {
    verify(&p, header)?;
    let import = header.import;
    crate::log_info!(target: "boot", "import va={:#x} pa={:#x} size={:#x}", import.va, import.pa, import.size);

    let lookup = LookupCache::build(&p, VirtAddr(import.va), import.size)?;
    let start = import.va.saturating_add(header.image_size).next_multiple_of(BLOCK_SIZE);
    let end = import.va.saturating_add(import.size);
    if start >= end {
        return Err(BootError::NoWorkspace);
    }
    let mut mm = MemoryManager::new(lookup, BlockAllocator::new(VirtAddr(start), end - start));
    mm.build_internal(&p)?;

    let kernel = Kernel::new(p, mm, slots);
    {
        let mut mm = kernel.mm.lock();
        kernel.switch(&mut mm, Tag::Internal)?;
    }
    let started = kernel.start_run(exports);
    #[cfg(feature = "selftest")]
    let started = started.and_then(|()| crate::selftest::run(&kernel));
    // The host gets its tables back whether or not bring-up succeeded.
    let restored = {
        let mut mm = kernel.mm.lock();
        kernel.switch(&mut mm, Tag::External)
    };
    if let Err(err) = started {
        crate::log_error!(target: "boot", "bring-up failed: {:?}", err);
        return Err(err);
    }
    restored?;
    crate::log_info!(target: "boot", "returning to host");
    Ok(kernel)
}

impl<P: Platform> Kernel<P> {
    /// Installs every subsystem. Runs with the internal system live.
    pub fn start_run(&self, exports: &[(&[u8], VirtAddr)]) -> Result<(), BootError> {
        #[cfg(feature = "debug_uart")]
        {
            use crate::mm::MapFlags;
            use crate::types::{PhysAddr, FOUR_KILOBYTES};

            let flags = MapFlags::INTERNAL | MapFlags::DEVICE_MEMORY | MapFlags::EXECUTE_NEVER;
            let va = self.map(PhysAddr(crate::config::UART_BASE), FOUR_KILOBYTES, flags, VirtAddr(0))?;
            crate::uart::attach(va.raw());
            crate::uart::set_reachable(true);
        }

        {
            let mut vectors = self.vectors.lock();
            let mut mm = self.mm.lock();
            vectors.init(&mut mm)?;
            let host = mm.get(self.platform(), Tag::External);
            vectors.patch(&mut mm, self.platform(), &host)?;
        }

        self.calls.lock().init()?;
        self.register_vector(Vector::UndefinedInstruction as u32, Handler::Native(Service::CallMultiplexer))?;
        self.register_call(LOG_CALL_IDENTIFIER, Handler::Native(Service::Log))?;
        self.register_call(LOADER_CALL_IDENTIFIER, Handler::Native(Service::Loader))?;

        self.loader.lock().register_kernel_module(KERNEL_MODULE, exports)?;
        crate::log_info!(target: "boot", "running with {} kernel exports", exports.len());
        Ok(())
    }
}
