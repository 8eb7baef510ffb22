// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel context: one lock per subsystem and the trap-time glue between them
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::{new, dispatch, add_module, remove_module, printf, malloc, free, map, unmap,
//!             register_call, unregister_call, register_vector, unregister_vector}
//! DEPENDS_ON: mm, vector, call, loader, diag
//! INVARIANTS:
//!   - Lock order: vectors, calls, loader and log before mm; never two of the former at once
//!   - No lock is held while module code runs, so modules may re-enter through the exports
//!   - Trap entry never spins: busy state reports the trap as not handled
//!   - A dispatch that found the internal system live leaves it live

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::call::{request_identifier, CallError, CallMultiplexer};
use crate::config::MAX_STRING;
use crate::diag::call::LogCall;
use crate::diag::{log, printf};
use crate::hal::{Platform, PSR_F};
use crate::handler::{Handler, Service};
use crate::loader::call::{read_args, Request};
use crate::loader::{ArgBlock, Loader, LoaderError, ModuleId};
use crate::mm::{AllocError, MapError, MapFlags, MemoryManager, Tag};
use crate::types::{HandlerError, PhysAddr, VirtAddr, FAILURE, SUCCESS};
use crate::uart;
use crate::vector::frame::{self, Shown};
use crate::vector::{Frame, Slots, Vector, VectorEngine, VectorError};

/// Alignment of blocks handed to modules through `malloc`.
const MALLOC_ALIGN: u32 = 8;

pub struct Kernel<P: Platform> {
    platform: P,
    slots: &'static Slots,
    pub(crate) mm: Mutex<MemoryManager>,
    pub(crate) vectors: Mutex<VectorEngine>,
    pub(crate) calls: Mutex<CallMultiplexer>,
    pub(crate) loader: Mutex<Loader>,
    log: Mutex<LogCall>,
}

impl<P: Platform> Kernel<P> {
    pub fn new(platform: P, mm: MemoryManager, slots: &'static Slots) -> Self {
        Self {
            platform,
            slots,
            mm: Mutex::new(mm),
            vectors: Mutex::new(VectorEngine::new(slots)),
            calls: Mutex::new(CallMultiplexer::new()),
            loader: Mutex::new(Loader::new()),
            log: Mutex::new(LogCall::new()),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn live_tag(&self) -> Tag {
        self.mm.lock().live_tag()
    }

    /// Makes `tag` live through [`MemoryManager::switch`] and tells the UART
    /// whether its mapping is reachable.
    pub(crate) fn switch(&self, mm: &mut MemoryManager, tag: Tag) -> Result<bool, crate::mm::PagingError> {
        let switched = mm.switch(&self.platform, tag)?;
        uart::set_reachable(mm.live_tag() == Tag::Internal);
        Ok(switched)
    }

    // ---------------------------------------------------------------------
    // Trap path
    // ---------------------------------------------------------------------

    /// Runs the chain of vector `raw` over `frame`. Returns whether the trap
    /// was handled; `false` sends the trampoline to the host's handler.
    /// The verdict is also published in the vector's slot, which is what the
    /// trampoline reads.
    pub fn dispatch(&self, raw: u32, frame: &mut Frame) -> bool {
        let p = &self.platform;
        p.disable_fiq();
        frame::record(raw, frame);
        let handled = match self.run_chain(raw, frame) {
            Ok(handled) => handled,
            Err(err) => {
                crate::log_warn!(target: "vec", "dispatch of vector {} failed: {:?}", raw, err);
                false
            }
        };
        if let Some(slot) = self.slots.get(raw as usize) {
            slot.set_handled(handled);
        }
        if p.spsr() & PSR_F == 0 {
            p.enable_fiq();
        }
        handled
    }

    fn run_chain(&self, raw: u32, frame: &mut Frame) -> Result<bool, VectorError> {
        // Entered with Internal already live (a nested trap), the switch is a
        // no-op and the outer entry restores External.
        let switched = {
            let mut mm = self.mm.try_lock().ok_or(VectorError::Busy)?;
            self.switch(&mut mm, Tag::Internal)?
        };
        let result = self.walk_chain(raw, frame);
        if switched {
            let mut mm = self.mm.lock();
            if let Err(err) = self.switch(&mut mm, Tag::External) {
                crate::log_error!(target: "vec", "cannot restore the external system: {:?}", err);
            }
        }
        result
    }

    fn walk_chain(&self, raw: u32, frame: &mut Frame) -> Result<bool, VectorError> {
        let (vector, mut cursor) = self.vectors.try_lock().ok_or(VectorError::Busy)?.begin(raw)?;
        let mut handled = false;
        let mut outcome = Ok(());
        while let Some(at) = cursor {
            // The engine is unlocked while the handler runs so it may edit the chain.
            let Some((handler, next)) = self.vectors.lock().step(vector, at) else { break };
            cursor = next;
            outcome = self.invoke(vector, &handler, frame, &mut handled);
            if outcome.is_err() {
                break;
            }
        }
        let handled = handled && outcome.is_ok();
        self.vectors.lock().finish(vector, handled);
        outcome?;
        Ok(handled)
    }

    fn invoke(&self, vector: Vector, handler: &Handler, frame: &mut Frame, handled: &mut bool) -> Result<(), HandlerError> {
        match *handler {
            Handler::Native(service) => self.serve(vector, service, frame, handled),
            Handler::Foreign { entry, context } => {
                let mut flag = u32::from(*handled);
                // SAFETY: `entry` was registered by loaded module code through
                // the kernel exports; `flag` and `frame` outlive the call.
                let status = unsafe { self.platform.call_handler(entry, context, &mut flag, frame) };
                *handled = flag != 0;
                match status {
                    SUCCESS => Ok(()),
                    status => Err(HandlerError::Foreign(status)),
                }
            }
        }
    }

    fn serve(&self, vector: Vector, service: Service, frame: &mut Frame, handled: &mut bool) -> Result<(), HandlerError> {
        match service {
            Service::VectorDefault => {
                crate::log_trace!(target: "vec", "{}", Shown(vector as u32, frame));
                Ok(())
            }
            Service::CallMultiplexer => self.call_dispatch(frame, handled),
            Service::CallDefault => {
                crate::log_debug!(target: "call", "unclaimed call {:#x}", frame.reg(1));
                Ok(())
            }
            Service::Log => self.log.try_lock().ok_or(HandlerError::Failed)?.handle(frame),
            Service::Loader => {
                self.loader_call(frame);
                Ok(())
            }
        }
    }

    /// Routes a call to its handler. Any recognised call is handled; a
    /// failing handler is reported through r0.
    fn call_dispatch(&self, frame: &mut Frame, handled: &mut bool) -> Result<(), HandlerError> {
        let Some(identifier) = request_identifier(frame) else {
            return Ok(());
        };
        let Some(handler) = self.calls.try_lock().ok_or(HandlerError::Failed)?.resolve(identifier) else {
            return Ok(());
        };
        let mut inner = false;
        if let Err(err) = self.invoke(Vector::UndefinedInstruction, &handler, frame, &mut inner) {
            crate::log_debug!(target: "call", "call {:#x} failed: {:?}", identifier, err);
            frame.set_reg(0, FAILURE);
        }
        *handled = true;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Loader
    // ---------------------------------------------------------------------

    fn loader_call(&self, frame: &mut Frame) {
        let result = Request::decode(frame).and_then(|request| {
            request.check()?;
            self.execute(request)
        });
        let status = match result {
            Ok(()) => SUCCESS,
            Err(err) => {
                crate::log_warn!(target: "ldr", "loader call failed: {:?}", err);
                FAILURE
            }
        };
        frame.set_reg(0, status);
    }

    fn execute(&self, request: Request) -> Result<(), LoaderError> {
        let p = &self.platform;
        match request {
            Request::Add { image, size, argc, argv } => {
                let (bytes, args) = {
                    let mut mm = self.mm.lock();
                    if size > mm.blocks().capacity() {
                        return Err(AllocError::OutOfMemory.into());
                    }
                    let mut bytes = vec![0u8; size as usize];
                    mm.copy_from_external(p, image, &mut bytes)?;
                    let args = read_args(&mut mm, p, argc, argv)?;
                    (bytes, args)
                };
                self.add_module(&bytes, &args).map(|_| ())
            }
            Request::Remove { name, argc, argv } => {
                let (name, args) = {
                    let mut mm = self.mm.lock();
                    let name = mm.read_external_cstr(p, name, MAX_STRING)?;
                    let args = read_args(&mut mm, p, argc, argv)?;
                    (name, args)
                };
                self.remove_module(&name, &args)
            }
            Request::CopyHeader { index, dest, capacity } => {
                let header = self.loader.lock().header_of(index).map(<[u8]>::to_vec).ok_or(LoaderError::ModuleNotFound)?;
                let needed = header.len() as u32;
                if needed > capacity {
                    return Err(LoaderError::BufferTooSmall { needed });
                }
                self.mm.lock().copy_to_external(p, dest, &header)?;
                Ok(())
            }
        }
    }

    /// Loads `image`, then runs its initializer with `args`. A failing
    /// initializer unloads the module again.
    pub fn add_module(&self, image: &[u8], args: &[Vec<u8>]) -> Result<ModuleId, LoaderError> {
        let p = &self.platform;
        let (staged, argv) = {
            let mut loader = self.loader.lock();
            let mut mm = self.mm.lock();
            let staged = loader.stage(&mut mm, p, image)?;
            match ArgBlock::stage(&mut mm, p, args) {
                Ok(argv) => (staged, argv),
                Err(err) => {
                    let _ = loader.discard(&mut mm, staged.id);
                    return Err(err);
                }
            }
        };

        // SAFETY: `staged.init` lies inside the image just written and flushed.
        let status = unsafe { p.call(staged.init, [argv.argc(), argv.argv().raw(), 0]) };

        let mut loader = self.loader.lock();
        let mut mm = self.mm.lock();
        let released = argv.release(&mut mm);
        if status != SUCCESS {
            loader.discard(&mut mm, staged.id)?;
            return Err(LoaderError::InitFailed(status));
        }
        released?;
        Ok(staged.id)
    }

    /// Runs the finalizer of module `name` with `args`, then unloads it. A
    /// failing finalizer leaves the module loaded.
    pub fn remove_module(&self, name: &[u8], args: &[Vec<u8>]) -> Result<(), LoaderError> {
        let p = &self.platform;
        let (id, fini, argv) = {
            let loader = self.loader.lock();
            let mut mm = self.mm.lock();
            let (id, fini) = loader.fini_entry(name)?;
            (id, fini, ArgBlock::stage(&mut mm, p, args)?)
        };

        // SAFETY: `fini` lies inside a loaded image.
        let status = unsafe { p.call(fini, [argv.argc(), argv.argv().raw(), 0]) };

        let mut loader = self.loader.lock();
        let mut mm = self.mm.lock();
        argv.release(&mut mm)?;
        if status != SUCCESS {
            return Err(LoaderError::FiniFailed(status));
        }
        loader.remove(&mut mm, id)
    }

    pub fn lookup_export(&self, name: &[u8]) -> Option<VirtAddr> {
        self.loader.lock().lookup(name)
    }

    // ---------------------------------------------------------------------
    // Services exported to modules
    // ---------------------------------------------------------------------

    /// Formats `fmt` (a NUL-terminated string in kernel space) into the log
    /// sinks. Returns the number of bytes produced.
    pub fn printf(&self, fmt: VirtAddr, args: &[u32]) -> Option<u32> {
        if fmt.is_null() {
            return None;
        }
        let p = &self.platform;
        let fmt = p.read_cstr(fmt, MAX_STRING)?;
        let mut out = Vec::new();
        printf::render(
            &fmt,
            args,
            |at| (at != 0).then(|| p.read_cstr(VirtAddr(at), MAX_STRING)).flatten(),
            &mut |byte| out.push(byte),
        );
        log::write_bytes(&out);
        Some(out.len() as u32)
    }

    pub fn malloc(&self, size: u32) -> Result<VirtAddr, AllocError> {
        self.mm.lock().alloc(MALLOC_ALIGN, size)
    }

    pub fn free(&self, va: VirtAddr) -> Result<(), AllocError> {
        self.mm.lock().free(va)
    }

    pub fn map(&self, pa: PhysAddr, size: u32, flags: MapFlags, hint: VirtAddr) -> Result<VirtAddr, MapError> {
        self.mm.lock().map(&self.platform, pa, size, flags, hint)
    }

    pub fn unmap(&self, va: VirtAddr, size: u32, flags: MapFlags) -> Result<(), MapError> {
        self.mm.lock().unmap(&self.platform, va, size, flags)
    }

    pub fn lookup_va(&self, pa: PhysAddr) -> Result<VirtAddr, MapError> {
        self.mm.lock().lookup_va(pa)
    }

    pub fn lookup_pa(&self, va: VirtAddr) -> Result<PhysAddr, MapError> {
        self.mm.lock().lookup_pa(va)
    }

    pub fn register_call(&self, identifier: u32, handler: Handler) -> Result<(), CallError> {
        self.calls.lock().register(identifier, handler).map(|_| ())
    }

    pub fn unregister_call(&self, identifier: u32, handler: &Handler) -> Result<(), CallError> {
        self.calls.lock().unregister(identifier, handler)
    }

    pub fn register_vector(&self, raw: u32, handler: Handler) -> Result<(), VectorError> {
        let vector = Vector::from_raw(raw).ok_or(VectorError::UnknownVector(raw))?;
        self.vectors.lock().register(vector, handler);
        Ok(())
    }

    pub fn unregister_vector(&self, raw: u32, handler: &Handler) -> Result<(), VectorError> {
        let vector = Vector::from_raw(raw).ok_or(VectorError::UnknownVector(raw))?;
        self.vectors.lock().unregister(vector, handler)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::boot;
    use crate::call::DEFAULT_IDENTIFIER;
    use crate::config::CALLSIGN;
    use crate::diag::call::{BUFFER_SIZE, INIT, LOG_CALL_IDENTIFIER};
    use crate::hal::sim::{layout::*, SimPlatform};
    use crate::hal::Memory;
    use crate::loader::call::{ADD_MODULE, COPY_MODULE_HEADER, LOADER_CALL_IDENTIFIER, REMOVE_MODULE};
    use crate::loader::image::{builder::image, HEADER_SIZE};
    use crate::loader::Image;
    use crate::vector::{VectorSlot, VECTOR_COUNT};
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    const UND: u32 = Vector::UndefinedInstruction as u32;

    /// Kernel brought up against the host fixture, external system live.
    pub(crate) fn started() -> Kernel<SimPlatform> {
        let (sim, mm) = crate::mm::tests::booted();
        let slots: &'static Slots = Box::leak(Box::new([const { VectorSlot::new() }; VECTOR_COUNT]));
        let kernel = Kernel::new(sim, mm, slots);
        kernel.start_run(&boot::tests::fake_exports()).expect("start_run");
        {
            let mut mm = kernel.mm.lock();
            kernel.switch(&mut mm, Tag::External).expect("switch");
        }
        kernel
    }

    fn call_frame(identifier: u32, regs: &[u32]) -> Frame {
        let mut all = vec![CALLSIGN, identifier];
        all.extend_from_slice(regs);
        Frame::with_regs(&all)
    }

    /// Writes `bytes` into the host's user window and returns their address.
    fn put_user(sim: &SimPlatform, offset: u32, bytes: &[u8]) -> VirtAddr {
        sim.phys_write_bytes(USER_PA + offset, bytes);
        VirtAddr(USER_VA + offset)
    }

    #[test]
    fn vector_handler_sees_the_trap_frame_and_external_is_restored() {
        let kernel = started();
        let seen = Arc::new(AtomicU32::new(0));
        let observed = seen.clone();
        kernel.platform().on_handler(move |_, _, _, frame| {
            observed.store(frame.reg(0), Ordering::SeqCst);
            0
        });
        kernel
            .register_vector(Vector::DataAbort as u32, Handler::Foreign { entry: VirtAddr(0xC041_0000), context: 3 })
            .expect("register");

        let mut frame = Frame::with_regs(&[0x1234]);
        assert!(!kernel.dispatch(Vector::DataAbort as u32, &mut frame));
        assert_eq!(seen.load(Ordering::SeqCst), 0x1234);
        assert_eq!(kernel.live_tag(), Tag::External);
        assert!(!kernel.platform().fiq_masked());
    }

    #[test]
    fn handler_claims_the_trap() {
        let kernel = started();
        kernel.platform().on_handler(|_, _, handled, _| {
            *handled = 1;
            0
        });
        kernel.register_vector(Vector::Interrupt as u32, Handler::Foreign { entry: VirtAddr(0xC041_0000), context: 0 }).expect("register");
        let mut frame = Frame::default();
        assert!(kernel.dispatch(Vector::Interrupt as u32, &mut frame));
        assert!(kernel.vectors.lock().slot(Vector::Interrupt).is_handled());
    }

    #[test]
    fn failing_handler_aborts_the_chain_and_is_not_handled() {
        let kernel = started();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        kernel.platform().on_handler(move |entry, _, handled, _| {
            counted.fetch_add(1, Ordering::SeqCst);
            *handled = 1;
            if entry == 0xC041_0100 { 5 } else { 0 }
        });
        let first = Handler::Foreign { entry: VirtAddr(0xC041_0000), context: 0 };
        let failing = Handler::Foreign { entry: VirtAddr(0xC041_0100), context: 0 };
        kernel.register_vector(Vector::DataAbort as u32, first).expect("register");
        kernel.register_vector(Vector::DataAbort as u32, failing).expect("register");
        let mut frame = Frame::default();
        assert!(!kernel.dispatch(Vector::DataAbort as u32, &mut frame));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(kernel.live_tag(), Tag::External);
    }

    #[test]
    fn fiq_stays_masked_when_the_trapped_context_masked_it() {
        let kernel = started();
        kernel.platform().set_spsr(PSR_F);
        let mut frame = Frame::default();
        kernel.dispatch(UND, &mut frame);
        assert!(kernel.platform().fiq_masked());
    }

    #[test]
    fn nested_dispatch_keeps_the_internal_system_live() {
        let kernel = started();
        {
            let mut mm = kernel.mm.lock();
            kernel.switch(&mut mm, Tag::Internal).expect("switch");
        }
        let mut frame = Frame::default();
        kernel.dispatch(UND, &mut frame);
        assert_eq!(kernel.live_tag(), Tag::Internal);
    }

    #[test]
    fn busy_kernel_leaves_the_trap_to_the_host() {
        let kernel = started();
        let guard = kernel.vectors.lock();
        kernel.slots[UND as usize].set_handled(true);
        let mut frame = call_frame(7, &[]);
        assert!(!kernel.dispatch(UND, &mut frame));
        drop(guard);
        assert!(!kernel.slots[UND as usize].is_handled());
        assert_eq!(kernel.live_tag(), Tag::External);
    }

    #[test]
    fn registered_call_writes_its_result() {
        let kernel = started();
        kernel.platform().on_handler(|_, _, _, frame| {
            frame.set_reg(0, 1);
            0
        });
        kernel.register_call(7, Handler::Foreign { entry: VirtAddr(0xC041_0200), context: 0 }).expect("register");
        let mut frame = call_frame(7, &[]);
        assert!(kernel.dispatch(UND, &mut frame));
        assert_eq!(frame.reg(0), 1);
    }

    #[test]
    fn unrecognised_magic_is_left_to_the_host() {
        let kernel = started();
        let mut frame = Frame::with_regs(&[CALLSIGN ^ 1, 7]);
        assert!(!kernel.dispatch(UND, &mut frame));
        assert_eq!(frame.reg(0), CALLSIGN ^ 1);
    }

    #[test]
    fn unclaimed_identifier_reaches_the_default_handler() {
        let kernel = started();
        let mut frame = call_frame(0x42, &[]);
        assert!(kernel.dispatch(UND, &mut frame));
        assert_eq!(frame.reg(0), CALLSIGN);
    }

    #[test]
    fn unknown_identifier_without_a_default_handler_goes_to_the_host() {
        let kernel = started();
        kernel
            .unregister_call(DEFAULT_IDENTIFIER, &Handler::Native(Service::CallDefault))
            .expect("unregister");
        let mut frame = call_frame(9, &[]);
        assert!(!kernel.dispatch(UND, &mut frame));
        assert!(!kernel.slots[UND as usize].is_handled());
        assert_eq!(frame.reg(0), CALLSIGN);
    }

    #[test]
    fn failing_call_handler_reports_through_r0() {
        let kernel = started();
        kernel.platform().on_handler(|_, _, _, _| 9);
        kernel.register_call(7, Handler::Foreign { entry: VirtAddr(0xC041_0200), context: 0 }).expect("register");
        let mut frame = call_frame(7, &[]);
        assert!(kernel.dispatch(UND, &mut frame));
        assert_eq!(frame.reg(0), FAILURE);
    }

    #[test]
    fn log_call_is_reachable() {
        let kernel = started();
        crate::log_info!("log call reachable");
        let mut frame = call_frame(LOG_CALL_IDENTIFIER, &[INIT]);
        assert!(kernel.dispatch(UND, &mut frame));
        assert_eq!(frame.reg(0), SUCCESS);
        let mut frame = call_frame(LOG_CALL_IDENTIFIER, &[BUFFER_SIZE]);
        assert!(kernel.dispatch(UND, &mut frame));
        assert_eq!(frame.reg(0), SUCCESS);
    }

    fn argv(sim: &SimPlatform, offset: u32, args: &[&str]) -> VirtAddr {
        let mut at = offset + 0x100;
        let mut table = Vec::new();
        for arg in args {
            let mut bytes = arg.as_bytes().to_vec();
            bytes.push(0);
            table.extend_from_slice(&put_user(sim, at, &bytes).raw().to_le_bytes());
            at += bytes.len() as u32;
        }
        put_user(sim, offset, &table)
    }

    #[test]
    fn loader_call_adds_copies_header_and_removes() {
        let kernel = started();
        let sim = kernel.platform();
        let bytes = image("net", &[("net_send", 0x40)], &["printf"]);
        let user_image = put_user(sim, 0, &bytes);
        let user_argv = argv(sim, 0x2000, &["net", "-v"]);

        let entered = Arc::new(AtomicU32::new(0));
        let seen = entered.clone();
        sim.on_call(move |_, args| {
            seen.store(args[0], Ordering::SeqCst);
            0
        });

        let mut frame = call_frame(LOADER_CALL_IDENTIFIER, &[ADD_MODULE, user_image.raw(), bytes.len() as u32, 2, user_argv.raw()]);
        assert!(kernel.dispatch(UND, &mut frame));
        assert_eq!(frame.reg(0), SUCCESS);
        assert_eq!(entered.load(Ordering::SeqCst), 2);
        let (entry, _) = sim.calls().last().copied().expect("init ran");
        let base = kernel.loader.lock().find_module(b"net").expect("loaded").base;
        assert_eq!(entry, base.add(Image::parse(&bytes).expect("parse").header().init).raw());
        assert_eq!(kernel.live_tag(), Tag::External);

        let dest = VirtAddr(USER_VA + 0x3000);
        let mut frame = call_frame(LOADER_CALL_IDENTIFIER, &[COPY_MODULE_HEADER, 0, dest.raw(), 64]);
        assert!(kernel.dispatch(UND, &mut frame));
        assert_eq!(frame.reg(0), SUCCESS);
        let copied = sim.phys_read_bytes(USER_PA + 0x3000, HEADER_SIZE as usize + 4);
        assert_eq!(&copied[HEADER_SIZE as usize..], b"net\0");

        let mut frame = call_frame(LOADER_CALL_IDENTIFIER, &[COPY_MODULE_HEADER, 0, dest.raw(), 8]);
        kernel.dispatch(UND, &mut frame);
        assert_eq!(frame.reg(0), FAILURE);

        let name = put_user(sim, 0x3800, b"net\0");
        let mut frame = call_frame(LOADER_CALL_IDENTIFIER, &[REMOVE_MODULE, name.raw(), 2, user_argv.raw()]);
        assert!(kernel.dispatch(UND, &mut frame));
        assert_eq!(frame.reg(0), SUCCESS);
        assert!(kernel.loader.lock().find_module(b"net").is_none());
        assert!(kernel.lookup_export(b"net_send").is_none());
    }

    #[test]
    fn loader_call_rejects_bad_requests() {
        let kernel = started();
        let mut frame = call_frame(LOADER_CALL_IDENTIFIER, &[ADD_MODULE, 0, 16, 1, USER_VA]);
        assert!(kernel.dispatch(UND, &mut frame));
        assert_eq!(frame.reg(0), FAILURE);
        let mut frame = call_frame(LOADER_CALL_IDENTIFIER, &[7]);
        assert!(kernel.dispatch(UND, &mut frame));
        assert_eq!(frame.reg(0), FAILURE);
    }

    #[test]
    fn failed_init_unloads_the_module() {
        let kernel = started();
        let free = kernel.mm.lock().blocks().free_blocks();
        kernel.platform().on_call(|_, _| 3);
        assert_eq!(
            kernel.add_module(&image("bad", &[("bad_fn", 0)], &[]), &[b"bad".to_vec()]),
            Err(LoaderError::InitFailed(3))
        );
        assert!(kernel.lookup_export(b"bad_fn").is_none());
        assert_eq!(kernel.mm.lock().blocks().free_blocks(), free);
    }

    #[test]
    fn failed_fini_keeps_the_module() {
        let kernel = started();
        kernel.add_module(&image("keep", &[("keep_fn", 0)], &[]), &[b"keep".to_vec()]).expect("add");
        kernel.platform().on_call(|_, _| 1);
        assert_eq!(kernel.remove_module(b"keep", &[b"keep".to_vec()]), Err(LoaderError::FiniFailed(1)));
        assert!(kernel.lookup_export(b"keep_fn").is_some());
        assert_eq!(kernel.remove_module(b"tendril", &[b"x".to_vec()]), Err(LoaderError::NotRemovable));
    }

    #[test]
    fn modules_import_kernel_services() {
        let kernel = started();
        let id = kernel.add_module(&image("uses", &[], &["malloc"]), &[b"uses".to_vec()]).expect("add");
        let loader = kernel.loader.lock();
        let module = loader.module(id).expect("module");
        let parsed = Image::parse(&module.header_bytes).map(|i| i.identity().to_vec());
        assert_eq!(parsed, Ok(b"uses".to_vec()));
        assert_eq!(loader.lookup(b"malloc"), Some(boot::tests::fake_exports()[1].1));
    }

    #[test]
    fn printf_resolves_strings_through_kernel_memory() {
        let kernel = started();
        {
            let mut mm = kernel.mm.lock();
            kernel.switch(&mut mm, Tag::Internal).expect("switch");
        }
        let buffer = kernel.malloc(64).expect("malloc");
        let sim = kernel.platform();
        sim.write_bytes(buffer, b"%s=%d\n\0");
        sim.write_bytes(buffer.add(16), b"x\0");
        assert_eq!(kernel.printf(buffer, &[buffer.add(16).raw(), (-3i32) as u32]), Some(6));
        assert_eq!(kernel.printf(VirtAddr(0), &[]), None);
        kernel.free(buffer).expect("free");
    }
}
