// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Module loader: image staging, export table and import resolution
//! OWNERS: @kernel-team
//! PUBLIC API: Loader::{stage, discard, fini_entry, remove, lookup, register_kernel_module}
//! DEPENDS_ON: loader::image, mm::MemoryManager (image and argument memory), hal::Memory
//! INVARIANTS:
//!   - Module identities are unique among loaded modules
//!   - A failed stage leaves the module list and the export set untouched
//!   - Every export belongs to exactly one loaded module and leaves with it
//!   - Name lookups are exact; the most recently registered export wins
//!
//! Loading is split around the module's own code: `stage` relocates and
//! registers, the caller runs `init` without holding any kernel lock, and a
//! failing `init` is undone with `discard`. Unloading mirrors it with
//! `fini_entry` and `remove`.

extern crate alloc;

use alloc::vec::Vec;
use core::num::NonZeroU32;

pub mod call;
pub mod image;

pub use image::{Entry, Header, Image, ImageError};

use crate::hal::Platform;
use crate::mm::{AllocError, MapError, MemoryManager};
use crate::types::VirtAddr;
use image::{ENTRY_ADDRESS, HEADER_SIZE};

/// Error returned by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderError {
    /// The image is malformed.
    Image(ImageError),
    /// A module with the same identity is loaded.
    DuplicateModule,
    /// Import `index` names no known export.
    ImportNotFound { index: u32 },
    /// No loaded module has that identity.
    ModuleNotFound,
    /// The kernel's own module cannot be removed.
    NotRemovable,
    /// The module's initializer returned this status.
    InitFailed(u32),
    /// The module's finalizer returned this status.
    FiniFailed(u32),
    /// A register argument is null or zero where a value is required.
    BadRequest,
    /// The destination cannot hold `needed` bytes.
    BufferTooSmall { needed: u32 },
    /// Unknown loader sub-operation.
    UnknownOperation(u32),
    /// Kernel memory for the image or arguments ran out.
    Alloc(AllocError),
    /// Caller memory could not be reached.
    Map(MapError),
}

impl From<ImageError> for LoaderError {
    fn from(value: ImageError) -> Self {
        Self::Image(value)
    }
}

impl From<AllocError> for LoaderError {
    fn from(value: AllocError) -> Self {
        Self::Alloc(value)
    }
}

impl From<MapError> for LoaderError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(NonZeroU32);

impl ModuleId {
    pub fn raw(self) -> u32 {
        self.0.get()
    }
}

/// A loaded module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub id: ModuleId,
    pub name: Vec<u8>,
    /// Where the relocated image lives; 0 for the kernel's own module.
    pub base: VirtAddr,
    pub size: u32,
    pub header: Header,
    /// Header and identity string as they appear in the image.
    pub header_bytes: Vec<u8>,
    pub removable: bool,
}

/// A symbol some module provides.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Export {
    pub name: Vec<u8>,
    /// Relative to the owning module's base.
    pub address: u32,
    pub module: ModuleId,
}

/// A module whose initializer has not run yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Staged {
    pub id: ModuleId,
    pub init: VirtAddr,
}

pub struct Loader {
    /// Most recently loaded first.
    modules: Vec<Module>,
    /// Registration order.
    exports: Vec<Export>,
    next_id: u32,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    pub const fn new() -> Self {
        Self { modules: Vec::new(), exports: Vec::new(), next_id: 1 }
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub fn find_module(&self, name: &[u8]) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Absolute address of `name`.
    pub fn lookup(&self, name: &[u8]) -> Option<VirtAddr> {
        let export = self.exports.iter().rev().find(|e| e.name == name)?;
        let module = self.module(export.module)?;
        Some(module.base.add(export.address))
    }

    /// Header bytes of the `index`-th module, most recent first.
    pub fn header_of(&self, index: u32) -> Option<&[u8]> {
        self.modules.get(index as usize).map(|m| m.header_bytes.as_slice())
    }

    fn allocate_id(&mut self) -> ModuleId {
        loop {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if let Some(raw) = NonZeroU32::new(candidate) {
                let id = ModuleId(raw);
                if self.module(id).is_none() {
                    return id;
                }
            }
        }
    }

    /// Registers the kernel's own services under `name`. Addresses are absolute.
    pub fn register_kernel_module(&mut self, name: &[u8], exports: &[(&[u8], VirtAddr)]) -> Result<ModuleId, LoaderError> {
        if self.find_module(name).is_some() {
            return Err(LoaderError::DuplicateModule);
        }
        let id = self.allocate_id();
        let mut header_bytes = alloc::vec![0u8; HEADER_SIZE as usize];
        header_bytes.extend_from_slice(name);
        header_bytes.push(0);
        self.modules.insert(
            0,
            Module {
                id,
                name: name.to_vec(),
                base: VirtAddr(0),
                size: 0,
                header: Header { init: 0, fini: 0, import: 0, export: 0 },
                header_bytes,
                removable: false,
            },
        );
        for (export, address) in exports {
            self.exports.push(Export { name: export.to_vec(), address: address.raw(), module: id });
        }
        Ok(id)
    }

    /// Copies `bytes` into kernel memory, resolves its imports and registers
    /// its exports. Own exports take precedence over the global set.
    pub fn stage<P: Platform + ?Sized>(
        &mut self,
        mm: &mut MemoryManager,
        p: &P,
        bytes: &[u8],
    ) -> Result<Staged, LoaderError> {
        let image = Image::parse(bytes)?;
        if self.find_module(image.identity()).is_some() {
            return Err(LoaderError::DuplicateModule);
        }
        let header = image.header();
        for offset in [header.init, header.fini] {
            if offset as usize >= bytes.len() {
                return Err(ImageError::Truncated { offset }.into());
            }
        }
        let exports = image.exports()?;
        let imports = image.imports()?;

        let size = bytes.len() as u32;
        let base = mm.alloc(8, size)?;
        let mut relocated = bytes.to_vec();
        for (index, import) in imports.iter().enumerate() {
            let own = exports.iter().rev().find(|e| e.name == import.name).map(|e| base.add(e.address));
            let Some(address) = own.or_else(|| self.lookup(&import.name)) else {
                crate::log_warn!(
                    target: "ldr",
                    "{}: unresolved import {}",
                    image.identity().escape_ascii(),
                    import.name.escape_ascii()
                );
                let _ = mm.free(base);
                return Err(LoaderError::ImportNotFound { index: index as u32 });
            };
            let at = (import.offset + ENTRY_ADDRESS) as usize;
            relocated[at..at + 4].copy_from_slice(&address.raw().to_le_bytes());
        }
        p.write_bytes(base, &relocated);
        p.dcache_clean_region(base, size);
        p.flush_entire_cache();

        let id = self.allocate_id();
        for export in exports {
            self.exports.push(Export { name: export.name, address: export.address, module: id });
        }
        self.modules.insert(
            0,
            Module {
                id,
                name: image.identity().to_vec(),
                base,
                size,
                header,
                header_bytes: image.header_bytes().to_vec(),
                removable: true,
            },
        );
        crate::log_info!(target: "ldr", "staged {} at {:?}", image.identity().escape_ascii(), base);
        Ok(Staged { id, init: base.add(header.init) })
    }

    /// Undoes `stage` after the initializer failed.
    pub fn discard(&mut self, mm: &mut MemoryManager, id: ModuleId) -> Result<(), LoaderError> {
        self.unload(mm, id)
    }

    /// Finalizer entry of the module called `name`.
    pub fn fini_entry(&self, name: &[u8]) -> Result<(ModuleId, VirtAddr), LoaderError> {
        let module = self.find_module(name).ok_or(LoaderError::ModuleNotFound)?;
        if !module.removable {
            return Err(LoaderError::NotRemovable);
        }
        Ok((module.id, module.base.add(module.header.fini)))
    }

    /// Drops a module whose finalizer succeeded.
    pub fn remove(&mut self, mm: &mut MemoryManager, id: ModuleId) -> Result<(), LoaderError> {
        let module = self.module(id).ok_or(LoaderError::ModuleNotFound)?;
        if !module.removable {
            return Err(LoaderError::NotRemovable);
        }
        self.unload(mm, id)
    }

    fn unload(&mut self, mm: &mut MemoryManager, id: ModuleId) -> Result<(), LoaderError> {
        let index = self.modules.iter().position(|m| m.id == id).ok_or(LoaderError::ModuleNotFound)?;
        let module = self.modules.remove(index);
        self.exports.retain(|e| e.module != id);
        mm.free(module.base)?;
        crate::log_info!(target: "ldr", "removed {}", module.name.escape_ascii());
        Ok(())
    }
}

/// Caller arguments copied into kernel memory: a pointer array followed by
/// the NUL-terminated strings it points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgBlock {
    block: Option<VirtAddr>,
    argc: u32,
}

impl ArgBlock {
    pub fn stage<P: Platform + ?Sized>(
        mm: &mut MemoryManager,
        p: &P,
        args: &[Vec<u8>],
    ) -> Result<Self, LoaderError> {
        let argc = args.len() as u32;
        if argc == 0 {
            return Ok(Self { block: None, argc });
        }
        let table = argc * 4;
        let strings: u32 = args.iter().map(|a| a.len() as u32 + 1).sum();
        let block = mm.alloc(4, table + strings)?;
        let mut at = block.add(table);
        for (i, arg) in args.iter().enumerate() {
            p.write_u32(block.add(i as u32 * 4), at.raw());
            p.write_bytes(at, arg);
            p.write_u8(at.add(arg.len() as u32), 0);
            at = at.add(arg.len() as u32 + 1);
        }
        Ok(Self { block: Some(block), argc })
    }

    pub fn argc(&self) -> u32 {
        self.argc
    }

    pub fn argv(&self) -> VirtAddr {
        self.block.unwrap_or_default()
    }

    pub fn release(self, mm: &mut MemoryManager) -> Result<(), LoaderError> {
        if let Some(block) = self.block {
            mm.free(block)?;
        }
        Ok(())
    }
}
