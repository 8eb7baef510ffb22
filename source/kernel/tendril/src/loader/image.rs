// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bounds-checked reader for relocatable module images
//! OWNERS: @kernel-team
//! PUBLIC API: Image::{parse, header, identity, exports, imports}, Entry
//! INVARIANTS: Every offset is checked before it is read; nothing is written
//!
//! Layout, all fields little-endian u32:
//!
//! ```text
//! 0x00 init  0x04 fini  0x08 import  0x0c export  0x10 identity\0
//! table:  functions, count
//! entry:  size (stride), address, name\0
//! ```
//!
//! Offsets are relative to the start of the image. Export addresses are
//! image-relative; import addresses are placeholders the loader overwrites.

extern crate alloc;

use alloc::vec::Vec;

use crate::config::MAX_STRING;

pub const HEADER_SIZE: u32 = 16;
const ENTRY_FIXED: u32 = 8;
/// Offset of the address field within an entry.
pub const ENTRY_ADDRESS: u32 = 4;

/// Malformed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// A field at `offset` runs past the end of the image.
    Truncated { offset: u32 },
    /// A string at `offset` has no terminator within bounds.
    Unterminated { offset: u32 },
    /// The identity string is empty.
    EmptyIdentity,
    /// An entry's stride does not cover its own fields and name.
    BadStride { offset: u32 },
}

/// Image header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub init: u32,
    pub fini: u32,
    pub import: u32,
    pub export: u32,
}

/// One import or export table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Offset of the entry within the image.
    pub offset: u32,
    pub address: u32,
    pub name: Vec<u8>,
}

/// Validated view over an image's bytes.
#[derive(Clone, Copy, Debug)]
pub struct Image<'a> {
    bytes: &'a [u8],
    header: Header,
    identity_len: u32,
}

impl<'a> Image<'a> {
    /// Checks the header and identity string.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ImageError> {
        let mut image = Self {
            bytes,
            header: Header { init: 0, fini: 0, import: 0, export: 0 },
            identity_len: 0,
        };
        image.header = Header {
            init: image.u32_at(0)?,
            fini: image.u32_at(4)?,
            import: image.u32_at(8)?,
            export: image.u32_at(12)?,
        };
        let identity = image.cstr_at(HEADER_SIZE)?;
        if identity.is_empty() {
            return Err(ImageError::EmptyIdentity);
        }
        image.identity_len = identity.len() as u32;
        Ok(image)
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn identity(&self) -> &'a [u8] {
        let start = HEADER_SIZE as usize;
        &self.bytes[start..start + self.identity_len as usize]
    }

    /// Header plus identity string and its terminator.
    pub fn header_bytes(&self) -> &'a [u8] {
        &self.bytes[..(HEADER_SIZE + self.identity_len + 1) as usize]
    }

    pub fn exports(&self) -> Result<Vec<Entry>, ImageError> {
        self.table(self.header.export)
    }

    pub fn imports(&self) -> Result<Vec<Entry>, ImageError> {
        self.table(self.header.import)
    }

    fn table(&self, at: u32) -> Result<Vec<Entry>, ImageError> {
        let first = self.u32_at(at)?;
        let count = self.u32_at(at.checked_add(4).ok_or(ImageError::Truncated { offset: at })?)?;
        let mut entries = Vec::new();
        let mut offset = first;
        for _ in 0..count {
            let size = self.u32_at(offset)?;
            let address = self.u32_at(offset.checked_add(ENTRY_ADDRESS).ok_or(ImageError::Truncated { offset })?)?;
            let name_at = offset.checked_add(ENTRY_FIXED).ok_or(ImageError::Truncated { offset })?;
            let name = self.cstr_at(name_at)?;
            if (size as u64) < ENTRY_FIXED as u64 + name.len() as u64 + 1 {
                return Err(ImageError::BadStride { offset });
            }
            entries.push(Entry { offset, address, name: name.to_vec() });
            offset = offset.checked_add(size).ok_or(ImageError::Truncated { offset })?;
        }
        Ok(entries)
    }

    fn u32_at(&self, offset: u32) -> Result<u32, ImageError> {
        let start = offset as usize;
        let word = start
            .checked_add(4)
            .and_then(|end| self.bytes.get(start..end))
            .ok_or(ImageError::Truncated { offset })?;
        Ok(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
    }

    fn cstr_at(&self, offset: u32) -> Result<&'a [u8], ImageError> {
        let rest = self.bytes.get(offset as usize..).ok_or(ImageError::Truncated { offset })?;
        let window = &rest[..rest.len().min(MAX_STRING + 1)];
        let len = window.iter().position(|b| *b == 0).ok_or(ImageError::Unterminated { offset })?;
        Ok(&rest[..len])
    }
}
