// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sentinel-headed doubly-linked list over an arena
//! OWNERS: @kernel-team
//! PUBLIC API: HandlerList::{insert_after_head, insert_after, remove, first, next, prev, get, iter}
//! INVARIANTS:
//!   - Slot 0 is always the sentinel; handles are only ever issued for entries
//!   - A handle stays valid until its entry is removed; stale handles resolve to None
//!
//! Registries keep their handler chains here. Links are slot indices, and a
//! per-slot generation counter detects handles that outlived their entry.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

const HEAD: usize = 0;

/// Stable reference to a list entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle {
    index: usize,
    generation: u32,
}

enum Node<T> {
    Sentinel,
    Entry(T),
}

struct Slot<T> {
    generation: u32,
    prev: usize,
    next: usize,
    node: Option<Node<T>>,
}

pub struct HandlerList<T> {
    slots: Vec<Slot<T>>,
    vacant: Vec<usize>,
    len: usize,
}

impl<T> Default for HandlerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandlerList<T> {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot { generation: 0, prev: HEAD, next: HEAD, node: Some(Node::Sentinel) }],
            vacant: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `value` directly after the sentinel, making it the first entry.
    pub fn insert_after_head(&mut self, value: T) -> Handle {
        self.link_after(HEAD, value)
    }

    /// Inserts `value` after `at`. Returns `None` for a stale handle.
    pub fn insert_after(&mut self, at: Handle, value: T) -> Option<Handle> {
        self.resolve(at)?;
        Some(self.link_after(at.index, value))
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        self.resolve(handle)?;
        let (prev, next) = {
            let slot = &self.slots[handle.index];
            (slot.prev, slot.next)
        };
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
        let slot = &mut self.slots[handle.index];
        slot.generation = slot.generation.wrapping_add(1);
        let node = slot.node.take();
        self.vacant.push(handle.index);
        self.len -= 1;
        match node {
            Some(Node::Entry(value)) => Some(value),
            _ => None,
        }
    }

    pub fn first(&self) -> Option<Handle> {
        self.handle_at(self.slots[HEAD].next)
    }

    /// Entry after `handle`; `None` at the end of the list.
    pub fn next(&self, handle: Handle) -> Option<Handle> {
        self.resolve(handle)?;
        self.handle_at(self.slots[handle.index].next)
    }

    /// Entry before `handle`; `None` when only the sentinel precedes it.
    pub fn prev(&self, handle: Handle) -> Option<Handle> {
        self.resolve(handle)?;
        self.handle_at(self.slots[handle.index].prev)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.resolve(handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.resolve(handle)?;
        match self.slots[handle.index].node.as_mut() {
            Some(Node::Entry(value)) => Some(value),
            _ => None,
        }
    }

    /// Entries in list order, first to last.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { list: self, cursor: self.slots[HEAD].next }
    }

    /// First entry matching `pred`, in list order.
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<Handle> {
        let mut cursor = self.first();
        while let Some(handle) = cursor {
            if self.get(handle).is_some_and(&mut pred) {
                return Some(handle);
            }
            cursor = self.next(handle);
        }
        None
    }

    fn link_after(&mut self, at: usize, value: T) -> Handle {
        let next = self.slots[at].next;
        let index = match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.prev = at;
                slot.next = next;
                slot.node = Some(Node::Entry(value));
                index
            }
            None => {
                self.slots.push(Slot { generation: 0, prev: at, next, node: Some(Node::Entry(value)) });
                self.slots.len() - 1
            }
        };
        self.slots[at].next = index;
        self.slots[next].prev = index;
        self.len += 1;
        Handle { index, generation: self.slots[index].generation }
    }

    fn handle_at(&self, index: usize) -> Option<Handle> {
        match self.slots[index].node {
            Some(Node::Entry(_)) => Some(Handle { index, generation: self.slots[index].generation }),
            _ => None,
        }
    }

    fn resolve(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        match slot.node.as_ref() {
            Some(Node::Entry(value)) => Some(value),
            _ => None,
        }
    }
}

pub struct Iter<'a, T> {
    list: &'a HandlerList<T>,
    cursor: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Handle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = &self.list.slots[self.cursor];
        match slot.node.as_ref() {
            Some(Node::Entry(value)) => {
                let handle = Handle { index: self.cursor, generation: slot.generation };
                self.cursor = slot.next;
                Some((handle, value))
            }
            _ => None,
        }
    }
}
