// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Global allocator for the kernel's own collections.
//!
//! Backed by a static arena inside the image, so it is usable before the
//! block allocator exists and never competes with table or module memory.
//! Allocation never spins: a trap taken while the heap is locked gets null
//! instead of deadlocking on the code it interrupted.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
#[cfg(not(test))]
use core::sync::atomic::{AtomicBool, Ordering};

use linked_list_allocator::Heap;
use spin::Mutex;

use crate::config::HEAP_SIZE;

#[repr(C, align(16))]
#[cfg_attr(test, allow(dead_code))]
struct Arena([u8; HEAP_SIZE]);

#[cfg(not(test))]
static mut ARENA: Arena = Arena([0; HEAP_SIZE]);
#[cfg(not(test))]
static READY: AtomicBool = AtomicBool::new(false);

struct LockedHeap(Mutex<Heap>);

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap(Mutex::new(Heap::empty()));

/// Hands the arena to the allocator. Later calls are ignored.
#[cfg(not(test))]
pub fn init() {
    if READY.swap(true, Ordering::AcqRel) {
        return;
    }
    let mut heap = ALLOCATOR.0.lock();
    // SAFETY: ARENA is only ever reached through this allocator and the
    // swap above guarantees it is handed over once.
    unsafe {
        let base = ptr::addr_of_mut!(ARENA) as *mut u8;
        heap.init(base, HEAP_SIZE);
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(mut heap) = self.0.try_lock() else {
            return ptr::null_mut();
        };
        match heap.allocate_first_fit(layout) {
            Ok(block) => block.as_ptr(),
            Err(()) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(block) = NonNull::new(ptr) {
            self.0.lock().deallocate(block, layout);
        }
    }
}
