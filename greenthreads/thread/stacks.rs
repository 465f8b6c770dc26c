// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Includes helpers and state for managing the stacks used by
//! green threads.
//!
//! Each green thread other than the initial thread has its own
//! stack, allocated by calling [`new_stack`]. The initial thread
//! runs on the stack the OS gave it. Each stack is an anonymous
//! mapping with a guard page below it, so overflowing a stack
//! faults rather than corrupting its neighbour.
//!
//! Stacks are released by calling [`free_stack`], which keeps a
//! bounded number of them for reuse by later calls to [`new_stack`].

use crate::error::Error;
use crate::scheduler::preempt::without_preemption;
use core::ptr::{self, NonNull};
use log::warn;
use spin::Mutex;

/// The size of a page of stack memory.
///
pub const PAGE_SIZE: usize = 4096;

/// The most stacks we keep around for reuse. Beyond
/// this, released stacks are unmapped.
///
const MAX_DEAD_STACKS: usize = 64;

/// Describes a mapped thread stack, including its
/// guard page.
///
/// Dropping a `Stack` unmaps it.
///
#[derive(Debug)]
pub struct Stack {
    // The first address of the mapping. This is the
    // start of the guard page.
    base: NonNull<u8>,

    // The size of the mapping in bytes, including the
    // guard page.
    len: usize,
}

// Stack is just a description of a private mapping,
// which any OS thread may use or unmap. We need it to
// be Send so it can live in DEAD_STACKS.
//
unsafe impl Send for Stack {}

impl Stack {
    /// Maps a new stack of `num_pages` usable pages,
    /// plus a guard page.
    ///
    fn map(num_pages: usize) -> Result<Self, Error> {
        let len = num_pages
            .checked_add(1)
            .and_then(|pages| pages.checked_mul(PAGE_SIZE))
            .ok_or(Error::ResourceExhausted)?;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            warn!(
                "cannot map {}-page stack: {}",
                num_pages,
                nix::errno::Errno::last()
            );
            return Err(Error::ResourceExhausted);
        }

        let base = NonNull::new(addr as *mut u8).ok_or(Error::ResourceExhausted)?;
        let stack = Stack { base, len };

        // The stack grows downwards, so the guard
        // goes at the lowest address. If we fail,
        // dropping `stack` unmaps it again.
        if unsafe { libc::mprotect(addr, PAGE_SIZE, libc::PROT_NONE) } != 0 {
            warn!("cannot protect stack guard: {}", nix::errno::Errno::last());
            return Err(Error::ResourceExhausted);
        }

        Ok(stack)
    }

    /// Returns the smallest usable address in the stack.
    /// As the stack grows downwards, this is also known
    /// as the bottom of the stack.
    ///
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize + PAGE_SIZE
    }

    /// Returns the address just past the largest usable
    /// address in the stack. This is where the stack
    /// pointer starts.
    ///
    pub fn end(&self) -> usize {
        self.base.as_ptr() as usize + self.len
    }

    /// Returns the number of usable pages, excluding
    /// the guard page.
    ///
    pub fn num_pages(&self) -> usize {
        self.len / PAGE_SIZE - 1
    }

    /// Returns whether the usable part of the stack
    /// includes the given address.
    ///
    pub fn contains(&self, addr: usize) -> bool {
        self.start() <= addr && addr < self.end()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) } != 0 {
            warn!("cannot unmap stack: {}", nix::errno::Errno::last());
        }
    }
}

/// DEAD_STACKS is a free list of stacks that have
/// been released by threads that were joined.
///
/// If there is a stack available in DEAD_STACKS
/// when a new thread is created, it is used instead
/// of mapping a new stack.
///
static DEAD_STACKS: Mutex<Vec<Stack>> = Mutex::new(Vec::new());

/// Allocates a stack with `num_pages` usable pages
/// and a guard page.
///
pub fn new_stack(num_pages: usize) -> Result<Stack, Error> {
    // Check whether we can just recycle an old stack.
    // The lock is never held with preemption enabled,
    // or a thread preempted while holding it would
    // deadlock the next thread to take it.
    let recycled = without_preemption(|| {
        let mut stacks = DEAD_STACKS.lock();
        stacks
            .iter()
            .position(|s| s.num_pages() == num_pages)
            .map(|index| stacks.swap_remove(index))
    });

    match recycled {
        Some(stack) => Ok(stack),
        None => Stack::map(num_pages),
    }
}

/// Adds the given stack to the dead stacks list, so it
/// can be reused later.
///
pub fn free_stack(stack: Stack) {
    let unwanted = without_preemption(|| {
        let mut stacks = DEAD_STACKS.lock();
        if stacks.len() < MAX_DEAD_STACKS {
            stacks.push(stack);
            None
        } else {
            Some(stack)
        }
    });

    // Unmap it outside the lock.
    drop(unwanted);
}
