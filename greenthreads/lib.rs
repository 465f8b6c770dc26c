// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements user-level threads, multiplexed onto a single OS thread.
//!
//! Calling [`start`] turns the calling OS thread into the initial green
//! thread ([`ThreadId::MAIN`]) and gives it a scheduler. Further threads
//! are created with [`create`], each with its own stack, and run in turn
//! whenever the running thread calls [`yield_now`], [`join`], or [`exit`].
//! With preemption enabled, a CPU-time timer also forces the running
//! thread to yield once per quantum, so a busy thread cannot starve the
//! others.
//!
//! ```
//! greenthreads::start(false).unwrap();
//!
//! let id = greenthreads::create(|| {
//!     greenthreads::yield_now();
//!     42
//! })
//! .unwrap();
//!
//! assert_eq!(greenthreads::join(id), Ok(42));
//! greenthreads::stop().unwrap();
//! ```
//!
//! ## Shared state
//!
//! Each OS thread can run its own scheduler. The scheduler is stored in
//! a thread-local slot in the crate root, so that it can be reached from
//! the timer signal handler and from newly started threads. The slot is
//! only dereferenced with preemption disabled, via `with_scheduler`.
//!
//! ## Caveats
//!
//! A preempted thread may be suspended at any instruction. Code that
//! holds a standard library lock, or is inside the memory allocator,
//! when it is preempted can deadlock the next thread that needs the same
//! resource. Code that runs with preemption enabled should avoid sharing
//! such resources, or wrap its use of them in [`without_preemption`].
//!
//! Only one scheduler in the process can use preemption at a time, as
//! signal handlers and interval timers belong to the whole process.
//! Schedulers on other OS threads stay cooperative while it runs.

#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![allow(unsafe_code)]

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("greenthreads only supports x86_64 Linux");

mod config;
mod error;
pub mod queue;
pub mod scheduler;
mod switch;
pub mod thread;

pub use crate::config::{Config, DEFAULT_MAX_THREAD_ID, DEFAULT_QUANTUM, DEFAULT_STACK_PAGES};
pub use crate::error::Error;
pub use crate::scheduler::preempt::without_preemption;
pub use crate::scheduler::{
    create, debug, exit, is_started, join, self_id, start, start_with, stop, thread_count,
    yield_now,
};
pub use crate::thread::{ExitValue, ThreadId, ThreadState};

use crate::scheduler::preempt;
use crate::scheduler::Scheduler;
use core::cell::Cell;
use core::ptr;

// State shared throughout the crate.

thread_local! {
    /// SCHEDULER is the scheduler running on this OS
    /// thread, or null.
    ///
    /// It is set by [`start`] and cleared by [`stop`].
    ///
    static SCHEDULER: Cell<*mut Scheduler> = const { Cell::new(ptr::null_mut()) };
}

/// Provides access to the scheduler running on this
/// OS thread, with preemption disabled.
///
/// The reference must not be held across a thread
/// switch, so `f` returns whatever it needs to make
/// the switch, such as saved stack pointers.
///
fn with_scheduler<F, R>(f: F) -> Result<R, Error>
where
    F: FnOnce(&mut Scheduler) -> R,
{
    preempt::without_preemption(|| {
        let scheduler = SCHEDULER.with(|slot| slot.get());
        if scheduler.is_null() {
            return Err(Error::NotInitialized);
        }

        // Safety: the pointer was created by start_with
        // and is only released by stop, both on this OS
        // thread. Preemption is disabled, so the timer
        // handler cannot create a second reference.
        Ok(f(unsafe { &mut *scheduler }))
    })
}
