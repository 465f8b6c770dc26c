// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains the thread control block for each green thread.
//!
//! Each thread's control block records everything the scheduler
//! needs to suspend and resume it: its saved stack pointer, the
//! stack it owns, and the bookkeeping used to join it once it has
//! exited. Threads are identified by a [`ThreadId`], allocated in
//! increasing order from zero, which is the initial thread that
//! called [`start`](crate::start).
//!
//! Calling [`debug`](crate::debug) will log the stack usage of
//! each suspended thread.

pub mod stacks;

use crate::switch::start_thread;
use crate::thread::stacks::{free_stack, Stack};
use core::cell::UnsafeCell;
use core::fmt;
use log::debug;

/// The value a thread passes to [`exit`](crate::exit),
/// or returns from its entry point.
///
pub type ExitValue = i32;

/// The code run by a new thread.
///
pub(crate) type Entry = Box<dyn FnOnce() -> ExitValue + 'static>;

/// DEFAULT_MXCSR is the power-on value of the MXCSR
/// register, with all SSE exceptions masked and
/// round-to-nearest.
///
const DEFAULT_MXCSR: u64 = 0x1f80;

/// DEFAULT_FPU_CONTROL is the x87 control word set by
/// FNINIT, with all exceptions masked and extended
/// precision.
///
const DEFAULT_FPU_CONTROL: u64 = 0x037f;

/// Uniquely identifies a thread within its scheduler.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// MAIN is the thread id of the initial thread, which
    /// called [`start`](crate::start). It can never be
    /// joined.
    ///
    pub const MAIN: Self = ThreadId(0);

    /// Returns the thread id with the given numerical
    /// value. The thread need not exist.
    ///
    pub const fn from_u64(id: u64) -> Self {
        ThreadId(id)
    }

    /// Returns a numerical representation for the thread
    /// ID.
    ///
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Describes where the scheduler is holding a thread.
///
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    /// The thread is executing.
    Running,

    /// The thread is in the ready queue, waiting
    /// for its turn.
    Ready,

    /// The thread is waiting in the blocked queue
    /// for another thread to exit.
    Blocked,

    /// The thread has exited and is waiting in the
    /// zombie queue to be joined.
    Zombie,
}

/// Contains the metadata for a thread of
/// execution.
///
pub(crate) struct Thread {
    // This thread's unique id.
    id: ThreadId,

    // Where the scheduler is holding the thread.
    state: ThreadState,

    // The thread's stack. The initial thread uses
    // the stack it was started on, so has none.
    stack: Option<Stack>,

    // The thread's saved stack pointer. While the
    // thread is executing, this value will be stale.
    // When the thread is switched out, its final stack
    // pointer is written to this cell. When the thread
    // is resumed, its stack pointer is restored from
    // this value.
    stack_pointer: UnsafeCell<u64>,

    // The code the thread will run. This is taken
    // when the thread first starts.
    entry: Option<Entry>,

    // The thread blocked waiting to join this one.
    joiner: Option<ThreadId>,

    // The thread this one is blocked waiting to join.
    waiting_on: Option<ThreadId>,

    // The value passed to exit.
    exit_value: Option<ExitValue>,
}

/// push_stack is used to build a new thread's stack
/// without having to drop down to assembly. This is
/// done by dynamically populating the stack, value
/// by value. These are then popped off in switch_stack
/// when switching to the new thread for the first
/// time.
///
unsafe fn push_stack(mut rsp: *mut u64, value: u64) -> *mut u64 {
    // We move the stack pointer down by 8 bytes, write
    // the value to the new space, then return the updated
    // stack pointer.
    rsp = rsp.sub(1);
    rsp.write(value);
    rsp
}

impl Thread {
    /// Creates the thread control block for the thread
    /// that starts the scheduler.
    ///
    pub(crate) fn new_main_thread() -> Box<Thread> {
        // The initial stack pointer is 0, as the main
        // thread keeps the stack it already has.
        //
        // When we call switch for the first time, the
        // current stack pointer is written into the
        // main thread. The 0 we set here is never read.
        Box::new(Thread {
            id: ThreadId::MAIN,
            state: ThreadState::Running,
            stack: None,
            stack_pointer: UnsafeCell::new(0),
            entry: None,
            joiner: None,
            waiting_on: None,
            exit_value: None,
        })
    }

    /// Creates a new thread on the given stack, ready
    /// to start running `entry` the first time it is
    /// switched to.
    ///
    pub(crate) fn new(id: ThreadId, stack: Stack, entry: Entry) -> Box<Thread> {
        let rsp = unsafe {
            // The end of the stack is page-aligned.
            let mut rsp = stack.end() as *mut u64;

            // Two empty slots leave the stack 16-byte
            // aligned once switch_stack has returned
            // into start_thread.
            rsp = push_stack(rsp, 0);
            rsp = push_stack(rsp, 0);

            // Push start_thread and the initial registers
            // to be loaded by switch_stack.
            rsp = push_stack(rsp, start_thread as usize as u64); // RIP.
            rsp = push_stack(rsp, 0); // Initial RBP.
            rsp = push_stack(rsp, 0); // Initial RBX.
            rsp = push_stack(rsp, 0); // Initial R12.
            rsp = push_stack(rsp, 0); // Initial R13.
            rsp = push_stack(rsp, 0); // Initial R14.
            rsp = push_stack(rsp, 0); // Initial R15.
            rsp = push_stack(rsp, (DEFAULT_FPU_CONTROL << 32) | DEFAULT_MXCSR);

            rsp
        };

        Box::new(Thread {
            id,
            state: ThreadState::Ready,
            stack: Some(stack),
            stack_pointer: UnsafeCell::new(rsp as u64),
            entry: Some(entry),
            joiner: None,
            waiting_on: None,
            exit_value: None,
        })
    }

    /// Returns where the scheduler is holding the
    /// thread.
    ///
    pub(crate) fn state(&self) -> ThreadState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    /// Returns a pointer to the thread's saved stack
    /// pointer, for use with switch_stack.
    ///
    pub(crate) fn stack_pointer(&self) -> *mut u64 {
        self.stack_pointer.get()
    }

    /// Removes the thread's entry point, which is only
    /// present before the thread first runs.
    ///
    pub(crate) fn take_entry(&mut self) -> Option<Entry> {
        self.entry.take()
    }

    /// Returns the thread waiting to join this one,
    /// if any.
    ///
    pub(crate) fn joiner(&self) -> Option<ThreadId> {
        self.joiner
    }

    pub(crate) fn set_joiner(&mut self, joiner: ThreadId) {
        self.joiner = Some(joiner);
    }

    /// Returns the thread this one is waiting to join,
    /// if any.
    ///
    pub(crate) fn waiting_on(&self) -> Option<ThreadId> {
        self.waiting_on
    }

    pub(crate) fn set_waiting_on(&mut self, target: Option<ThreadId>) {
        self.waiting_on = target;
    }

    /// Returns the value the thread exited with, or
    /// `None` if it has not exited.
    ///
    pub(crate) fn exit_value(&self) -> Option<ExitValue> {
        self.exit_value
    }

    pub(crate) fn set_exit_value(&mut self, value: ExitValue) {
        self.exit_value = Some(value);
    }

    /// Logs debug information about the thread.
    ///
    /// The stack usage is only meaningful for
    /// suspended threads, as the saved stack pointer
    /// of the running thread is out of date.
    ///
    pub(crate) fn debug(&self) {
        let stack = match &self.stack {
            Some(stack) => stack,
            None => {
                debug!("thread {} ({:?}) has no stack", self.id, self.state);
                return;
            }
        };

        let stack_pointer = unsafe { *self.stack_pointer.get() } as usize;
        if !stack.contains(stack_pointer) {
            debug!(
                "thread {} ({:?}): saved stack pointer {:#x} is not in stack bounds {:#x}-{:#x}",
                self.id,
                self.state,
                stack_pointer,
                stack.start(),
                stack.end()
            );
            return;
        }

        // Do the calculations, remembering that the stack grows
        // downwards, so some of these look the wrong way around.
        let total_stack = stack.end() - stack.start();
        let used_stack = stack.end() - stack_pointer;
        let free_stack = stack_pointer - stack.start();
        let percent = (100 * used_stack) / total_stack;
        debug!(
            "thread {} ({:?}): {} bytes ({}%) of stack used, {} / {} bytes remaining.",
            self.id, self.state, used_stack, percent, free_stack, total_stack
        );
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("joiner", &self.joiner)
            .field("waiting_on", &self.waiting_on)
            .field("exit_value", &self.exit_value)
            .finish()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Return our stack to the dead stacks list.
        if let Some(stack) = self.stack.take() {
            free_stack(stack);
        }
    }
}
