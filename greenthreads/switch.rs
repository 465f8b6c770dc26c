// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! switch contains the functionality to switch between threads.
//!
//! A suspended thread is represented entirely by its saved stack
//! pointer. The top of a suspended thread's stack holds its x87
//! control word and MXCSR, then the callee-saved registers R15,
//! R14, R13, R12, RBX and RBP, then the address to return to.
//! [`Thread::new`](crate::thread::Thread) builds the same layout
//! by hand for a thread that has never run, returning into
//! `start_thread`.

use core::arch::global_asm;

global_asm!(
    ".p2align 4",
    ".global greenthreads_switch_stack",
    "greenthreads_switch_stack:",
    // Save the current thread's state on its stack.
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "sub rsp, 8",
    "stmxcsr dword ptr [rsp]",
    "fnstcw word ptr [rsp + 4]",
    // Swap stacks.
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    // Restore the next thread's state from its stack.
    "ldmxcsr dword ptr [rsp]",
    "fldcw word ptr [rsp + 4]",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    "",
    ".p2align 4",
    ".global greenthreads_start_thread",
    "greenthreads_start_thread:",
    // The stack is 16-byte aligned here, so the
    // call leaves the entry point correctly aligned.
    "call {entry}",
    "ud2",
    entry = sym crate::scheduler::thread_entry,
);

// The following functions are implemented in the
// assembly above.
//
extern "sysv64" {
    /// switch_stack replaces the current stack with a new
    /// stack, using the System V ABI. Its last action is
    /// to start executing the new thread.
    ///
    /// switch_stack takes a pointer to each thread's saved
    /// stack pointer. The current thread's stack pointer
    /// is written through `current_stack_pointer`; it
    /// returns when another thread switches back to it.
    ///
    #[link_name = "greenthreads_switch_stack"]
    pub fn switch_stack(current_stack_pointer: *mut u64, new_stack_pointer: *const u64);

    /// start_thread should be used to start a new thread
    /// by placing its address into the new thread's stack
    /// before calling switch_stack.
    ///
    /// start_thread calls the scheduler's thread entry,
    /// which never returns.
    ///
    #[link_name = "greenthreads_start_thread"]
    pub fn start_thread() -> !;
}
