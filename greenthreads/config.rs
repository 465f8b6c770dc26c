// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains the settings used when starting a scheduler.
//!
//! The defaults match the values most programs want: cooperative
//! scheduling only, a 10 ms quantum if preemption is turned on,
//! 512 KiB stacks, and up to 65535 threads over the life of the
//! scheduler.
//!
//! ```
//! use greenthreads::Config;
//! use std::time::Duration;
//!
//! let config = Config::default()
//!     .with_preemption(true)
//!     .with_quantum(Duration::from_millis(5));
//!
//! assert!(config.preempt);
//! ```

use std::time::Duration;

/// The interval between preemption opportunities.
///
pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(10);

/// The number of pages in each thread stack.
///
/// This does not include the extra page for the stack
/// guard.
///
pub const DEFAULT_STACK_PAGES: usize = 128; // 128 4-KiB pages = 512 KiB.

/// The largest thread id that will be handed out.
///
/// Thread ids are never reused within the lifetime of
/// a scheduler, so this also bounds the total number
/// of threads that can be created.
///
pub const DEFAULT_MAX_THREAD_ID: u64 = u16::MAX as u64;

/// Describes how a scheduler should behave.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Whether a recurring timer should force the
    /// running thread to yield.
    pub preempt: bool,

    /// The CPU time between forced yields. Ignored
    /// unless `preempt` is set.
    pub quantum: Duration,

    /// The number of 4 KiB pages in each new thread's
    /// stack.
    pub stack_pages: usize,

    /// The largest thread id the scheduler may assign.
    pub max_thread_id: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            preempt: false,
            quantum: DEFAULT_QUANTUM,
            stack_pages: DEFAULT_STACK_PAGES,
            max_thread_id: DEFAULT_MAX_THREAD_ID,
        }
    }
}

impl Config {
    /// Returns the config with preemption turned
    /// on or off.
    ///
    #[must_use]
    pub fn with_preemption(mut self, preempt: bool) -> Self {
        self.preempt = preempt;
        self
    }

    /// Returns the config with the given preemption
    /// quantum.
    ///
    /// A zero quantum would disarm the timer, so it
    /// is rounded up to one microsecond.
    ///
    #[must_use]
    pub fn with_quantum(mut self, quantum: Duration) -> Self {
        self.quantum = quantum.max(Duration::from_micros(1));
        self
    }

    /// Returns the config with the given stack size,
    /// in pages. At least one page is always used.
    ///
    #[must_use]
    pub fn with_stack_pages(mut self, pages: usize) -> Self {
        self.stack_pages = pages.max(1);
        self
    }

    /// Returns the config with the given thread id
    /// limit.
    ///
    #[must_use]
    pub fn with_max_thread_id(mut self, max: u64) -> Self {
        self.max_thread_id = max;
        self
    }
}
