// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the errors returned by scheduler operations.

use core::fmt;

/// The set of errors that can occur when managing
/// green threads.
///
/// Every error is reported synchronously by the
/// failing call. The scheduler never retries an
/// operation on the caller's behalf.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The calling OS thread has no scheduler, either
    /// because [`start`](crate::start) has not been
    /// called or because [`stop`](crate::stop) has
    /// since released it.
    NotInitialized,

    /// [`start`](crate::start) was called while a
    /// scheduler was already running on this OS thread.
    AlreadyStarted,

    /// A stack could not be allocated, the thread id
    /// space is exhausted, or the preemption timer
    /// could not be armed.
    ResourceExhausted,

    /// The join target is the initial thread, the
    /// calling thread, or has never existed.
    InvalidTarget,

    /// The join target has already been claimed by
    /// another joiner, or has been joined and destroyed.
    AlreadyJoined,

    /// Joining the target would leave a set of threads
    /// each waiting for another to exit.
    Deadlock,

    /// [`stop`](crate::stop) was called while other
    /// threads were still ready, blocked, or waiting
    /// to be joined.
    ThreadsOutstanding,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotInitialized => write!(f, "scheduler not started on this thread"),
            Error::AlreadyStarted => write!(f, "scheduler already started on this thread"),
            Error::ResourceExhausted => write!(f, "thread resources exhausted"),
            Error::InvalidTarget => write!(f, "invalid join target"),
            Error::AlreadyJoined => write!(f, "thread already joined"),
            Error::Deadlock => write!(f, "join would deadlock"),
            Error::ThreadsOutstanding => write!(f, "threads still outstanding"),
        }
    }
}

impl std::error::Error for Error {}
