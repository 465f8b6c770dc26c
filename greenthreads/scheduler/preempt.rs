// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements timer-driven preemption of the running thread.
//!
//! While a [`Preemption`] is armed, a recurring `ITIMER_VIRTUAL`
//! timer raises `SIGVTALRM` each time the process has used another
//! quantum of CPU time. The signal handler calls
//! [`yield_now`](crate::yield_now), so a preempted thread is
//! treated exactly as if it had yielded.
//!
//! The scheduler protects its critical sections by blocking the
//! signal with [`disable`] and unblocking it with [`enable`]. These
//! do not nest: a single `enable` undoes any number of `disable`
//! calls. Use [`without_preemption`] to run a closure with preemption
//! disabled, restoring the previous state afterwards.
//!
//! The timer belongs to the OS thread whose scheduler armed it. On
//! any other OS thread, [`enable`] and [`disable`] do nothing and the
//! handler ignores any tick that lands there, so schedulers started
//! without preemption are never preempted.

use crate::error::Error;
use core::cell::Cell;
use core::mem;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{debug, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::time::Duration;

/// The signal raised by the virtual timer.
///
const TIMER_SIGNAL: Signal = Signal::SIGVTALRM;

/// Tracks whether the timer is armed. Signal
/// handlers and interval timers are shared by the
/// whole process, so at most one scheduler can use
/// preemption at a time.
///
static ARMED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// OWNS_TIMER is set on the OS thread that armed
    /// the timer, for as long as it is armed.
    ///
    static OWNS_TIMER: Cell<bool> = const { Cell::new(false) };
}

/// Returns whether the calling OS thread's scheduler
/// armed the timer.
///
fn owns_timer() -> bool {
    OWNS_TIMER.with(|owns| owns.get())
}

/// Records the calling OS thread as the owner of
/// the timer.
///
fn take_ownership() {
    OWNS_TIMER.with(|owns| owns.set(true));
}

/// Stops the calling OS thread handling ticks.
///
fn give_up_ownership() {
    OWNS_TIMER.with(|owns| owns.set(false));
}

/// Returns the set containing just the timer signal.
///
fn timer_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(TIMER_SIGNAL);
    set
}

/// Returns whether the timer signal is blocked on the
/// calling OS thread.
///
fn timer_blocked() -> bool {
    match SigSet::thread_get_mask() {
        Ok(mask) => mask.contains(TIMER_SIGNAL),
        Err(_) => true,
    }
}

/// Handles the timer signal by yielding the running
/// thread.
///
/// The kernel delivers the signal to whichever OS
/// thread used up the quantum. Ticks landing on any
/// thread but the owner are dropped.
///
extern "C" fn handle_tick(_signal: libc::c_int) {
    if owns_timer() {
        crate::scheduler::yield_now();
    }
}

/// Allows the timer to preempt the running thread.
///
/// `enable` does nothing unless this OS thread's
/// scheduler armed the timer.
///
pub fn enable() {
    if owns_timer() {
        let _ = timer_signals().thread_unblock();
    }
}

/// Prevents the timer from preempting the running
/// thread until [`enable`] is called.
///
/// `disable` does nothing unless this OS thread's
/// scheduler armed the timer.
///
pub fn disable() {
    if owns_timer() {
        let _ = timer_signals().thread_block();
    }
}

/// Returns whether the timer can currently preempt
/// the running thread on this OS thread.
///
pub fn is_enabled() -> bool {
    owns_timer() && !timer_blocked()
}

/// Returns whether a preemption timer is armed in
/// this process.
///
pub fn is_armed() -> bool {
    ARMED.load(Ordering::Acquire)
}

/// Runs `f` with preemption disabled, then
/// re-enables preemption if it was enabled before.
///
pub fn without_preemption<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let restart_preemption = is_enabled();
    disable();
    let ret = f();
    if restart_preemption {
        enable();
    }

    ret
}

/// Converts a duration to the timeval used by the
/// interval timer.
///
fn to_timeval(duration: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_usec: duration.subsec_micros() as libc::suseconds_t,
    }
}

/// An armed preemption timer.
///
/// Dropping the `Preemption` disarms the timer and
/// restores the signal handler, interval timer, and
/// signal mask that were in place when it was armed.
///
pub struct Preemption {
    previous_action: SigAction,
    previous_timer: libc::itimerval,
    previously_blocked: bool,
}

impl Preemption {
    /// Installs the timer signal handler and arms a
    /// timer that fires after every `quantum` of CPU
    /// time used by the process.
    ///
    /// Fails with [`Error::ResourceExhausted`] if another
    /// scheduler already owns the timer, or the handler
    /// or timer cannot be installed. On failure, nothing
    /// is changed.
    ///
    pub fn arm(quantum: Duration) -> Result<Self, Error> {
        if ARMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("preemption timer already armed by another scheduler");
            return Err(Error::ResourceExhausted);
        }

        // Keep the signal blocked until everything is
        // in place.
        let previously_blocked = timer_blocked();
        let signals = timer_signals();
        let _ = signals.thread_block();
        take_ownership();

        let action = SigAction::new(SigHandler::Handler(handle_tick), SaFlags::SA_RESTART, signals);
        let previous_action = match unsafe { sigaction(TIMER_SIGNAL, &action) } {
            Ok(previous) => previous,
            Err(err) => {
                warn!("cannot install preemption handler: {}", err);
                Self::release(previously_blocked);
                return Err(Error::ResourceExhausted);
            }
        };

        let interval = to_timeval(quantum);
        let timer = libc::itimerval {
            it_interval: interval,
            it_value: interval,
        };

        let mut previous_timer: libc::itimerval = unsafe { mem::zeroed() };
        if unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, &timer, &mut previous_timer) } != 0 {
            warn!("cannot arm preemption timer: {}", nix::errno::Errno::last());
            let _ = unsafe { sigaction(TIMER_SIGNAL, &previous_action) };
            Self::release(previously_blocked);
            return Err(Error::ResourceExhausted);
        }

        debug!("preemption armed with a {:?} quantum", quantum);
        let _ = signals.thread_unblock();

        Ok(Preemption {
            previous_action,
            previous_timer,
            previously_blocked,
        })
    }

    /// Marks the timer as free and puts the signal
    /// mask back how we found it.
    ///
    fn release(previously_blocked: bool) {
        give_up_ownership();
        ARMED.store(false, Ordering::Release);
        if !previously_blocked {
            let _ = timer_signals().thread_unblock();
        }
    }
}

impl Drop for Preemption {
    fn drop(&mut self) {
        let signals = timer_signals();
        let _ = signals.thread_block();

        let restored = unsafe {
            libc::setitimer(
                libc::ITIMER_VIRTUAL,
                &self.previous_timer,
                core::ptr::null_mut(),
            )
        };
        if restored != 0 {
            warn!("cannot restore interval timer: {}", nix::errno::Errno::last());
        }

        // Any tick still pending must reach our handler,
        // which ignores it once we are no longer the
        // owner, rather than the previous handler.
        give_up_ownership();
        let _ = signals.thread_unblock();
        let _ = signals.thread_block();

        if let Err(err) = unsafe { sigaction(TIMER_SIGNAL, &self.previous_action) } {
            warn!("cannot restore signal handler: {}", err);
        }

        Self::release(self.previously_blocked);
        debug!("preemption disarmed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeval_conversion() {
        let tv = to_timeval(Duration::from_millis(10));
        assert_eq!(tv.tv_sec, 0);
        assert_eq!(tv.tv_usec, 10_000);

        let tv = to_timeval(Duration::from_micros(2_500_001));
        assert_eq!(tv.tv_sec, 2);
        assert_eq!(tv.tv_usec, 500_001);
    }

    #[test]
    fn unarmed_mask_is_untouched() {
        // None of the unit tests arm the timer, so
        // these must leave the signal mask alone.
        assert!(!is_armed());
        let before = timer_blocked();
        disable();
        assert_eq!(timer_blocked(), before);
        enable();
        assert_eq!(timer_blocked(), before);
        assert!(!is_enabled());
        assert_eq!(without_preemption(|| 7), 7);
    }
}
