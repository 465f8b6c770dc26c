// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a simple round robin scheduler for threads.
//!
//! ## Initialisation
//!
//! No threads can be created until [`start`] has turned the calling
//! OS thread into the initial green thread, [`ThreadId::MAIN`]. Once
//! every other thread has exited and been joined, [`stop`] releases
//! the scheduler again.
//!
//! ## Thread switching
//!
//! [`yield_now`] can be called to proactively switch to the next
//! ready thread. If preemption is enabled, a timer calls it on the
//! running thread's behalf once each quantum. [`exit`] and [`join`]
//! also switch threads, as the calling thread can no longer run.
//!
//! ## Queues
//!
//! Every thread other than the running thread is held in exactly one
//! of three queues: ready threads waiting for their turn, blocked
//! threads waiting to join a thread that has not exited, and zombie
//! threads that have exited but not yet been joined. The queues are
//! only modified with preemption disabled.
//!
//! A thread that is never joined stays a zombie, keeping its stack,
//! and prevents [`stop`] from succeeding.

pub mod preempt;

use crate::config::Config;
use crate::error::Error;
use crate::queue::Queue;
use crate::switch::switch_stack;
use crate::thread::stacks::{free_stack, new_stack, Stack};
use crate::thread::{Entry, ExitValue, Thread, ThreadId, ThreadState};
use crate::{with_scheduler, SCHEDULER};
use log::{debug, error, trace, warn};
use preempt::Preemption;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::ptr;

/// Scheduler is a basic thread scheduler.
///
/// Currently, it implements a round-robin algorithm.
///
pub(crate) struct Scheduler {
    // Every live thread, including the running
    // thread. Each thread is boxed so that its saved
    // stack pointer stays put while the table changes.
    threads: BTreeMap<ThreadId, Box<Thread>>,

    ready: Queue<ThreadId>,
    blocked: Queue<ThreadId>,
    zombie: Queue<ThreadId>,

    // The running thread.
    current: ThreadId,

    // The id the next new thread will receive.
    next_id: u64,

    config: Config,

    // Held only so that dropping the scheduler
    // disarms the timer.
    _preemption: Option<Preemption>,
}

/// Describes the outcome of the first half of a join.
///
enum JoinStep {
    // The target had already exited.
    Reaped(ExitValue),

    // The caller must switch to the next thread
    // and wait for the target to exit.
    Blocked {
        current: *mut u64,
        next: *const u64,
    },
}

impl Scheduler {
    fn new(config: Config, preemption: Option<Preemption>) -> Scheduler {
        let mut threads = BTreeMap::new();
        threads.insert(ThreadId::MAIN, Thread::new_main_thread());

        Scheduler {
            threads,
            ready: Queue::new(),
            blocked: Queue::new(),
            zombie: Queue::new(),
            current: ThreadId::MAIN,
            next_id: ThreadId::MAIN.as_u64() + 1,
            config,
            _preemption: preemption,
        }
    }

    fn thread(&self, id: ThreadId) -> &Thread {
        match self.threads.get(&id) {
            Some(thread) => thread,
            None => panic!("thread {} is missing from the thread table", id),
        }
    }

    fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        match self.threads.get_mut(&id) {
            Some(thread) => thread,
            None => panic!("thread {} is missing from the thread table", id),
        }
    }

    /// Returns whether only the running thread
    /// remains.
    ///
    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.blocked.is_empty() && self.zombie.is_empty()
    }

    /// Makes `next` the running thread, returning the
    /// saved stack pointers to switch between.
    ///
    fn switch_to(&mut self, next: ThreadId) -> (*mut u64, *const u64) {
        let current = self.current;
        self.current = next;
        self.thread_mut(next).set_state(ThreadState::Running);
        self.check_consistency();

        (
            self.thread(current).stack_pointer(),
            self.thread(next).stack_pointer(),
        )
    }

    /// Adds a new thread to the ready queue.
    ///
    /// If the thread cannot be created, its stack is
    /// released and the scheduler is left unchanged.
    ///
    fn spawn(&mut self, stack: Stack, entry: Entry) -> Result<ThreadId, Error> {
        if self.next_id > self.config.max_thread_id {
            free_stack(stack);
            warn!(
                "cannot create thread: thread ids exhausted after {}",
                self.config.max_thread_id
            );
            return Err(Error::ResourceExhausted);
        }

        let id = ThreadId::from_u64(self.next_id);
        self.next_id += 1;
        self.threads.insert(id, Thread::new(id, stack, entry));
        self.ready.enqueue(id);
        self.check_consistency();

        debug!("thread {} created by thread {}", id, self.current);
        Ok(id)
    }

    /// Moves the running thread to the back of the
    /// ready queue and the front thread to running.
    ///
    /// Returns `None` if no other thread is ready.
    ///
    /// This is called from the timer signal handler,
    /// so it must not allocate or log.
    ///
    fn rotate(&mut self) -> Option<(*mut u64, *const u64)> {
        // Dequeue first, so the ready queue
        // never grows here.
        let next = self.ready.dequeue()?;
        let current = self.current;
        self.thread_mut(current).set_state(ThreadState::Ready);
        self.ready.enqueue(current);

        Some(self.switch_to(next))
    }

    /// Turns the running thread into a zombie, wakes
    /// any thread waiting to join it, and chooses the
    /// next thread to run.
    ///
    fn retire(&mut self, value: ExitValue) -> (*mut u64, *const u64) {
        let id = self.current;
        if id == ThreadId::MAIN {
            panic!("initial thread tried to exit");
        }

        let thread = self.thread_mut(id);
        thread.set_exit_value(value);
        thread.set_state(ThreadState::Zombie);
        let joiner = thread.joiner();
        self.zombie.enqueue(id);

        if let Some(joiner) = joiner {
            if self.blocked.delete(&joiner) {
                let waiter = self.thread_mut(joiner);
                waiter.set_waiting_on(None);
                waiter.set_state(ThreadState::Ready);
                self.ready.enqueue(joiner);
            }
        }

        debug!("thread {} exited with value {}", id, value);
        let next = match self.ready.dequeue() {
            Some(next) => next,
            None => panic!("thread {} exited with every other thread blocked", id),
        };

        trace!("switching from exited thread {} to thread {}", id, next);
        self.switch_to(next)
    }

    /// Starts joining `target`, reaping it straight
    /// away if it has already exited, or blocking the
    /// running thread until it does.
    ///
    fn begin_join(&mut self, target: ThreadId) -> Result<JoinStep, Error> {
        let caller = self.current;
        if target == ThreadId::MAIN || target == caller {
            return Err(Error::InvalidTarget);
        }

        let thread = match self.threads.get(&target) {
            Some(thread) => thread,
            // Ids are never reused, so a missing id
            // below next_id has been joined already.
            None if target.as_u64() < self.next_id => return Err(Error::AlreadyJoined),
            None => return Err(Error::InvalidTarget),
        };

        if thread.joiner().is_some() {
            return Err(Error::AlreadyJoined);
        }

        if thread.state() == ThreadState::Zombie {
            return Ok(JoinStep::Reaped(self.reap(target)));
        }

        // Follow the chain of joins from the target. If
        // it leads back to us, we would wait forever.
        let mut waiting_on = thread.waiting_on();
        while let Some(id) = waiting_on {
            if id == caller {
                warn!(
                    "thread {} cannot join thread {}: it would deadlock",
                    caller, target
                );
                return Err(Error::Deadlock);
            }

            waiting_on = self.thread(id).waiting_on();
        }

        // Wait for the target to exit.
        self.thread_mut(target).set_joiner(caller);
        let me = self.thread_mut(caller);
        me.set_waiting_on(Some(target));
        me.set_state(ThreadState::Blocked);
        self.blocked.enqueue(caller);

        // The chain of joins from the target ends
        // at a thread that can run, so one is ready.
        let next = match self.ready.dequeue() {
            Some(next) => next,
            None => panic!(
                "thread {} blocked joining thread {} with no thread ready",
                caller, target
            ),
        };

        trace!("thread {} blocked joining thread {}", caller, target);
        let (current, next) = self.switch_to(next);
        Ok(JoinStep::Blocked { current, next })
    }

    /// Destroys the zombie thread `target`, returning
    /// its exit value.
    ///
    fn reap(&mut self, target: ThreadId) -> ExitValue {
        if !self.zombie.delete(&target) {
            panic!("thread {} reaped before exiting", target);
        }

        let thread = match self.threads.remove(&target) {
            Some(thread) => thread,
            None => panic!("thread {} is missing from the thread table", target),
        };

        let value = match thread.exit_value() {
            Some(value) => value,
            None => panic!("zombie thread {} has no exit value", target),
        };

        // Dropping the thread releases its stack.
        drop(thread);
        self.check_consistency();

        debug!(
            "thread {} joined thread {}, exit value {}",
            self.current, target, value
        );
        value
    }

    /// Checks that every thread is held in exactly
    /// the place its state says.
    ///
    /// This does nothing in release builds. It must
    /// not allocate, as it may be called from the
    /// timer signal handler.
    ///
    fn check_consistency(&self) {
        if !cfg!(debug_assertions) {
            return;
        }

        let queued = self.ready.len() + self.blocked.len() + self.zombie.len();
        assert_eq!(queued + 1, self.threads.len(), "thread table out of sync");
        for (id, thread) in self.threads.iter() {
            let held = [
                (*id == self.current) as usize,
                self.ready.iter().filter(|x| *x == id).count(),
                self.blocked.iter().filter(|x| *x == id).count(),
                self.zombie.iter().filter(|x| *x == id).count(),
            ];

            let expected = match thread.state() {
                ThreadState::Running => [1, 0, 0, 0],
                ThreadState::Ready => [0, 1, 0, 0],
                ThreadState::Blocked => [0, 0, 1, 0],
                ThreadState::Zombie => [0, 0, 0, 1],
            };

            assert_eq!(held, expected, "thread {} misplaced", id);
        }
    }

    /// Logs the contents of each queue and the state
    /// of each thread.
    ///
    fn debug(&self) {
        let queue = |q: &Queue<ThreadId>| q.iter().map(|id| id.as_u64()).collect::<Vec<_>>();
        debug!(
            "thread {} running; ready: {:?}; blocked: {:?}; zombie: {:?}",
            self.current,
            queue(&self.ready),
            queue(&self.blocked),
            queue(&self.zombie)
        );

        for thread in self.threads.values() {
            thread.debug();
        }
    }
}

/// Starts the scheduler on the calling OS thread,
/// which becomes the thread [`ThreadId::MAIN`].
///
/// If `preempt` is set, running threads are made to
/// yield once every [`DEFAULT_QUANTUM`](crate::config::DEFAULT_QUANTUM)
/// of CPU time.
///
pub fn start(preempt: bool) -> Result<(), Error> {
    start_with(Config::default().with_preemption(preempt))
}

/// Starts the scheduler on the calling OS thread
/// with the given configuration.
///
/// If `start_with` fails, nothing is left behind.
///
pub fn start_with(config: Config) -> Result<(), Error> {
    if is_started() {
        return Err(Error::AlreadyStarted);
    }

    let preemption = if config.preempt {
        Some(Preemption::arm(config.quantum)?)
    } else {
        None
    };

    let scheduler = Box::new(Scheduler::new(config, preemption));
    SCHEDULER.with(|slot| slot.set(Box::into_raw(scheduler)));
    debug!("scheduler started: {:?}", config);

    Ok(())
}

/// Releases the scheduler on the calling OS thread,
/// disarming preemption.
///
/// `stop` fails with [`Error::ThreadsOutstanding`] if
/// any thread other than the caller has not yet both
/// exited and been joined.
///
pub fn stop() -> Result<(), Error> {
    let scheduler = preempt::without_preemption(|| {
        let scheduler = SCHEDULER.with(|slot| slot.get());
        if scheduler.is_null() {
            return Err(Error::NotInitialized);
        }

        // Safety: the pointer was created by start_with
        // and preemption is disabled, so nothing else is
        // using it.
        if !unsafe { &*scheduler }.is_idle() {
            return Err(Error::ThreadsOutstanding);
        }

        SCHEDULER.with(|slot| slot.set(ptr::null_mut()));
        Ok(unsafe { Box::from_raw(scheduler) })
    });

    let scheduler = match scheduler {
        Ok(scheduler) => scheduler,
        Err(err) => {
            warn!("cannot stop scheduler: {}", err);
            return Err(err);
        }
    };

    debug!(
        "scheduler stopped after creating {} threads",
        scheduler.next_id - 1
    );

    // Dropping the scheduler disarms the timer.
    drop(scheduler);

    Ok(())
}

/// Returns whether a scheduler is running on the
/// calling OS thread.
///
pub fn is_started() -> bool {
    !SCHEDULER.with(|slot| slot.get()).is_null()
}

/// Creates a new thread that will run `entry`, adding
/// it to the back of the ready queue.
///
/// The thread exits with the value `entry` returns,
/// unless it calls [`exit`] first.
///
pub fn create<F>(entry: F) -> Result<ThreadId, Error>
where
    F: FnOnce() -> ExitValue + 'static,
{
    let stack_pages = with_scheduler(|scheduler| scheduler.config.stack_pages)?;
    let stack = new_stack(stack_pages)?;

    // Box the entry with preemption disabled, so we
    // are never preempted inside the allocator.
    with_scheduler(move |scheduler| scheduler.spawn(stack, Box::new(entry)))?
}

/// Schedules out the current thread and switches to the next
/// ready thread.
///
/// If no other threads are ready to run, or no scheduler
/// is running on this OS thread, `yield_now` returns
/// immediately.
///
pub fn yield_now() {
    preempt::disable();
    if let Ok(Some((current, next))) = with_scheduler(Scheduler::rotate) {
        unsafe { switch_stack(current, next) };
    }

    // We may be re-enabling preemption on behalf of a
    // different call than the one that disabled it.
    preempt::enable();
}

/// Returns the thread id of the current thread.
///
pub fn self_id() -> Result<ThreadId, Error> {
    with_scheduler(|scheduler| scheduler.current)
}

/// Returns the number of threads that have been
/// created and not yet joined, including the initial
/// thread.
///
pub fn thread_count() -> Result<usize, Error> {
    with_scheduler(|scheduler| scheduler.threads.len())
}

/// Logs the state of every thread.
///
pub fn debug() -> Result<(), Error> {
    with_scheduler(|scheduler| scheduler.debug())
}

/// Terminates the current thread with the given exit
/// value and switches to the next ready thread.
///
/// The thread's stack is released once another thread
/// joins it.
///
/// # Panics
///
/// `exit` will panic if called by the initial thread,
/// which can never be joined, or if called before
/// [`start`].
///
pub fn exit(value: ExitValue) -> ! {
    preempt::disable();
    let (current, next) = match with_scheduler(|scheduler| scheduler.retire(value)) {
        Ok(switch) => switch,
        Err(err) => panic!("cannot exit thread: {}", err),
    };

    unsafe { switch_stack(current, next) };
    unreachable!("exited thread was re-scheduled somehow");
}

/// Waits for the thread `target` to exit, then
/// releases it and returns its exit value.
///
/// If the target has already exited, `join` returns
/// straight away.
///
pub fn join(target: ThreadId) -> Result<ExitValue, Error> {
    preempt::disable();
    let result = match with_scheduler(|scheduler| scheduler.begin_join(target)) {
        Ok(Ok(JoinStep::Reaped(value))) => Ok(value),
        Ok(Ok(JoinStep::Blocked { current, next })) => {
            unsafe { switch_stack(current, next) };

            // The target has exited and woken us.
            with_scheduler(|scheduler| scheduler.reap(target))
        }
        Ok(Err(err)) | Err(err) => Err(err),
    };

    preempt::enable();
    result
}

/// Runs a new thread's entry point, then exits with
/// its return value.
///
/// This is called by `start_thread` the first time
/// a thread is switched to.
///
pub(crate) extern "sysv64" fn thread_entry() -> ! {
    // We arrive here from a switch made with
    // preemption disabled.
    preempt::enable();

    let (id, entry) = match with_scheduler(|scheduler| {
        let id = scheduler.current;
        (id, scheduler.thread_mut(id).take_entry())
    }) {
        Ok((id, Some(entry))) => (id, entry),
        Ok((id, None)) => panic!("thread {} started twice", id),
        Err(err) => panic!("thread started without a scheduler: {}", err),
    };

    trace!("thread {} starting", id);

    // Unwinding cannot cross into start_thread.
    let value = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(value) => value,
        Err(_) => {
            error!("thread {} panicked", id);
            process::abort();
        }
    };

    exit(value)
}
