// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

// The preemption timer signals the whole process, so
// these tests run on the main OS thread one at a time,
// without the standard test harness.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use greenthreads::scheduler::preempt;
use greenthreads::{create, join, self_id, start, start_with, stop, yield_now, Config, Error};
use nix::sys::signal::{SigSet, Signal};
use std::process;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// How long the tests may take before we assume a
/// thread has been starved.
///
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);

static TEST_CASES: &[(&str, fn())] = &[
    ("spinning_thread_is_preempted", spinning_thread_is_preempted),
    ("spinners_share_the_cpu", spinners_share_the_cpu),
    ("short_quantum", short_quantum),
    ("restart_after_stop", restart_after_stop),
    ("one_timer_per_process", one_timer_per_process),
    ("cooperative_scheduler_beside_timer", cooperative_scheduler_beside_timer),
    ("join_tree_under_preemption", join_tree_under_preemption),
];

fn main() {
    start_watchdog();

    println!("running {} tests", TEST_CASES.len());
    for (name, test) in TEST_CASES.iter() {
        print!("test {} ... ", name);
        test();
        println!("ok");
    }

    println!("test result: ok. {} passed", TEST_CASES.len());
}

/// Aborts the process if the tests hang.
///
fn start_watchdog() {
    let (ready, wait) = mpsc::channel();
    thread::spawn(move || {
        // Leave the timer signal to the main thread.
        let mut set = SigSet::empty();
        set.add(Signal::SIGVTALRM);
        let _ = set.thread_block();

        let _ = ready.send(());
        thread::sleep(WATCHDOG_TIMEOUT);
        eprintln!("preemption tests timed out");
        process::abort();
    });

    wait.recv().unwrap();
}

static SPINNER_DONE: AtomicBool = AtomicBool::new(false);
static SPINS: AtomicU64 = AtomicU64::new(0);

fn spinning_thread_is_preempted() {
    start(true).unwrap();
    assert!(preempt::is_armed());
    assert!(preempt::is_enabled());

    // The spinner never yields, so we only get to run
    // again if the timer preempts it.
    let spinner = create(|| {
        while !SPINNER_DONE.load(Ordering::Acquire) {
            SPINS.fetch_add(1, Ordering::Relaxed);
            spin_loop();
        }

        1
    })
    .unwrap();

    while SPINS.load(Ordering::Relaxed) == 0 {
        yield_now();
    }

    assert_eq!(self_id(), Ok(greenthreads::ThreadId::MAIN));

    SPINNER_DONE.store(true, Ordering::Release);
    assert_eq!(join(spinner), Ok(1));
    stop().unwrap();
}

static STOP_SPINNERS: AtomicBool = AtomicBool::new(false);
static PROGRESS: [AtomicU64; 2] = [AtomicU64::new(0), AtomicU64::new(0)];

fn spinners_share_the_cpu() {
    start(true).unwrap();

    let spinners: Vec<_> = (0..2)
        .map(|i| {
            create(move || {
                while !STOP_SPINNERS.load(Ordering::Acquire) {
                    PROGRESS[i].fetch_add(1, Ordering::Relaxed);
                    spin_loop();
                }

                i as i32
            })
            .unwrap()
        })
        .collect();

    // Busy-wait without yielding until both
    // spinners have run.
    while PROGRESS.iter().any(|p| p.load(Ordering::Relaxed) == 0) {
        spin_loop();
    }

    STOP_SPINNERS.store(true, Ordering::Release);
    for (i, id) in spinners.into_iter().enumerate() {
        assert_eq!(join(id), Ok(i as i32));
    }

    stop().unwrap();
}

static TICKS: AtomicU64 = AtomicU64::new(0);

fn short_quantum() {
    let config = Config::default()
        .with_preemption(true)
        .with_quantum(Duration::from_millis(1));
    start_with(config).unwrap();

    // Count how often the counter thread gets to run
    // while we spin.
    let counter = create(|| loop {
        TICKS.fetch_add(1, Ordering::Relaxed);
        yield_now();
        if TICKS.load(Ordering::Relaxed) >= 5 {
            return 5;
        }
    })
    .unwrap();

    while TICKS.load(Ordering::Relaxed) < 5 {
        spin_loop();
    }

    assert_eq!(join(counter), Ok(5));
    stop().unwrap();
}

fn restart_after_stop() {
    start(true).unwrap();
    stop().unwrap();
    assert!(!preempt::is_armed());
    assert!(!preempt::is_enabled());

    // Without a timer, disabling does nothing.
    preempt::disable();
    assert!(!preempt::is_enabled());
    preempt::enable();

    start(true).unwrap();
    assert!(preempt::is_armed());
    let id = create(|| 3).unwrap();
    assert_eq!(join(id), Ok(3));
    stop().unwrap();
    assert!(!preempt::is_armed());
}

fn one_timer_per_process() {
    start(true).unwrap();

    let other = thread::spawn(|| {
        let refused = start(true);

        // A cooperative scheduler is still allowed.
        start(false).unwrap();
        let id = create(|| 4).unwrap();
        let value = join(id);
        stop().unwrap();

        (refused, value)
    });

    let (refused, value) = other.join().unwrap();
    assert_eq!(refused, Err(Error::ResourceExhausted));
    assert_eq!(value, Ok(4));

    assert!(preempt::is_armed());
    stop().unwrap();
}

static COOPERATIVE_DONE: AtomicBool = AtomicBool::new(false);

fn cooperative_scheduler_beside_timer() {
    // Another OS thread owns the timer for the whole test.
    let (armed, wait_armed) = mpsc::channel();
    let (finished, wait_finished) = mpsc::channel::<()>();
    let owner = thread::spawn(move || {
        start(true).unwrap();
        let _ = armed.send(());
        let _ = wait_finished.recv();
        stop().unwrap();
    });

    wait_armed.recv().unwrap();
    assert!(preempt::is_armed());
    assert!(!preempt::is_enabled());

    start(false).unwrap();
    assert!(!preempt::is_enabled());

    // The spinner uses up many quanta. Ticks landing on
    // this OS thread must not preempt it, so it finishes
    // before we run again.
    let spinner = create(|| {
        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(300) {
            spin_loop();
        }

        COOPERATIVE_DONE.store(true, Ordering::Release);
        6
    })
    .unwrap();

    yield_now();
    assert!(COOPERATIVE_DONE.load(Ordering::Acquire));
    assert_eq!(join(spinner), Ok(6));
    stop().unwrap();

    let _ = finished.send(());
    owner.join().unwrap();
    assert!(!preempt::is_armed());
}

/// The number of threads in a complete binary tree of
/// the given depth.
///
const fn tree_size(depth: u32) -> i32 {
    (1 << (depth + 1)) - 1
}

/// Builds a binary tree of threads, each creating and
/// joining its two children, and returns its size.
///
fn grow(depth: u32) -> i32 {
    // Give the timer something to interrupt.
    for _ in 0..1_000 {
        spin_loop();
    }

    if depth == 0 {
        return 1;
    }

    let left = create(move || grow(depth - 1)).unwrap();
    let right = create(move || grow(depth - 1)).unwrap();
    yield_now();

    1 + join(left).unwrap() + join(right).unwrap()
}

fn join_tree_under_preemption() {
    let config = Config::default()
        .with_preemption(true)
        .with_quantum(Duration::from_micros(50))
        .with_stack_pages(16);
    start_with(config).unwrap();

    const DEPTH: u32 = 6;
    for _ in 0..10 {
        let root = create(|| grow(DEPTH)).unwrap();
        assert_eq!(join(root), Ok(tree_size(DEPTH)));
        assert_eq!(greenthreads::thread_count(), Ok(1));
    }

    stop().unwrap();
}
