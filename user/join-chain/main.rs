// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Runs a chain of green threads, each of which creates the next
//! and waits to join it. The last thread in the chain exits with a
//! known value, which is passed back up the chain to the initial
//! thread.
//!
//! ```text
//! $ join-chain --depth 3 --value 99
//! thread 3 returning 99
//! thread 2 joined thread 3: 99
//! thread 1 joined thread 2: 99
//! thread 0 joined thread 1: 99
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use greenthreads::{without_preemption, Config, ExitValue, ThreadId};
use log::{debug, error};
use std::time::Duration;

/// The exit value used by a thread whose child
/// could not be created or joined.
///
const FAILED: ExitValue = -1;

#[derive(Parser, Debug)]
#[command(name = "join-chain", about = "Pass a value up a chain of joined green threads")]
struct Args {
    /// Number of threads in the chain, not counting
    /// the initial thread.
    #[arg(short, long, default_value_t = 3)]
    depth: u32,

    /// Exit value of the last thread in the chain.
    #[arg(short, long, default_value_t = 99)]
    value: ExitValue,

    /// Preempt threads with a CPU-time timer.
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    preempt: bool,

    /// Preemption quantum in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 10)]
    quantum: u64,
}

/// Prints a line of output.
///
/// Standard output is not safe to share between
/// threads that can be preempted mid-write, so the
/// timer is held off while we print.
///
fn report(line: String) {
    without_preemption(|| println!("{}", line));
}

/// Runs link `level` of a chain `depth` threads long.
///
fn link(level: u32, depth: u32, value: ExitValue) -> ExitValue {
    let me = greenthreads::self_id().unwrap_or(ThreadId::MAIN);
    if level == depth {
        greenthreads::yield_now();
        report(format!("thread {} returning {}", me, value));
        return value;
    }

    let child = match greenthreads::create(move || link(level + 1, depth, value)) {
        Ok(child) => child,
        Err(err) => {
            without_preemption(|| error!("thread {} cannot create its child: {}", me, err));
            return FAILED;
        }
    };

    greenthreads::yield_now();
    match greenthreads::join(child) {
        Ok(got) => {
            report(format!("thread {} joined thread {}: {}", me, child, got));
            got
        }
        Err(err) => {
            without_preemption(|| error!("thread {} cannot join thread {}: {}", me, child, err));
            FAILED
        }
    }
}

/// Runs the chain described by `args` on the calling
/// OS thread, returning the value that reached the
/// initial thread.
///
fn run(args: &Args) -> Result<ExitValue> {
    if args.depth == 0 {
        bail!("the chain must contain at least one thread");
    }

    let config = Config::default()
        .with_preemption(args.preempt)
        .with_quantum(Duration::from_millis(args.quantum));
    debug!("starting with {:?}", config);
    greenthreads::start_with(config).context("cannot start the scheduler")?;

    let (depth, value) = (args.depth, args.value);
    let first = greenthreads::create(move || link(1, depth, value))
        .context("cannot create the first thread")?;
    let got = greenthreads::join(first).context("cannot join the first thread")?;
    report(format!("thread {} joined thread {}: {}", ThreadId::MAIN, first, got));

    greenthreads::stop().context("cannot stop the scheduler")?;
    Ok(got)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let got = run(&args)?;
    if got != args.value {
        bail!("chain returned {}, want {}", got, args.value);
    }

    Ok(())
}
