// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bootstrap: CLI parsing, thread/CPU-count resolution, signal
//! installation, thread spawn and join. Per §4.12/§6.

use std::io::Read;

use clap::Parser;

use crate::error::FatalError;
use crate::proc::{BoxedFuture, Proc};

/// Run-time bootstrap flags, parsed ahead of the user program's own
/// argument parsing.
#[derive(Debug, Parser)]
#[command(name = "slick-rt", disable_help_flag = true)]
pub struct Config {
    /// Verbosity level; bare `--rt-verbose` means level 1.
    #[arg(long = "rt-verbose", default_missing_value = "1", num_args = 0..=1)]
    pub rt_verbose: Option<u8>,

    #[arg(long = "rt-nthreads")]
    pub rt_nthreads: Option<usize>,

    #[arg(long = "rt-help")]
    pub rt_help: bool,
}

impl Config {
    /// Parses `--rt-*` flags from `args`, overlaid with environment
    /// variables, per §4.12. Unrecognized arguments are left for the
    /// user program.
    #[must_use]
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Self {
        Self::try_parse_from(std::iter::once("slick-rt".to_string()).chain(args))
            .unwrap_or_else(|_| Config {
                rt_verbose: None,
                rt_nthreads: None,
                rt_help: false,
            })
    }

    #[must_use]
    pub fn verbosity(&self) -> u8 {
        self.rt_verbose.unwrap_or(0)
    }
}

/// Resolves the thread count: CLI flag, then `SLICKRTNTHREADS`, then
/// available-parallelism / `/proc/cpuinfo` discovery.
#[must_use]
pub fn resolve_nthreads(cfg: &Config) -> usize {
    if let Some(n) = cfg.rt_nthreads {
        return clamp_count(n, "SLICKRTNTHREADS (via --rt-nthreads)");
    }
    if let Ok(s) = std::env::var("SLICKRTNTHREADS") {
        match s.parse::<usize>() {
            Ok(n) => return clamp_count(n, "SLICKRTNTHREADS"),
            Err(_) => crate::error::warning(format!(
                "SLICKRTNTHREADS={s:?} is not a valid integer, falling back to discovery"
            )),
        }
    }
    discover_cpu_count()
}

fn clamp_count(n: usize, source: &str) -> usize {
    if !(1..=128).contains(&n) {
        crate::error::warning(format!("{source}={n} is out of range 1..=128, clamping"));
        return n.clamp(1, 128);
    }
    n
}

/// `sysconf`-style discovery via `std::thread::available_parallelism()`,
/// falling back to counting `processor\s*:\s*\d+` lines in
/// `/proc/cpuinfo`, per §6.
#[must_use]
pub fn discover_cpu_count() -> usize {
    if let Ok(n) = std::env::var("SLICKRTNCPUS") {
        if let Ok(n) = n.parse::<usize>() {
            return clamp_count(n, "SLICKRTNCPUS");
        }
    }
    if let Ok(n) = std::thread::available_parallelism() {
        return n.get();
    }
    count_proc_cpuinfo().unwrap_or(1)
}

fn count_proc_cpuinfo() -> Option<usize> {
    let mut contents = String::new();
    std::fs::File::open("/proc/cpuinfo")
        .ok()?
        .read_to_string(&mut contents)
        .ok()?;
    let count = contents
        .lines()
        .filter(|l| l.trim_start().starts_with("processor"))
        .count();
    if count > 0 {
        Some(count)
    } else {
        None
    }
}

/// Installs `SIGALRM`, `SIGILL`, `SIGBUS`, `SIGFPE` handlers. `SIGALRM`
/// marks `SYNC_TIME` on every enabled scheduler and wakes them; the
/// others are fatal.
pub fn install_signal_handlers() {
    unsafe {
        install(libc::SIGALRM, sigalrm_handler);
        install(libc::SIGILL, fatal_signal_handler);
        install(libc::SIGBUS, fatal_signal_handler);
        install(libc::SIGFPE, fatal_signal_handler);
        install(libc::SIGSEGV, fatal_signal_handler);
    }
}

unsafe fn install(signum: i32, handler: extern "C" fn(i32)) {
    let mut sa: libc::sigaction = std::mem::zeroed();
    sa.sa_sigaction = handler as usize;
    sa.sa_flags = libc::SA_NODEFER;
    libc::sigemptyset(&mut sa.sa_mask);
    if libc::sigaction(signum, &sa, std::ptr::null_mut()) != 0 {
        crate::error::warning(format!(
            "sigaction({signum}) failed: {}",
            std::io::Error::last_os_error()
        ));
    }
}

extern "C" fn sigalrm_handler(_signum: i32) {
    let Some(g) = crate::global::try_get() else {
        return;
    };
    for s in &g.schedulers {
        s.sync.set(crate::sync_word::Sync::TIME);
        g.sleeping.clear(s.index, std::sync::atomic::Ordering::AcqRel);
    }
}

extern "C" fn fatal_signal_handler(signum: i32) {
    let sig = match signum {
        libc::SIGILL => crate::error::FatalSignal::Ill,
        libc::SIGBUS => crate::error::FatalSignal::Bus,
        libc::SIGFPE => crate::error::FatalSignal::Fpe,
        _ => crate::error::FatalSignal::Segv,
    };
    FatalError::Signal(sig).abort();
}

/// Spawns one scheduler thread per entry in `entries` (thread `0` seeded
/// with the initial process built from `entries[0]`'s future), installs
/// signal handlers, and joins every thread. Returns the process exit
/// code.
pub fn startup(cfg: &Config, initial: BoxedFuture) -> i32 {
    if cfg.rt_help {
        print_help();
        return 1;
    }

    let nthreads = resolve_nthreads(cfg);
    crate::logging::init(cfg.verbosity());
    tracing::info!(nthreads, "slick: starting scheduler threads");

    let spin_target_us = crate::spin_calib::resolve_target_us(
        std::env::var("SLICKSCHEDULERSPIN").ok().as_deref(),
    );

    let schedulers: Vec<&'static crate::scheduler::Scheduler> = (0..nthreads)
        .map(|i| {
            let spin = crate::spin_calib::calibrate(spin_target_us, nthreads);
            let s = Box::leak(Box::new(crate::scheduler::Scheduler::new(i as u32, spin)));
            &*s
        })
        .collect();
    crate::global::init(schedulers.clone());
    install_signal_handlers();

    let initial = std::sync::Mutex::new(Some(initial));
    let handles: Vec<_> = schedulers
        .iter()
        .map(|&s| {
            let seed = if s.index == 0 {
                initial.lock().expect("bootstrap mutex poisoned").take()
            } else {
                None
            };
            std::thread::spawn(move || run_scheduler_thread(s, seed))
        })
        .collect();

    for h in handles {
        let _ = h.join();
    }
    0
}

fn run_scheduler_thread(s: &'static crate::scheduler::Scheduler, seed: Option<BoxedFuture>) {
    crate::scheduler::bind_current(s);
    if let Some(fut) = seed {
        let proc = Proc::new(fut, crate::priofinity::Priofinity::default());
        s.enqueue(crate::proc::ProcPtr::new(proc));
    }
    loop {
        s.tick();
    }
}

fn print_help() {
    eprintln!("slick: --rt-verbose[=N]  --rt-nthreads=N  --rt-help");
}
