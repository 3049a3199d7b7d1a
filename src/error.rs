// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error taxonomy: fatal runtime errors, fatal signals, and configuration
//! warnings. Fatal errors terminate the whole process; there is no partial
//! recovery once the scheduler invariants are suspect.

use std::fmt;

/// Errors that abort the entire run-time process.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("deadlocked, no processes left")]
    Deadlock,
    #[error("out of memory allocating process batches")]
    BatchOom,
    #[error("failed to create wakeup pipe: {0}")]
    PipeCreate(#[source] std::io::Error),
    #[error("fcntl on wakeup pipe failed: {0}")]
    Fcntl(#[source] std::io::Error),
    #[error("illegal migration window index {0}")]
    BadWindowIndex(u8),
    #[error("empty-batch invariant violated")]
    EmptyBatchInvariant,
    #[error("dirty batch reused before laundering")]
    DirtyBatchMisuse,
    #[error("unclean batch loaded from free-list")]
    UncleanBatchLoad,
    #[error("affinity mask excludes every enabled scheduler")]
    UnknownAffinity,
    #[error("fatal signal: {0}")]
    Signal(#[from] FatalSignal),
}

/// Fatal signals the run-time installs handlers for.
#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum FatalSignal {
    #[error("segmentation fault")]
    Segv,
    #[error("illegal instruction")]
    Ill,
    #[error("bus error")]
    Bus,
    #[error("floating-point exception")]
    Fpe,
}

impl FatalError {
    /// Prints a `slick: ` prefixed diagnostic and aborts the process.
    ///
    /// Mirrors the source's `fatal()` helper: no unwinding, no partial
    /// recovery, immediate process exit.
    pub fn abort(self) -> ! {
        tracing::error!(error = %self, "slick: fatal error, aborting");
        eprintln!("slick: fatal: {self}");
        std::process::exit(libc::EXIT_FAILURE);
    }
}

/// Recoverable configuration problems: malformed CLI flags, oversubscribed
/// thread counts, unparsable env vars. These are reported via `warning()`
/// and a default value is substituted.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is not a valid integer: {value:?}")]
    BadEnvInt { var: &'static str, value: String },
    #[error("thread count {0} is out of range 1..=128")]
    ThreadCountOutOfRange(usize),
    #[error("cpu count {0} is out of range 1..=128")]
    CpuCountOutOfRange(usize),
}

/// Logs a `tracing::warn!` diagnostic for a recoverable configuration
/// problem and returns the supplied default.
pub fn warning<T: fmt::Display>(err: T) {
    tracing::warn!(%err, "slick: warning");
}
