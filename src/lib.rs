// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A user-space multi-core CSP run-time.
//!
//! A fixed pool of OS threads, each running an independent [`scheduler`],
//! executes a large population of lightweight processes ([`proc`])
//! communicating exclusively through synchronous rendezvous [`channel`]s.
//! Processes are carried in [`batch`]es; idle schedulers steal work
//! through per-priority [`migration`] windows or receive it via [`mail`]
//! queues; suspended processes may also be parked on a per-scheduler
//! [`timer`] queue.
//!
//! Process bodies are represented as boxed, pinned `Future`s: a process's
//! suspension points (channel I/O, `talt`, timer wait, `pause`, `stopp`,
//! a non-last `endp`) are exactly its `.await` points, and "rescheduling"
//! a process means waking its `Waker`.

pub mod abi;
pub mod batch;
pub mod bitset;
pub mod bootstrap;
pub mod channel;
pub mod clock;
pub mod error;
pub mod global;
pub mod lifecycle;
pub mod logging;
pub mod mail;
pub mod migration;
pub mod priofinity;
pub mod proc;
pub mod runqueue;
pub mod scheduler;
pub mod spin_calib;
pub mod sync_word;
pub mod timer;

pub use crate::error::{ConfigError, FatalError, FatalSignal};
pub use crate::priofinity::Priofinity;
pub use crate::proc::{BoxedFuture, JoinBlock, Proc, ProcPtr};
