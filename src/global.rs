// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide singleton: scheduler registry plus global bit-sets.
//!
//! Initialised once by `init`/`startup` and consumed read-only (aside from
//! the bit-sets, which are atomic) by every scheduler thread thereafter.
//! There is no reinitialisation after startup.

use std::sync::OnceLock;

use crate::bitset::Bitset128;
use crate::scheduler::Scheduler;

/// The global registry: every scheduler, plus the `enabled`/`idle`/
/// `sleeping` bit-sets shared across threads.
pub struct GlobalState {
    pub schedulers: Vec<&'static Scheduler>,
    pub enabled: Bitset128,
    pub idle: Bitset128,
    pub sleeping: Bitset128,
}

static GLOBAL: OnceLock<GlobalState> = OnceLock::new();

/// Installs the global state. Panics if called twice.
pub fn init(schedulers: Vec<&'static Scheduler>) {
    let enabled = Bitset128::new();
    for (i, _) in schedulers.iter().enumerate() {
        enabled.set(i as u32, std::sync::atomic::Ordering::Relaxed);
    }
    let state = GlobalState {
        schedulers,
        enabled,
        idle: Bitset128::new(),
        sleeping: Bitset128::new(),
    };
    GLOBAL
        .set(state)
        .unwrap_or_else(|_| panic!("slick: global state initialised twice"));
}

/// Accesses the global state. Panics if `init` hasn't run yet — every
/// scheduler thread is only spawned after `init` completes, so this is a
/// programming error, not a runtime condition.
#[must_use]
pub fn get() -> &'static GlobalState {
    GLOBAL.get().expect("slick: global state not initialised")
}

#[must_use]
pub fn try_get() -> Option<&'static GlobalState> {
    GLOBAL.get()
}

/// `true` iff every enabled scheduler is both idle and sleeping, i.e. the
/// process pool is quiescent. Callers must additionally check that no
/// scheduler has a pending timer before treating this as a deadlock.
#[must_use]
pub fn is_quiescent() -> bool {
    use std::sync::atomic::Ordering;
    let g = get();
    let enabled = g.enabled.load(Ordering::Acquire);
    let idle = g.idle.load(Ordering::Acquire);
    let sleeping = g.sleeping.load(Ordering::Acquire);
    enabled != 0 && enabled == (idle & sleeping)
}
