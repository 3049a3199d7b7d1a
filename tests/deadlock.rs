// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deadlock detection is `enabled == idle & sleeping`, checked against the
//! global bit-sets directly. This test never drives a real scheduler to
//! quiescence — that path ends in `FatalError::abort()` and
//! `std::process::exit`, which would kill the test process along with
//! every other test in this binary.

use std::sync::atomic::Ordering;

use slick_rt::global;
use slick_rt::scheduler::Scheduler;

#[test]
fn quiescent_only_when_every_enabled_scheduler_is_idle_and_sleeping() {
    let a = Box::leak(Box::new(Scheduler::new(0, 0)));
    let b = Box::leak(Box::new(Scheduler::new(1, 0)));
    global::init(vec![&*a, &*b]);

    let g = global::get();
    assert_eq!(g.enabled.load(Ordering::Acquire), 0b11);

    // Neither idle nor sleeping yet: not quiescent.
    assert!(!global::is_quiescent());

    g.idle.set(0, Ordering::Release);
    g.sleeping.set(0, Ordering::Release);
    // Only scheduler 0 accounted for: still not quiescent with two enabled.
    assert!(!global::is_quiescent());

    g.idle.set(1, Ordering::Release);
    g.sleeping.set(1, Ordering::Release);
    assert!(global::is_quiescent());

    // A scheduler that wakes up (clears idle) breaks quiescence again.
    g.idle.clear(1, Ordering::Release);
    assert!(!global::is_quiescent());
}
