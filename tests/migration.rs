// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-thread work stealing through a shared [`MigrationWindow`],
//! exercised directly rather than through a full `Scheduler` — the
//! scheduler's own migration scan is a private implementation detail, but
//! the window it publishes into and steals from is the same object a
//! second scheduler thread would reach for.

use std::sync::{Arc, Barrier};
use std::thread;

use slick_rt::batch::Batch;
use slick_rt::migration::MigrationWindow;
use slick_rt::priofinity::Priofinity;
use slick_rt::proc::{BoxedFuture, Proc, ProcPtr};

fn leaked_batch_of_one(tag: u64) -> *mut Batch {
    let mut b = Box::new(Batch::new());
    let fut: BoxedFuture = Box::pin(async {});
    let p = ProcPtr::new(Proc::new(fut, Priofinity::any(tag)));
    // Safety: `p` is freshly created and not linked elsewhere.
    unsafe { b.push_back(p) };
    Box::into_raw(b)
}

#[test]
fn one_thread_publishes_another_steals_every_batch_exactly_once() {
    let window = Arc::new(MigrationWindow::new());

    // The window has 15 usable slots; stay under that so nothing is
    // evicted before the consumer gets to it, keeping the expected set
    // deterministic.
    const N: usize = 12;
    let batches: Vec<*mut Batch> = (0..N).map(|i| leaked_batch_of_one(i as u64)).collect();
    for &b in &batches {
        assert!(window.publish(b).is_none());
    }
    assert!(!window.is_empty());

    let barrier = Arc::new(Barrier::new(2));
    let consumer_window = Arc::clone(&window);
    let consumer_barrier = Arc::clone(&barrier);
    let consumer = thread::spawn(move || {
        consumer_barrier.wait();
        let mut stolen = Vec::new();
        while stolen.len() < N {
            if let Some(b) = consumer_window.steal() {
                stolen.push(b as usize);
            }
        }
        stolen
    });

    barrier.wait();
    let stolen = consumer.join().unwrap();

    assert_eq!(stolen.len(), N);
    let mut stolen_set = stolen.clone();
    stolen_set.sort_unstable();
    let mut expected: Vec<usize> = batches.iter().map(|p| *p as usize).collect();
    expected.sort_unstable();
    assert_eq!(stolen_set, expected, "every published batch stolen exactly once");

    assert!(window.is_empty());
    for addr in stolen {
        // Safety: stolen batches are uniquely owned by this thread now,
        // the window having handed out each exactly once.
        unsafe {
            let mut boxed = Box::from_raw(addr as *mut Batch);
            while let Some(p) = boxed.pop_front() {
                drop(p.into_box());
            }
        }
    }
}
