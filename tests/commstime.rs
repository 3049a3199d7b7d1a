// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The classic "commstime" benchmark: a ring of four processes —
//! `prefix` seeds a value, `delta` forwards it to both `successor` and a
//! feedback channel back to `prefix`, `successor` increments it before
//! handing it to `consume`, which counts completed cycles. The ring runs
//! forever; this test bounds the scheduler to a fixed number of ticks and
//! checks forward progress rather than termination, matching the run-time's
//! own liveness property (§8: "terminates only on external stop").

use std::sync::atomic::{AtomicU64, Ordering};

use slick_rt::channel::{chan_in, chan_out, ChanWord};
use slick_rt::priofinity::Priofinity;
use slick_rt::proc::{BoxedFuture, Proc, ProcPtr};
use slick_rt::scheduler::{bind_current, current, Scheduler};

static CYCLES: AtomicU64 = AtomicU64::new(0);

fn leaked_chan() -> &'static ChanWord {
    Box::leak(Box::new(ChanWord::new()))
}

async fn send_u64(chan: &ChanWord, mut value: u64) {
    // Safety: `value` lives on this async frame for the duration of the
    // await.
    unsafe { chan_out(chan, std::ptr::addr_of_mut!(value).cast(), 8).await };
}

async fn recv_u64(chan: &ChanWord) -> u64 {
    let mut value: u64 = 0;
    // Safety: `value` lives on this async frame for the duration of the
    // await.
    unsafe { chan_in(chan, std::ptr::addr_of_mut!(value).cast(), 8).await };
    value
}

#[test]
fn commstime_ring_makes_forward_progress() {
    let sched = Box::leak(Box::new(Scheduler::new(0, 0)));
    slick_rt::global::init(vec![&*sched]);
    bind_current(sched);

    let to_delta = leaked_chan();
    let to_successor = leaked_chan();
    let feedback = leaked_chan();
    let to_consume = leaked_chan();

    let prefix: BoxedFuture = Box::pin(async move {
        send_u64(to_delta, 0).await;
        loop {
            let v = recv_u64(feedback).await;
            send_u64(to_delta, v).await;
        }
    });
    let delta: BoxedFuture = Box::pin(async move {
        loop {
            let v = recv_u64(to_delta).await;
            send_u64(to_successor, v).await;
            send_u64(feedback, v).await;
        }
    });
    let successor: BoxedFuture = Box::pin(async move {
        loop {
            let v = recv_u64(to_successor).await;
            send_u64(to_consume, v.wrapping_add(1)).await;
        }
    });
    let consume: BoxedFuture = Box::pin(async move {
        loop {
            let _ = recv_u64(to_consume).await;
            CYCLES.fetch_add(1, Ordering::Relaxed);
        }
    });

    let pf = Priofinity::default();
    for body in [prefix, delta, successor, consume] {
        current().enqueue(ProcPtr::new(Proc::new(body, pf)));
    }

    for _ in 0..20_000 {
        sched.tick();
    }

    assert!(
        CYCLES.load(Ordering::Relaxed) > 100,
        "ring should have completed many cycles, got {}",
        CYCLES.load(Ordering::Relaxed)
    );
}
