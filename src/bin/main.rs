// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bootstrap entry point. A real deployment links the run-time as a
//! library into code generated by the host compiler; this binary exists
//! so the run-time is independently runnable — it seeds two processes
//! that bounce a byte back and forth over one channel a fixed number of
//! times, then stop.

use slick_rt::bootstrap::{startup, Config};
use slick_rt::channel::{chan_in, chan_out, ChanWord};
use slick_rt::priofinity::Priofinity;
use slick_rt::proc::{BoxedFuture, Proc, ProcPtr};
use slick_rt::scheduler::current;

const ROUNDS: u8 = 64;

fn main() {
    let cfg = Config::from_args(std::env::args().skip(1));
    let initial = spawner();
    let code = startup(&cfg, initial);
    std::process::exit(code);
}

/// The seed process: spawns the producer and consumer as independent
/// top-level processes on the local scheduler, then stops itself.
fn spawner() -> BoxedFuture {
    Box::pin(async move {
        let chan = Box::leak(Box::new(ChanWord::new()));
        let sched = current();
        let producer = ProcPtr::new(Proc::new(producer_body(chan), Priofinity::default()));
        let consumer = ProcPtr::new(Proc::new(consumer_body(chan), Priofinity::default()));
        sched.enqueue(producer);
        sched.enqueue(consumer);
    })
}

fn producer_body(chan: &'static ChanWord) -> BoxedFuture {
    Box::pin(async move {
        let mut value: u8 = 0;
        for _ in 0..ROUNDS {
            value = value.wrapping_add(1);
            // Safety: `value` lives for the duration of the await.
            unsafe { chan_out(chan, std::ptr::addr_of_mut!(value), 1).await };
        }
        tracing::info!(value, "slick: producer finished");
    })
}

fn consumer_body(chan: &'static ChanWord) -> BoxedFuture {
    Box::pin(async move {
        let mut received: u8 = 0;
        for _ in 0..ROUNDS {
            // Safety: `received` lives for the duration of the await.
            unsafe { chan_in(chan, std::ptr::addr_of_mut!(received), 1).await };
        }
        tracing::info!(received, "slick: consumer finished");
    })
}
