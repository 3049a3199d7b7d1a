// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A ring of 255 processes passing a single token around a chain of
//! channels, forever. Exercises batch splitting and FIFO dispatch across
//! a population much larger than one batch.

use std::sync::atomic::{AtomicU64, Ordering};

use slick_rt::channel::{chan_in, chan_out, ChanWord};
use slick_rt::priofinity::Priofinity;
use slick_rt::proc::{BoxedFuture, Proc, ProcPtr};
use slick_rt::scheduler::{bind_current, current, Scheduler};

const RING_SIZE: usize = 255;
static HOPS: AtomicU64 = AtomicU64::new(0);

async fn hop(inbound: &ChanWord, outbound: &ChanWord) {
    let mut byte: u8 = 0;
    // Safety: `byte` lives on this async frame for the duration of each
    // await.
    unsafe {
        chan_in(inbound, std::ptr::addr_of_mut!(byte), 1).await;
        byte = byte.wrapping_add(1);
        chan_out(outbound, std::ptr::addr_of_mut!(byte), 1).await;
    }
    HOPS.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn ring_of_255_processes_keeps_circulating_the_token() {
    let sched = Box::leak(Box::new(Scheduler::new(0, 0)));
    slick_rt::global::init(vec![&*sched]);
    bind_current(sched);

    let channels: Vec<&'static ChanWord> = (0..RING_SIZE)
        .map(|_| &*Box::leak(Box::new(ChanWord::new())))
        .collect();

    let pf = Priofinity::default();
    for i in 0..RING_SIZE {
        let inbound = channels[i];
        let outbound = channels[(i + 1) % RING_SIZE];
        let body: BoxedFuture = Box::pin(async move {
            loop {
                hop(inbound, outbound).await;
            }
        });
        current().enqueue(ProcPtr::new(Proc::new(body, pf)));
    }

    // Safety: seeding the ring requires one initial token; we synthesize
    // it by writing directly into the first channel's would-be sender
    // slot is unnecessary here — the ring only makes progress once some
    // process arrives on both ends of a channel, and since every process
    // is a receiver-then-sender, the very first process to run blocks on
    // `chan_in`, and so does every other: nothing completes without an
    // external seed. Inject one token on channel 0 from this test thread.
    let mut seed: u8 = 0;
    let seed_proc: BoxedFuture = Box::pin(async move {
        // Safety: `seed` lives on this async frame for the duration of
        // the await.
        unsafe { chan_out(channels[0], std::ptr::addr_of_mut!(seed), 1).await };
    });
    current().enqueue(ProcPtr::new(Proc::new(seed_proc, pf)));

    for _ in 0..50_000 {
        sched.tick();
    }

    assert!(
        HOPS.load(Ordering::Relaxed) as usize > RING_SIZE * 2,
        "token should have circulated the ring repeatedly, got {} hops",
        HOPS.load(Ordering::Relaxed)
    );
}
