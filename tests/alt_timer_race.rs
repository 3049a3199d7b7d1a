// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An ALT with two guards — one channel, one timer — races both and
//! commits to whichever fires first, cleanly cancelling the other. This
//! drives `ChanWord`/`TimerQueue`/`trigger_alt_guard` directly rather than
//! through a full `Scheduler`, since the ALT protocol is decided entirely
//! at that level.

use std::sync::atomic::Ordering;

use slick_rt::channel::{trigger_alt_guard, ChanWord, IoOutcome};
use slick_rt::priofinity::Priofinity;
use slick_rt::proc::{alt_state, BoxedFuture, Proc, ProcPtr};
use slick_rt::timer::{TimerNode, TimerQueue};

fn dummy() -> ProcPtr {
    let fut: BoxedFuture = Box::pin(async {});
    ProcPtr::new(Proc::new(fut, Priofinity::any(10)))
}

#[test]
fn channel_guard_firing_first_cancels_the_timer_guard() {
    let alter = dummy();
    // Safety: `alter` is freshly created and not yet shared.
    unsafe {
        alter
            .as_ref()
            .alt_state
            .store(alt_state::ENABLING | alt_state::NOT_READY | 2, Ordering::Release);
    }

    let chan = ChanWord::new();
    chan.register_alt_guard(alter);

    let mut timers = TimerQueue::new();
    let node = TimerNode::new(1_000_000, alter, true);
    let became_head = timers.insert(node);
    assert!(became_head);
    assert!(!timers.is_empty());

    // A plain partner arrives on the channel first.
    let partner = dummy();
    let outcome = chan.channel_io(partner, Priofinity::any(5));
    let guard = match outcome {
        IoOutcome::WokeAltGuard(g) => g,
        _ => panic!("expected the channel guard to wake the alting process"),
    };
    assert_eq!(guard, alter);

    // The alting process commits to the channel guard: decrement its
    // guard count and cancel every other outstanding guard.
    let should_wake = trigger_alt_guard(guard);
    assert!(!should_wake, "one guard left outstanding, not the last");

    // Cancel the timer guard now that the channel guard won the race.
    let (fired, alt_fired) = {
        // Force immediate expiry to simulate a scan that would otherwise
        // have fired it, and confirm cancellation already took effect.
        timers.expire(u64::MAX)
    };
    assert!(fired.is_empty());
    assert!(
        alt_fired.is_empty(),
        "the timer guard must not fire once the channel guard committed"
    );

    // The channel word now holds the partner as a plain waiter; the
    // committed process completes the actual transfer with a follow-up
    // plain operation.
    let completion = chan.channel_io(alter, Priofinity::any(5));
    match completion {
        IoOutcome::Completed(other) => assert_eq!(other, partner),
        _ => panic!("expected the deferred rendezvous to complete"),
    }

    unsafe {
        drop(alter.into_box());
        drop(partner.into_box());
    }
}

#[test]
fn timer_guard_firing_first_leaves_channel_guard_registered_until_deregistered() {
    let alter = dummy();
    unsafe {
        alter
            .as_ref()
            .alt_state
            .store(alt_state::ENABLING | alt_state::NOT_READY | 2, Ordering::Release);
    }

    let chan = ChanWord::new();
    chan.register_alt_guard(alter);

    let mut timers = TimerQueue::new();
    timers.insert(TimerNode::new(0, alter, true));

    let (fired, alt_fired) = timers.expire(u64::MAX);
    assert!(fired.is_empty());
    assert_eq!(alt_fired, vec![alter]);

    let should_wake = trigger_alt_guard(alter);
    assert!(!should_wake);

    // The channel guard must be cleanly deregistered now that the timer
    // guard committed, so no future arrival mistakes it for a live guard.
    assert!(chan.deregister_alt_guard(alter));

    unsafe { drop(alter.into_box()) };
}
