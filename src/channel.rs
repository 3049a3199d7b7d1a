// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Channel rendezvous protocol and the ALT (guarded choice) state machine.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::priofinity::Priofinity;
use crate::proc::{alt_state, IoDirection, IoSlot, ProcPtr};

/// `true` iff the low bit of a channel word is set, meaning the waiting
/// party is ALTing rather than plain-blocked.
const ALTY: usize = 1;

/// A single atomic word shared between the two parties of a channel:
/// `null` (idle), a tagged pointer to a waiting process (`W`), or `W|1`
/// (`W` is ALTing on this channel as one of several guards).
pub struct ChanWord(AtomicUsize);

/// Outcome of a `channel_io` attempt.
pub enum IoOutcome {
    /// We were first to arrive; the caller should register its waker and
    /// return `Poll::Pending`.
    Parked,
    /// A partner raced in as an ALTer; its guard was woken, and we must
    /// still park and wait for the actual rendezvous.
    WokeAltGuard(ProcPtr),
    /// A partner was already waiting (plain or being woken from an ALT
    /// swap); the rendezvous completed synchronously and `other` should be
    /// resumed.
    Completed(ProcPtr),
}

impl ChanWord {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Shared entry point for both `chanin` and `chanout`, per §4.7.
    ///
    /// `w` must have its `io` slot already staged by the caller with
    /// `buf`/`count`/`direction` before calling this.
    pub fn channel_io(&self, w: ProcPtr, scheduler_priofinity: Priofinity<u64>) -> IoOutcome {
        // Safety: `w` is exclusively owned by the caller for the duration
        // of this call (it is the currently-running process).
        unsafe { w.as_mut().priofinity = scheduler_priofinity };
        let w_raw = w.as_ptr() as usize;
        loop {
            let prev = self.0.load(Ordering::Acquire);
            if prev == 0 || prev & ALTY != 0 {
                // Publication of the staged I/O happens-before the swap.
                match self
                    .0
                    .compare_exchange(prev, w_raw, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(0) => return IoOutcome::Parked,
                    Ok(alty_prev) => {
                        // `alty_prev` has its low bit set: a guard raced
                        // with us. Wake it, then we still park.
                        let guard = tagged_to_proc(alty_prev & !ALTY);
                        return IoOutcome::WokeAltGuard(guard);
                    }
                    Err(_) => continue, // lost the race, reload and retry
                }
            } else {
                // A plain waiting partner is already there: try to claim
                // the rendezvous by clearing the word to null.
                if self
                    .0
                    .compare_exchange(prev, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return IoOutcome::Completed(tagged_to_proc(prev));
                }
                // Lost the race (partner timed out / cancelled); retry.
            }
        }
    }

    /// Registers `w` as an ALT guard: `w | 1`.
    pub fn register_alt_guard(&self, w: ProcPtr) -> usize {
        let tagged = (w.as_ptr() as usize) | ALTY;
        self.0.swap(tagged, Ordering::AcqRel)
    }

    /// De-registers an ALT guard previously installed with
    /// `register_alt_guard`, swapping it back to null iff it's still
    /// there (i.e. no partner arrived on this particular channel).
    pub fn deregister_alt_guard(&self, w: ProcPtr) -> bool {
        let tagged = (w.as_ptr() as usize) | ALTY;
        self.0
            .compare_exchange(tagged, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for ChanWord {
    fn default() -> Self {
        Self::new()
    }
}

fn tagged_to_proc(raw: usize) -> ProcPtr {
    ProcPtr::from_non_null(std::ptr::NonNull::new(raw as *mut crate::proc::Proc).expect("tagged channel word is never null-only"))
}

/// Copies `count` bytes of staged I/O between `a` and `b` in the direction
/// recorded on each side, specialized for the common small sizes.
///
/// # Safety
/// Both `a` and `b` must have valid, non-overlapping `io.buf` pointers of
/// at least `io.count` bytes, one staged for input and the other output.
pub unsafe fn copy_rendezvous(a: IoSlot, b: IoSlot) {
    debug_assert_eq!(a.count, b.count);
    let (src, dst) = match a.direction {
        IoDirection::Output => (a.buf, b.buf),
        IoDirection::Input => (b.buf, a.buf),
    };
    match a.count {
        1 => dst.write(src.read()),
        2 => (dst as *mut u16).write_unaligned((src as *const u16).read_unaligned()),
        4 => (dst as *mut u32).write_unaligned((src as *const u32).read_unaligned()),
        8 => (dst as *mut u64).write_unaligned((src as *const u64).read_unaligned()),
        n => std::ptr::copy_nonoverlapping(src, dst, n),
    }
}

/// Applies one ALT-guard arrival to `w`'s packed `alt_state`, per §4.8.
/// Returns `true` if `w` should be woken now (it was parked waiting, or
/// this was its last outstanding guard).
#[must_use]
pub fn trigger_alt_guard(w: ProcPtr) -> bool {
    // Safety: `w` is a live process; `alt_state` is the only field this
    // function touches, via CAS.
    let state = unsafe { &w.as_ref().alt_state };
    loop {
        let s = state.load(Ordering::Acquire);
        let count = s & alt_state::COUNT_MASK;
        let new_count = count.saturating_sub(1);
        let preserved = s & !(alt_state::COUNT_MASK | alt_state::NOT_READY | alt_state::WAITING);
        let ns = preserved | new_count;
        if state
            .compare_exchange_weak(s, ns, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return (s & alt_state::WAITING != 0) || ns & alt_state::COUNT_MASK == 0;
        }
    }
}

/// Performs one channel operation as a suspension point of the calling
/// process's own `Future`: stages `buf`/`count`/`direction` on the
/// currently-polling process (via
/// [`current_proc`](crate::scheduler::current_proc)) and either completes
/// the rendezvous synchronously or parks until a partner arrives.
pub async fn chan_op(chan: &ChanWord, buf: *mut u8, count: usize, direction: IoDirection) {
    let mut staged = false;
    std::future::poll_fn(move |_cx| {
        if staged {
            // We were re-polled only because a partner completed the
            // rendezvous and re-enqueued us; the data transfer already
            // happened on their side.
            return std::task::Poll::Ready(());
        }
        staged = true;
        let w = crate::scheduler::current_proc();
        // Safety: `w` is the process currently being polled on this
        // thread, hence exclusively owned here.
        unsafe { w.as_mut().io = IoSlot { buf, count, direction } };
        let pf = crate::scheduler::current().priofinity();
        match chan.channel_io(w, pf) {
            IoOutcome::Parked => std::task::Poll::Pending,
            IoOutcome::WokeAltGuard(guard) => {
                if trigger_alt_guard(guard) {
                    crate::scheduler::current().wake(guard);
                }
                std::task::Poll::Pending
            }
            IoOutcome::Completed(other) => {
                // Safety: both `w` and `other` have their `io` slots
                // staged and valid for `count` bytes.
                unsafe {
                    copy_rendezvous(w.as_ref().io, other.as_ref().io);
                }
                crate::scheduler::current().wake(other);
                std::task::Poll::Ready(())
            }
        }
    })
    .await;
}

/// Receives `count` bytes into `buf` over `chan`.
///
/// # Safety
/// `buf` must be valid for `count` bytes for the duration of the await.
pub async unsafe fn chan_in(chan: &ChanWord, buf: *mut u8, count: usize) {
    chan_op(chan, buf, count, IoDirection::Input).await;
}

/// Sends `count` bytes from `buf` over `chan`.
///
/// # Safety
/// `buf` must be valid for `count` bytes for the duration of the await.
pub async unsafe fn chan_out(chan: &ChanWord, buf: *mut u8, count: usize) {
    chan_op(chan, buf, count, IoDirection::Output).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::{BoxedFuture, Proc};

    fn dummy() -> ProcPtr {
        let fut: BoxedFuture = Box::pin(async {});
        ProcPtr::new(Proc::new(fut, Priofinity::any(10)))
    }

    #[test]
    fn first_arrival_parks() {
        let c = ChanWord::new();
        let w = dummy();
        match c.channel_io(w, Priofinity::any(5)) {
            IoOutcome::Parked => {}
            _ => panic!("expected Parked"),
        }
        unsafe { drop(w.into_box()) };
    }

    #[test]
    fn second_arrival_completes_rendezvous() {
        let c = ChanWord::new();
        let a = dummy();
        let b = dummy();
        assert!(matches!(c.channel_io(a, Priofinity::any(5)), IoOutcome::Parked));
        match c.channel_io(b, Priofinity::any(5)) {
            IoOutcome::Completed(partner) => assert_eq!(partner, a),
            _ => panic!("expected Completed"),
        }
        unsafe {
            drop(a.into_box());
            drop(b.into_box());
        }
    }

    #[test]
    fn alt_guard_decrements_and_signals_last() {
        let w = dummy();
        unsafe {
            w.as_ref()
                .alt_state
                .store(alt_state::ENABLING | alt_state::NOT_READY | 1, Ordering::Release);
        }
        assert!(trigger_alt_guard(w));
        unsafe { drop(w.into_box()) };
    }
}
