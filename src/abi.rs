// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Host ABI: `extern "C"` entry points a code generator targeting this
//! run-time would call. These are thin wrappers around the safe internal
//! API (§1.1's `Future`-based re-architecture lives entirely on the other
//! side of this boundary) — generated code still only ever sees raw
//! workspace pointers and channel words, exactly as specified in §6.

use std::ptr::NonNull;

use crate::channel::{ChanWord, IoOutcome};
use crate::clock;
use crate::proc::{IoDirection, IoSlot, ProcPtr};
use crate::scheduler::current;

unsafe fn to_proc_ptr(w: *mut crate::proc::Proc) -> ProcPtr {
    ProcPtr::from_non_null(NonNull::new(w).expect("slick: null workspace pointer crossed the ABI"))
}

/// Stages an input and attempts the rendezvous. Returns `1` if the call
/// completed synchronously (a partner was already waiting), `0` if the
/// caller must suspend and retry once woken.
///
/// # Safety
/// `w` and `c` must be valid, live pointers; `buf` must be valid for
/// `count` bytes.
#[no_mangle]
pub unsafe extern "C" fn chanin(w: *mut crate::proc::Proc, c: *mut ChanWord, buf: *mut u8, count: usize) -> i32 {
    stage_and_run(w, c, buf, count, IoDirection::Input)
}

/// As [`chanin`], specialized for an 8-byte transfer.
///
/// # Safety
/// Same requirements as [`chanin`] with `count` fixed at 8.
#[no_mangle]
pub unsafe extern "C" fn chanin64(w: *mut crate::proc::Proc, c: *mut ChanWord, buf: *mut u8) -> i32 {
    stage_and_run(w, c, buf, 8, IoDirection::Input)
}

/// # Safety
/// Same requirements as [`chanin`].
#[no_mangle]
pub unsafe extern "C" fn chanout(w: *mut crate::proc::Proc, c: *mut ChanWord, buf: *mut u8, count: usize) -> i32 {
    stage_and_run(w, c, buf, count, IoDirection::Output)
}

/// Fast path for an 8-byte output value staged directly from `value`,
/// per §4.7's `chanoutv64`.
///
/// # Safety
/// `w` and `c` must be valid, live pointers.
#[no_mangle]
pub unsafe extern "C" fn chanoutv64(w: *mut crate::proc::Proc, c: *mut ChanWord, value: u64) -> i32 {
    let mut scratch = value;
    let buf = std::ptr::addr_of_mut!(scratch).cast::<u8>();
    stage_and_run(w, c, buf, 8, IoDirection::Output)
}

unsafe fn stage_and_run(
    w: *mut crate::proc::Proc,
    c: *mut ChanWord,
    buf: *mut u8,
    count: usize,
    direction: IoDirection,
) -> i32 {
    let wp = to_proc_ptr(w);
    wp.as_mut().io = IoSlot { buf, count, direction };
    let pf = current().priofinity();
    match (*c).channel_io(wp, pf) {
        IoOutcome::Parked => 0,
        IoOutcome::WokeAltGuard(guard) => {
            if crate::channel::trigger_alt_guard(guard) {
                current().wake(guard);
            }
            0
        }
        IoOutcome::Completed(other) => {
            let a = wp.as_ref().io;
            let b = other.as_ref().io;
            crate::channel::copy_rendezvous(a, b);
            current().wake(other);
            1
        }
    }
}

/// # Safety
/// `w` and `other` must be valid, live workspace pointers.
#[no_mangle]
pub unsafe extern "C" fn runp(_w: *mut crate::proc::Proc, other: *mut crate::proc::Proc) {
    crate::lifecycle::runp(current(), to_proc_ptr(other));
}

/// # Safety
/// `w` must be a valid, live workspace pointer.
#[no_mangle]
pub unsafe extern "C" fn stopp(w: *mut crate::proc::Proc) {
    crate::lifecycle::stopp(to_proc_ptr(w));
}

/// # Safety
/// `w` and `other` must be valid, live workspace pointers; `other` must
/// have a join block installed by the PAR construct that spawned it.
#[no_mangle]
pub unsafe extern "C" fn endp(_w: *mut crate::proc::Proc, other: *mut crate::proc::Proc) {
    let op = to_proc_ptr(other);
    if let Some(join) = op.as_ref().join.clone() {
        crate::lifecycle::endp(current(), &join);
    }
}

/// Reads the current monotonic clock value, per §6's `CLOCK_MONOTONIC_COARSE`
/// time source.
///
/// # Safety
/// `w` must be a valid workspace pointer (unused beyond validation).
#[no_mangle]
pub unsafe extern "C" fn ldtimer(w: *mut crate::proc::Proc) -> u64 {
    debug_assert!(!w.is_null());
    clock::now_ns()
}

/// # Safety
/// `w` must be a valid, live workspace pointer.
#[no_mangle]
pub unsafe extern "C" fn pause(w: *mut crate::proc::Proc) {
    let _ = crate::lifecycle::pause(current(), to_proc_ptr(w));
}

/// # Safety
/// `w` must be a valid, live workspace pointer with `guard_count` guards
/// about to be registered by the caller.
#[no_mangle]
pub unsafe extern "C" fn alt(w: *mut crate::proc::Proc, guard_count: u32) {
    crate::lifecycle::alt_init(to_proc_ptr(w), guard_count);
}

/// # Safety
/// Same requirements as [`alt`], plus `deadline` must be a valid
/// `CLOCK_MONOTONIC_COARSE` nanosecond timestamp.
#[no_mangle]
pub unsafe extern "C" fn talt(w: *mut crate::proc::Proc, guard_count: u32, deadline: u64) {
    let node = crate::lifecycle::talt_init(current(), to_proc_ptr(w), guard_count, deadline);
    current().register_timer(node);
}
