// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `Proc`: the per-process workspace.
//!
//! A `Proc` is the heap-allocated control block of one lightweight process.
//! It is exclusively owned by whichever batch, channel slot, or timer node
//! currently holds a pointer to it — ownership transfers by moving the raw
//! pointer, never by cloning an `Arc`. The one deliberate exception is
//! [`JoinBlock`], which backs a PAR construct's join counter and is
//! genuinely shared between sibling branches.

use std::future::Future;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Waker};

use crate::priofinity::Priofinity;

pub type BoxedFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Direction of an in-flight channel I/O staged on a [`Proc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Input,
    Output,
}

/// A process's staged channel I/O: a typeless `(pointer, length, direction)`
/// triple. The scheduler only ever copies raw bytes of the declared size —
/// payload layout is the host's concern, not the run-time's.
#[derive(Debug, Clone, Copy)]
pub struct IoSlot {
    pub buf: *mut u8,
    pub count: usize,
    pub direction: IoDirection,
}

impl IoSlot {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            buf: std::ptr::null_mut(),
            count: 0,
            direction: IoDirection::Input,
        }
    }
}

// Safety: the pointer inside `IoSlot` is only ever dereferenced by the
// scheduler that currently owns the `Proc` it's embedded in, matching the
// single-owner discipline documented on `Proc` itself.
unsafe impl Send for IoSlot {}

/// ALT (guarded choice) bookkeeping packed into one word.
///
/// `alt_state` layout: bit 31 = `ENABLING`, bit 30 = `WAITING`, bit 29 =
/// `NOT_READY`, low 29 bits = outstanding guard count.
pub mod alt_state {
    pub const ENABLING: u32 = 1 << 31;
    pub const WAITING: u32 = 1 << 30;
    pub const NOT_READY: u32 = 1 << 29;
    pub const COUNT_MASK: u32 = (1 << 29) - 1;
}

/// The shared join counter backing a PAR construct's `endp`/`startp`
/// bookkeeping. Unlike every other cross-process link in this crate, this
/// one is legitimately multi-writer (every sibling branch may be the last
/// to finish), hence the `Arc`.
#[derive(Debug)]
pub struct JoinBlock {
    /// Remaining branches. Reaches zero exactly once.
    outstanding: AtomicU32,
    /// The parent's saved resume point, taken by whichever branch finishes
    /// last. `None` once resumed.
    parent: spin::Mutex<Option<ProcPtr>>,
    /// The parent's priofinity at the point it called PAR, restored on
    /// resume.
    parent_priofinity: AtomicU64,
}

impl JoinBlock {
    #[must_use]
    pub fn new(branches: u32, parent: ProcPtr, parent_priofinity: Priofinity<u64>) -> Arc<Self> {
        Arc::new(Self {
            outstanding: AtomicU32::new(branches),
            parent: spin::Mutex::new(Some(parent)),
            parent_priofinity: AtomicU64::new(parent_priofinity.as_raw()),
        })
    }

    /// Decrements the outstanding count. Returns the parent's resume point
    /// and priofinity iff this call observed the count reach zero.
    #[must_use]
    pub fn dec(&self) -> Option<(ProcPtr, Priofinity<u64>)> {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) != 1 {
            return None;
        }
        let parent = self.parent.lock().take()?;
        let pf = Priofinity::from_raw(self.parent_priofinity.load(Ordering::Acquire));
        Some((parent, pf))
    }
}

/// A process control block: the "workspace" of the specification.
pub struct Proc {
    /// Suspended continuation. `None` only transiently, while a poll is in
    /// progress on this thread.
    pub future: Option<BoxedFuture>,
    pub waker: Option<Waker>,
    /// Intrusive next-in-batch / next-in-queue link.
    pub link: Option<ProcPtr>,
    pub priofinity: Priofinity<u64>,
    pub io: IoSlot,
    /// Link into the owning scheduler's timer queue, if registered.
    pub timer_link: Option<NonNull<crate::timer::TimerNode>>,
    pub deadline: u64,
    pub alt_state: AtomicU32,
    /// Set when this process is a PAR branch; `endp` decrements it.
    pub join: Option<Arc<JoinBlock>>,
}

impl Proc {
    #[must_use]
    pub fn new(future: BoxedFuture, priofinity: Priofinity<u64>) -> Box<Self> {
        Box::new(Self {
            future: Some(future),
            waker: None,
            link: None,
            priofinity,
            io: IoSlot::empty(),
            timer_link: None,
            deadline: 0,
            alt_state: AtomicU32::new(0),
            join: None,
        })
    }

    /// Polls the staged future once. Consumes `self.future` for the
    /// duration of the call so re-entrant access during the poll can't
    /// alias it.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> std::task::Poll<()> {
        let mut fut = self.future.take().expect("poll on a completing Proc");
        let res = fut.as_mut().poll(cx);
        if res.is_pending() {
            self.future = Some(fut);
        }
        res
    }
}

/// A raw, non-null pointer to a [`Proc`], carrying the crate's single-owner
/// discipline: holding a `ProcPtr` asserts exclusive access to the
/// pointee, enforced by convention (batches/channels/timers never keep two
/// copies of the same `ProcPtr` live at once) rather than by the type
/// system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcPtr(NonNull<Proc>);

impl ProcPtr {
    #[must_use]
    pub fn new(b: Box<Proc>) -> Self {
        Self(NonNull::new(Box::into_raw(b)).expect("Box::into_raw is never null"))
    }

    /// Reclaims ownership, dropping the `Proc`.
    ///
    /// # Safety
    /// The caller must guarantee no other `ProcPtr` aliasing the same
    /// process is still considered live.
    pub unsafe fn into_box(self) -> Box<Proc> {
        Box::from_raw(self.0.as_ptr())
    }

    #[must_use]
    pub fn as_ptr(self) -> *mut Proc {
        self.0.as_ptr()
    }

    #[must_use]
    pub fn from_non_null(ptr: NonNull<Proc>) -> Self {
        Self(ptr)
    }

    /// # Safety
    /// The caller must guarantee this `ProcPtr` is the unique live
    /// reference to the pointee for the duration of the borrow.
    #[allow(clippy::should_implement_trait)]
    pub unsafe fn as_mut<'a>(self) -> &'a mut Proc {
        &mut *self.0.as_ptr()
    }

    /// # Safety
    /// Same requirement as [`Self::as_mut`], relaxed to a shared borrow.
    pub unsafe fn as_ref<'a>(self) -> &'a Proc {
        &*self.0.as_ptr()
    }
}

// Safety: a `ProcPtr` is moved between threads only while its pointee is
// not concurrently accessed elsewhere, per the single-owner discipline
// documented on `ProcPtr` and `Proc`.
unsafe impl Send for ProcPtr {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Poll;

    #[test]
    fn new_proc_is_pending_until_polled() {
        let fut: BoxedFuture = Box::pin(async {});
        let p = Proc::new(fut, Priofinity::any(10));
        assert!(p.future.is_some());
    }

    #[test]
    fn join_block_fires_on_last_dec() {
        let parent_fut: BoxedFuture = Box::pin(async {});
        let parent = ProcPtr::new(Proc::new(parent_fut, Priofinity::any(5)));
        let jb = JoinBlock::new(2, parent, Priofinity::any(5));
        assert!(jb.dec().is_none());
        let resumed = jb.dec();
        assert!(resumed.is_some());
        // Safety: test-local, no other pointer to `parent` is live.
        unsafe {
            drop(parent.into_box());
        }
    }
}
