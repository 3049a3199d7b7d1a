// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-thread scheduler: run-queues, batch pool, migration windows,
//! mail, timers, and the main dispatch loop of §4.9.

use std::cell::{Cell, RefCell};
use std::sync::atomic::Ordering;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::batch::{Batch, BatchPool};
use crate::channel::trigger_alt_guard;
use crate::clock;
use crate::error::FatalError;
use crate::global;
use crate::mail::MailQueue;
use crate::migration::MigrationWindow;
use crate::priofinity::{Priofinity, MAX_PRIORITY};
use crate::proc::ProcPtr;
use crate::runqueue::RunQueues;
use crate::sync_word::{Sync as SyncBits, SyncWord};
use crate::timer::TimerQueue;

const NUM_PRIORITIES: usize = MAX_PRIORITY as usize + 1;
/// Number of idle-spin revolutions, each up to the calibrated spin budget,
/// before a scheduler runs its housekeeping sweep.
const LAUNDRY_SWEEP_PERIOD: u32 = 16;

/// Which phase of the main loop a scheduler is currently in. Mirrors the
/// spec's `RUNNING`/`DISPATCHING`/`PAUSED`/`SLEEPING` states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Dispatching,
    Paused,
    Sleeping,
}

/// One scheduler: owns a thread's run-queues, batch pool, and the wakeup
/// pipe peers use to rouse it from `safe_pause`.
pub struct Scheduler {
    pub index: u32,
    priofinity: Cell<Priofinity<u64>>,
    current_batch: RefCell<Option<Box<Batch>>>,
    dispatches: Cell<i64>,
    runqueues: RefCell<RunQueues>,
    pool: RefCell<BatchPool>,
    windows: Box<[MigrationWindow]>,
    pub pmail: MailQueue<ProcPtr>,
    bmail: MailQueue<*mut Batch>,
    timers: RefCell<TimerQueue>,
    pub sync: SyncWord,
    pipe_r: i32,
    pipe_w: i32,
    rng: fastrand::Rng,
    spin_budget: Cell<u32>,
    spin_left: Cell<u32>,
    revolution: Cell<u32>,
    phase: Cell<Phase>,
}

// Safety: the only non-`Sync` fields (`Cell`/`RefCell`) are only ever
// accessed from the owning scheduler's own thread; cross-thread access
// goes exclusively through `pmail`/`bmail`/`sync`/`windows`, which are all
// lock-free/atomic by construction.
unsafe impl Sync for Scheduler {}

impl Scheduler {
    #[must_use]
    pub fn new(index: u32, spin_budget: u32) -> Self {
        let (pipe_r, pipe_w) = make_pipe().unwrap_or_else(|e| e.abort());
        Self {
            index,
            priofinity: Cell::new(Priofinity::default()),
            current_batch: RefCell::new(None),
            dispatches: Cell::new(0),
            runqueues: RefCell::new(RunQueues::new()),
            pool: RefCell::new(BatchPool::new()),
            windows: (0..NUM_PRIORITIES).map(|_| MigrationWindow::new()).collect(),
            pmail: MailQueue::new(),
            bmail: MailQueue::new(),
            timers: RefCell::new(TimerQueue::new()),
            sync: SyncWord::new(),
            pipe_r,
            pipe_w,
            rng: fastrand::Rng::new(),
            spin_budget: Cell::new(spin_budget),
            spin_left: Cell::new(spin_budget),
            revolution: Cell::new(0),
            phase: Cell::new(Phase::Dispatching),
        }
    }

    #[must_use]
    pub fn priofinity(&self) -> Priofinity<u64> {
        self.priofinity.get()
    }

    /// Enqueues `w`, taking the fast local-append path when its priofinity
    /// matches the currently-running one, else routing through
    /// `enqueue_far`.
    pub fn enqueue(&self, w: ProcPtr) {
        // Safety: `w` is exclusively owned by the caller.
        let pf = unsafe { w.as_ref().priofinity };
        if pf == self.priofinity.get() {
            let mut cur = self.current_batch.borrow_mut();
            if cur.is_none() {
                *cur = Some(self.pool.borrow_mut().allocate());
            }
            // Safety: `w` is not linked anywhere else.
            unsafe { cur.as_mut().expect("just allocated").push_back(w) };
        } else {
            self.enqueue_far(w, pf);
        }
    }

    fn enqueue_far(&self, w: ProcPtr, pf: Priofinity<u64>) {
        if pf.is_any_affinity() || pf.allows_scheduler(self.index) {
            let mut rq = self.runqueues.borrow_mut();
            let priority = pf.priority();
            // If a pending batch exists for this priority but carries a
            // different priofinity, publish it first so `w` starts a
            // fresh one rather than mixing affinities in one batch.
            if let Some(existing) = rq.take_pending(priority) {
                if existing.priofinity == pf {
                    rq.set_pending(priority, existing);
                } else {
                    rq.publish(priority, existing);
                }
            }
            let mut pending = rq.take_pending(priority).unwrap_or_else(|| {
                let mut b = self.pool.borrow_mut().allocate();
                b.priofinity = pf;
                b
            });
            // Safety: `w` is not linked anywhere else.
            unsafe { pending.push_back(w) };
            rq.set_pending(priority, pending);
            if priority < self.priofinity.get().priority() {
                self.dispatches.set(0);
            }
        } else {
            self.route_to_affine_peer(w, pf);
        }
    }

    fn route_to_affine_peer(&self, w: ProcPtr, pf: Priofinity<u64>) {
        let g = global::get();
        let enabled = g.enabled.load(Ordering::Acquire);
        let mask = u128::from(pf.affinity()) & enabled;
        let Some(target_idx) = crate::bitset::pick_random_bit(mask, &self.rng) else {
            FatalError::UnknownAffinity.abort();
        };
        let Some(target) = g.schedulers.get(target_idx as usize) else {
            FatalError::UnknownAffinity.abort();
        };
        let was_empty = target.pmail.push(w);
        target.sync.set(SyncBits::PMAIL);
        let _ = was_empty;
        self.wake_peer(target);
    }

    fn wake_peer(&self, target: &Scheduler) {
        let g = global::get();
        let was_sleeping = g.sleeping.clear(target.index, Ordering::AcqRel);
        if was_sleeping {
            write_wakeup(target.pipe_w);
        }
    }

    /// Publishes a filled batch owned by a foreign producer; called while
    /// draining `bmail`.
    fn push_batch(&self, raw: *mut Batch) {
        // Safety: `raw` was published by a producer via `MailQueue::push`
        // and is not aliased elsewhere.
        let b = unsafe { Box::from_raw(raw) };
        let priority = b.priofinity.priority();
        self.runqueues.borrow_mut().publish(priority, b);
    }

    fn drain_sync(&self) {
        let pending = self.sync.take();
        if pending.contains(SyncBits::TIME) || pending.contains(SyncBits::TQ) {
            self.check_timer_queue();
        }
        if pending.contains(SyncBits::BMAIL) {
            while let Some(raw) = self.bmail.pop() {
                self.push_batch(raw);
            }
        }
        if pending.contains(SyncBits::PMAIL) {
            while let Some(w) = self.pmail.pop() {
                self.enqueue(w);
            }
        }
    }

    fn check_timer_queue(&self) {
        let now = clock::now_ns();
        let mut timers = self.timers.borrow_mut();
        let (fired, alt_fired) = timers.expire(now);
        for w in fired {
            self.enqueue(w);
        }
        for w in alt_fired {
            if trigger_alt_guard(w) {
                self.enqueue(w);
            }
        }
        if let Some(deadline) = timers.earliest_deadline() {
            arm_interval_timer(deadline.saturating_sub(now));
        }
    }

    /// Publishes the current batch (if any) into the migration window and
    /// local run-queue, then picks the next one to run, per §4.2/§4.4.
    fn pick_batch(&self) -> Option<Box<Batch>> {
        if let Some((priority, batch)) = self.runqueues.borrow_mut().pop_highest() {
            self.priofinity.set(batch.priofinity);
            let _ = priority;
            return Some(batch);
        }
        self.migrate_some_work()
    }

    fn migrate_some_work(&self) -> Option<Box<Batch>> {
        let g = global::get();
        let enabled = g.enabled.load(Ordering::Acquire);
        let sleeping = g.sleeping.load(Ordering::Acquire);
        let active = enabled & !sleeping;
        let n = g.schedulers.len();
        let offset = (self.index as usize) % 4;
        for step in 0..n {
            let idx = (offset + step) % n;
            if idx == self.index as usize || active & (1 << idx) == 0 {
                continue;
            }
            let peer = g.schedulers[idx];
            for priority in 0..NUM_PRIORITIES {
                if let Some(raw) = peer.windows[priority].steal() {
                    // Safety: we now exclusively own the stolen batch.
                    let mut b = unsafe { Box::from_raw(raw) };
                    b.state.store(0, Ordering::Release);
                    self.priofinity.set(b.priofinity);
                    return Some(b);
                }
            }
        }
        None
    }

    /// Publishes `batch` into this scheduler's migration window for the
    /// given priority, unless it carries specific affinity (affine
    /// batches are never stolen).
    fn publish_for_stealing(&self, priority: u8, batch: *mut Batch) {
        if let Some(evicted) = self.windows[priority as usize].publish(batch) {
            // Evicted slot was never stolen; it stays reachable via the
            // local run-queue, so just let the laundry sweep reclaim it
            // next time it's popped from there. Nothing to do here beyond
            // the DIRTY-clear `publish` already performed.
            let _ = evicted;
        }
    }

    /// Runs one iteration of the `DISPATCHING` phase: drains pending
    /// events, ensures a batch is loaded, and returns the next process to
    /// poll (or `None` if the scheduler should idle-spin/pause).
    fn next_process(&self) -> Option<ProcPtr> {
        self.phase.set(Phase::Dispatching);
        self.drain_sync();

        let end_of_batch = {
            let cur = self.current_batch.borrow();
            cur.as_ref().is_none_or(Batch::is_empty) || self.dispatches.get() < 0
        };
        if end_of_batch {
            self.finish_batch();
            if self.current_batch.borrow().is_none() {
                *self.current_batch.borrow_mut() = self.pick_batch();
            }
            if let Some(cur) = self.current_batch.borrow().as_ref() {
                self.dispatches.set(cur.dispatch_budget());
            }
        }

        let mut cur = self.current_batch.borrow_mut();
        let w = cur.as_mut()?.pop_front()?;
        self.dispatches.set(self.dispatches.get() - 1);
        Some(w)
    }

    fn finish_batch(&self) {
        let Some(mut batch) = self.current_batch.borrow_mut().take() else {
            return;
        };
        if batch.is_empty() {
            self.pool.borrow_mut().release_clean(batch);
            return;
        }
        // Split only when enough work remains to make stealing worthwhile.
        if batch.len() >= 2 {
            if let Some(split_off) = batch.split_head() {
                let priority = split_off.priofinity.priority();
                let raw = Box::into_raw(split_off);
                self.publish_for_stealing(priority, raw);
            }
        }
        let priority = batch.priofinity.priority();
        self.runqueues.borrow_mut().publish(priority, batch);
    }

    /// Runs the idle-handling step of the dispatch loop: spin briefly,
    /// run housekeeping periodically, then pause or check for deadlock.
    fn idle_step(&self) {
        if self.spin_left.get() > 0 {
            if self.revolution.get() < LAUNDRY_SWEEP_PERIOD {
                self.pool.borrow_mut().laundry_sweep();
                self.pool.borrow_mut().trim();
            }
            self.revolution.set(self.revolution.get() + 1);
            self.spin_left.set(self.spin_left.get() - 1);
            std::hint::spin_loop();
            return;
        }

        let g = global::get();
        g.sleeping.set(self.index, Ordering::AcqRel);
        if !self.timers.borrow().is_empty() {
            self.phase.set(Phase::Paused);
            self.safe_pause();
        } else {
            g.idle.set(self.index, Ordering::AcqRel);
            if global::is_quiescent() {
                FatalError::Deadlock.abort();
            }
            self.phase.set(Phase::Sleeping);
            self.safe_pause();
            g.idle.clear(self.index, Ordering::AcqRel);
        }
        g.sleeping.clear(self.index, Ordering::AcqRel);
        self.spin_left.set(self.spin_budget.get());
        self.revolution.set(0);
    }

    /// Blocks reading the wakeup pipe until `sync` has something pending,
    /// then re-publishes whatever was (partially) observed so the next
    /// `drain_sync` call picks it up.
    fn safe_pause(&self) {
        let mut byte = [0u8; 1];
        loop {
            // Safety: `pipe_r` is a valid fd owned by this scheduler.
            let n = unsafe { libc::read(self.pipe_r, byte.as_mut_ptr().cast(), 1) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
            }
            if !self.sync.is_empty() {
                return;
            }
        }
    }

    /// One iteration of the scheduler's main loop: obtain a process (or
    /// idle), poll it once.
    pub fn tick(&'static self) {
        let Some(w) = self.next_process() else {
            self.idle_step();
            return;
        };
        self.phase.set(Phase::Running);
        CURRENT_PROC.with(|c| c.set(Some(w)));
        // Safety: `w` was just dequeued; this thread is its sole owner
        // for the duration of the poll.
        let proc = unsafe { w.as_mut() };
        let waker = make_waker(w);
        let mut cx = Context::from_waker(&waker);
        let result = proc.poll(&mut cx);
        CURRENT_PROC.with(|c| c.set(None));
        match result {
            Poll::Ready(()) => {
                // Safety: the process completed; no other pointer to it
                // survives.
                unsafe { drop(w.into_box()) };
            }
            Poll::Pending => {
                // The future is responsible for having either re-enqueued
                // itself (via its waker, synchronously, if already
                // ready) or parked `w` into a channel/timer/mail slot
                // before returning `Pending`. Nothing further to do here.
            }
        }
    }

    pub fn wake(&self, w: ProcPtr) {
        self.enqueue(w);
    }

    /// Registers a freshly-built timer node, rearming the interval timer
    /// if it becomes the new earliest deadline.
    pub fn register_timer(&self, node: Box<crate::timer::TimerNode>) {
        let became_head = self.timers.borrow_mut().insert(node);
        if became_head {
            let now = clock::now_ns();
            if let Some(deadline) = self.timers.borrow().earliest_deadline() {
                arm_interval_timer(deadline.saturating_sub(now));
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Safety: fds owned exclusively by this scheduler.
        unsafe {
            libc::close(self.pipe_r);
            libc::close(self.pipe_w);
        }
    }
}

fn make_pipe() -> Result<(i32, i32), FatalError> {
    let mut fds = [0i32; 2];
    // Safety: `fds` is a valid 2-element out-array.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(FatalError::PipeCreate(std::io::Error::last_os_error()));
    }
    Ok((fds[0], fds[1]))
}

fn write_wakeup(fd: i32) {
    let byte = [1u8; 1];
    // Safety: `fd` is a valid, open pipe write end.
    unsafe {
        libc::write(fd, byte.as_ptr().cast(), 1);
    }
}

/// Arms `ITIMER_REAL` to fire once after `delta_ns`, so `SIGALRM` lands
/// close to the earliest pending timer-queue deadline.
fn arm_interval_timer(delta_ns: u64) {
    let delta_ns = delta_ns.max(1);
    let it = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: (delta_ns / 1_000_000_000) as libc::time_t,
            tv_usec: ((delta_ns % 1_000_000_000) / 1000) as libc::suseconds_t,
        },
    };
    // Safety: `it` is a valid, fully-initialized `itimerval`.
    unsafe {
        libc::setitimer(libc::ITIMER_REAL, &it, std::ptr::null_mut());
    }
}

// --- Waker plumbing -------------------------------------------------------
//
// A process's waker is just its own `ProcPtr`, re-enqueued on its owning
// scheduler when woken. This mirrors "rescheduling a process" in the
// documented re-architecture (§1.1): waking the waker is the `Future`
// analogue of the source's tail-jump back into the scheduler.

struct WakerPayload {
    proc: ProcPtr,
    scheduler: &'static Scheduler,
}

fn make_waker(w: ProcPtr) -> Waker {
    let scheduler = current();
    let payload = Box::new(WakerPayload { proc: w, scheduler });
    let raw = RawWaker::new(Box::into_raw(payload).cast(), &VTABLE);
    // Safety: `raw` was constructed from a valid `WakerPayload` and the
    // vtable's contract matches the layout used by `clone`/`wake`/`drop`.
    unsafe { Waker::from_raw(raw) }
}

unsafe fn clone_fn(data: *const ()) -> RawWaker {
    let payload = &*data.cast::<WakerPayload>();
    let cloned = Box::new(WakerPayload {
        proc: payload.proc,
        scheduler: payload.scheduler,
    });
    RawWaker::new(Box::into_raw(cloned).cast(), &VTABLE)
}

unsafe fn wake_fn(data: *const ()) {
    let payload = Box::from_raw(data.cast::<WakerPayload>() as *mut WakerPayload);
    payload.scheduler.wake(payload.proc);
}

unsafe fn wake_by_ref_fn(data: *const ()) {
    let payload = &*data.cast::<WakerPayload>();
    payload.scheduler.wake(payload.proc);
}

unsafe fn drop_fn(data: *const ()) {
    drop(Box::from_raw(data.cast::<WakerPayload>() as *mut WakerPayload));
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

thread_local! {
    static CURRENT: Cell<Option<&'static Scheduler>> = const { Cell::new(None) };
    static CURRENT_PROC: Cell<Option<ProcPtr>> = const { Cell::new(None) };
}

/// Binds `s` as the calling thread's scheduler. Called once per scheduler
/// thread at startup.
pub fn bind_current(s: &'static Scheduler) {
    CURRENT.with(|c| c.set(Some(s)));
}

/// Returns the calling thread's bound scheduler.
///
/// # Panics
/// Panics if called from a thread that never called [`bind_current`] — a
/// programming error, since only scheduler threads run process code.
#[must_use]
pub fn current() -> &'static Scheduler {
    CURRENT.with(|c| c.get()).expect("slick: no scheduler bound to this thread")
}

/// Returns the `ProcPtr` of the process whose `Future::poll` is
/// currently executing on this thread. Valid only during the extent of a
/// single `tick()`'s call into `proc.poll`; this is how a process's own
/// async body recovers a handle to its own workspace to stage channel
/// I/O, mirroring `w` being implicitly available to generated code in
/// the host ABI.
///
/// # Panics
/// Panics if called outside of a process poll.
#[must_use]
pub fn current_proc() -> ProcPtr {
    CURRENT_PROC
        .with(|c| c.get())
        .expect("slick: current_proc() called outside of a process poll")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_starts_with_no_work() {
        let s = Scheduler::new(0, 0);
        assert!(s.pick_batch().is_none());
    }
}
