// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-scheduler timer queue: a doubly-linked list ordered ascending by
//! deadline, expired via a `SIGALRM`-driven `check_timer_queue` walk.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::proc::ProcPtr;

/// A timer-queue node. `proc`'s low bit marks an ALT registration; the
/// pointer itself is swapped to null on cancellation or firing.
pub struct TimerNode {
    pub time: u64,
    pub next: Option<Box<TimerNode>>,
    pub prev: Option<NonNull<TimerNode>>,
    /// Tagged: low bit set means this node belongs to an ALTing process.
    pub proc: AtomicPtr<()>,
}

const ALT_TAG: usize = 1;

impl TimerNode {
    #[must_use]
    pub fn new(time: u64, w: ProcPtr, is_alt: bool) -> Box<Self> {
        let mut tagged = w.as_ptr() as usize;
        if is_alt {
            tagged |= ALT_TAG;
        }
        Box::new(Self {
            time,
            next: None,
            prev: None,
            proc: AtomicPtr::new(tagged as *mut ()),
        })
    }

    #[must_use]
    pub fn is_alt(&self) -> bool {
        (self.proc.load(Ordering::Acquire) as usize) & ALT_TAG != 0
    }

    /// Atomically takes the workspace pointer, leaving the node cancelled.
    /// Returns `None` if it was already taken (raced with cancellation or
    /// a prior expiry).
    #[must_use]
    pub fn take_proc(&self) -> Option<ProcPtr> {
        let prev = self.proc.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let untagged = (prev as usize) & !ALT_TAG;
        NonNull::new(untagged as *mut crate::proc::Proc).map(ProcPtr::from_non_null)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.proc.load(Ordering::Acquire).is_null()
    }
}

/// Doubly-linked, deadline-ordered timer queue. Owned exclusively by one
/// scheduler; peers may only cancel via [`TimerNode::take_proc`].
pub struct TimerQueue {
    head: Option<Box<TimerNode>>,
    tail: Option<NonNull<TimerNode>>,
}

impl TimerQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[must_use]
    pub fn earliest_deadline(&self) -> Option<u64> {
        self.head.as_ref().map(|n| n.time)
    }

    /// Inserts `node`, walking from the head to preserve ascending order.
    /// Returns `true` if the node became the new head (the caller should
    /// rearm the interval timer).
    pub fn insert(&mut self, mut node: Box<TimerNode>) -> bool {
        // Walk to find the first node whose deadline is >= node.time.
        let mut cursor = &mut self.head;
        let mut became_head = true;
        loop {
            match cursor {
                Some(n) if n.time < node.time => {
                    cursor = &mut n.next;
                    became_head = false;
                }
                _ => break,
            }
        }
        node.prev = None; // filled in below if not head
        let raw: *mut TimerNode = &mut *node;
        let rest = cursor.take();
        if let Some(mut r) = rest {
            r.prev = Some(NonNull::new(raw).expect("node is non-null"));
            node.next = Some(r);
        } else {
            self.tail = Some(NonNull::new(raw).expect("node is non-null"));
        }
        *cursor = Some(node);
        became_head
    }

    /// Removes and returns the current head.
    fn pop_front(&mut self) -> Option<Box<TimerNode>> {
        let mut head = self.head.take()?;
        self.head = head.next.take();
        if let Some(mut h) = self.head.as_mut() {
            h.prev = None;
        } else {
            self.tail = None;
        }
        Some(head)
    }

    /// Walks the head of the queue, firing (enqueue) or releasing every
    /// node whose deadline has passed or whose `proc` was cancelled.
    /// Returns the list of workspaces to enqueue (non-ALT expiries) and
    /// the list of ALT nodes whose guard fired (for `trigger_alt_guard`).
    pub fn expire(&mut self, now: u64) -> (Vec<ProcPtr>, Vec<ProcPtr>) {
        let mut fired = Vec::new();
        let mut alt_fired = Vec::new();
        while let Some(expired) = self.peek_expired_or_cancelled(now) {
            let node = self.pop_front().expect("peek confirmed a head");
            if node.is_cancelled() {
                continue;
            }
            if node.is_alt() {
                if let Some(w) = node.take_proc() {
                    alt_fired.push(w);
                }
            } else if let Some(w) = node.take_proc() {
                fired.push(w);
            }
            let _ = expired;
        }
        (fired, alt_fired)
    }

    fn peek_expired_or_cancelled(&self, now: u64) -> Option<()> {
        let head = self.head.as_ref()?;
        if head.is_cancelled() || head.time <= now {
            Some(())
        } else {
            None
        }
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priofinity::Priofinity;
    use crate::proc::{BoxedFuture, Proc};

    fn dummy() -> ProcPtr {
        let fut: BoxedFuture = Box::pin(async {});
        ProcPtr::new(Proc::new(fut, Priofinity::any(10)))
    }

    #[test]
    fn insert_maintains_ascending_order() {
        let mut q = TimerQueue::new();
        let a = dummy();
        let b = dummy();
        let c = dummy();
        assert!(q.insert(TimerNode::new(30, a, false)));
        assert!(!q.insert(TimerNode::new(10, b, false)));
        assert_eq!(q.earliest_deadline(), Some(10));
        assert!(!q.insert(TimerNode::new(20, c, false)));
        assert_eq!(q.earliest_deadline(), Some(10));
        let (fired, _) = q.expire(100);
        assert_eq!(fired.len(), 3);
        for w in fired {
            unsafe { drop(w.into_box()) };
        }
    }

    #[test]
    fn cancelled_node_is_skipped_without_firing() {
        let mut q = TimerQueue::new();
        let a = dummy();
        let node = TimerNode::new(5, a, false);
        let node_ref: *const TimerNode = &*node;
        q.insert(node);
        // Safety: node is still alive inside the queue.
        unsafe { assert!((*node_ref).take_proc().is_some()) };
        let (fired, alt_fired) = q.expire(1000);
        assert!(fired.is_empty());
        assert!(alt_fired.is_empty());
        unsafe { drop(a.into_box()) };
    }
}
