// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lock-free multi-producer, single-consumer mail queues.
//!
//! `pmail` carries single workspaces routed to a foreign scheduler; `bmail`
//! carries whole batches. Both are instances of the same Vyukov-style
//! intrusive-node MPSC queue: producers swap into the tail slot then link
//! the previous tail's `next`; the single consumer (the owning scheduler)
//! walks from a stub head, never racing another consumer.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    item: Option<T>,
}

impl<T> Node<T> {
    fn new(item: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            item,
        }))
    }
}

/// A lock-free MPSC queue. `head` is consumer-owned (by convention, not
/// the type system — only the scheduler that owns this queue ever calls
/// `pop`); `tail` is the atomic producer hand-off point.
pub struct MailQueue<T> {
    head: Cell<*mut Node<T>>,
    tail: AtomicPtr<Node<T>>,
}

// Safety: producers only ever touch `tail` (atomically) and the node they
// just allocated; the consumer only ever touches `head` from the owning
// scheduler thread. `T: Send` is the only real requirement for crossing
// threads.
unsafe impl<T: Send> Send for MailQueue<T> {}
unsafe impl<T: Send> Sync for MailQueue<T> {}

impl<T> MailQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        let stub = Node::new(None);
        Self {
            head: Cell::new(stub),
            tail: AtomicPtr::new(stub),
        }
    }

    /// Pushes `item`. Safe to call from any producer thread concurrently.
    /// Returns `true` if the queue was empty before this push (useful for
    /// deciding whether to wake the consumer).
    pub fn push(&self, item: T) -> bool {
        let node = Node::new(Some(item));
        // Safety: `node` was just allocated by this call and is not yet
        // reachable from any other thread.
        let prev = self.tail.swap(node, Ordering::AcqRel);
        let was_empty = prev == self.head.get();
        // Safety: `prev` is a previously-published node (either the stub
        // or an earlier push); linking it is the sole write that makes
        // `node` consumer-reachable.
        unsafe { (*prev).next.store(node, Ordering::Release) };
        was_empty
    }

    /// Pops one item, if any. Must only be called from the single
    /// consumer thread (the scheduler that owns this queue). Uses a short
    /// backoff against the narrow window where `push` has swapped `tail`
    /// but not yet linked `next`.
    pub fn pop(&self) -> Option<T> {
        let mut backoff = spin::Backoff::new();
        loop {
            let head = self.head.get();
            // Safety: `head` is always a valid node; only this queue's
            // single consumer thread ever calls `pop`.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if next.is_null() {
                if self.tail.load(Ordering::Acquire) == head {
                    return None;
                }
                // Producer is mid-push: `tail` moved but `next` isn't
                // linked yet. Spin briefly; this window is always short.
                backoff.spin();
                continue;
            }
            // Safety: `next` is non-null and was published by `push`
            // before the node holding it became reachable.
            let item = unsafe { (*next).item.take() };
            // Safety: `head` (the old stub/consumed node) is no longer
            // reachable from any producer once `next` replaces it.
            unsafe { drop(Box::from_raw(head)) };
            self.head.set(next);
            return item;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        // Safety: reading `next` off the consumer-owned head is racy only
        // in the conservative direction (may report non-empty just before
        // a push finishes linking); never a false "empty".
        unsafe { (*self.head.get()).next.load(Ordering::Acquire).is_null() }
    }
}

impl<T> Drop for MailQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        // Safety: the final stub/consumed head is never shared once the
        // queue itself is being dropped.
        unsafe { drop(Box::from_raw(self.head.get())) };
    }
}

impl<T> Default for MailQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_thread_fifo() {
        let q: MailQueue<u32> = MailQueue::new();
        assert!(q.is_empty());
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn concurrent_producers_single_consumer() {
        let q = Arc::new(MailQueue::<u32>::new());
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..100u32 {
                    q.push(t * 100 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut count = 0;
        // Safety: all producers have joined; this thread is the sole
        // consumer for the remainder of the queue's life.
        let q = Arc::try_unwrap(q).unwrap_or_else(|_| unreachable!());
        while q.pop().is_some() {
            count += 1;
        }
        assert_eq!(count, 800);
    }
}
