//! Intrusive Vyukov MPSC list.
//!
//! Producers `swap` the shared tail and then link the previous tail's
//! `next`; the single consumer walks `next` links from its private head
//! cursor. Between the swap and the link there is a transient window in
//! which the list looks broken from the consumer's side:
//!
//! ```text
//!  head ──► n1 ──► n2 ─╳        tail ──► n3
//!                  (next not linked yet)
//! ```
//!
//! [`IntrusiveMpscQueue::try_pop_weak`] reports `None` in that window (as
//! well as on a genuinely empty list); the caller re-checks after its
//! wakeup event fires. [`IntrusiveMpscQueue::try_pop_blocking`] spins the
//! window out and is meant for destructor drains.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::Backoff;

/// The embedded link. Must be the first field of a `#[repr(C)]` node so
/// that a hook pointer is also a node pointer.
#[derive(Default)]
pub(crate) struct MpscHook {
    next: AtomicPtr<MpscHook>,
}

impl MpscHook {
    pub(crate) const fn new() -> Self {
        MpscHook { next: AtomicPtr::new(ptr::null_mut()) }
    }
}

enum Pop {
    Node(NonNull<MpscHook>),
    Empty,
    /// A producer is between its tail swap and its next-link store.
    Inconsistent,
}

/// Lock-free FIFO list of intrusive hooks; many producers, one consumer.
pub(crate) struct IntrusiveMpscQueue {
    /// Producer end, most recently pushed node.
    tail: AtomicPtr<MpscHook>,
    /// Consumer cursor. Only the single consumer touches it.
    head: AtomicPtr<MpscHook>,
    /// Permanent dummy node; the list is empty when head == tail == stub.
    stub: Box<MpscHook>,
}

// The hooks themselves carry no payload; the wrapper that casts hooks back
// to nodes is responsible for the payload's Send bound.
unsafe impl Send for IntrusiveMpscQueue {}
unsafe impl Sync for IntrusiveMpscQueue {}

impl Default for IntrusiveMpscQueue {
    fn default() -> Self {
        let stub = Box::new(MpscHook::new());
        let stub_ptr = &*stub as *const MpscHook as *mut MpscHook;
        IntrusiveMpscQueue {
            tail: AtomicPtr::new(stub_ptr),
            head: AtomicPtr::new(stub_ptr),
            stub,
        }
    }
}

impl IntrusiveMpscQueue {
    fn stub_ptr(&self) -> *mut MpscHook {
        &*self.stub as *const MpscHook as *mut MpscHook
    }

    /// Links `hook` at the producer end. Lock-free, any thread.
    ///
    /// # Safety
    ///
    /// `hook` must be live, unlinked, and stay live until popped.
    pub(crate) unsafe fn push(&self, hook: NonNull<MpscHook>) {
        unsafe { self.push_ptr(hook.as_ptr()) }
    }

    unsafe fn push_ptr(&self, hook: *mut MpscHook) {
        unsafe { (*hook).next.store(ptr::null_mut(), Ordering::Relaxed) };
        // The swap makes us the new tail; the release-store below hands the
        // node over to the consumer
        let prev = self.tail.swap(hook, Ordering::AcqRel);
        unsafe { (*prev).next.store(hook, Ordering::Release) };
    }

    fn do_pop(&self) -> Pop {
        let stub = self.stub_ptr();
        let mut head = self.head.load(Ordering::Relaxed);
        let mut next = unsafe { (*head).next.load(Ordering::Acquire) };

        if head == stub {
            if next.is_null() {
                if self.tail.load(Ordering::Acquire) == stub {
                    return Pop::Empty;
                }
                // Producer swapped the tail but has not linked us yet
                return Pop::Inconsistent;
            }
            // Skip over the dummy
            self.head.store(next, Ordering::Relaxed);
            head = next;
            next = unsafe { (*head).next.load(Ordering::Acquire) };
        }

        if !next.is_null() {
            self.head.store(next, Ordering::Relaxed);
            return Pop::Node(unsafe { NonNull::new_unchecked(head) });
        }

        if self.tail.load(Ordering::Acquire) != head {
            return Pop::Inconsistent;
        }

        // `head` is the last real node. Park the dummy behind it so the
        // cursor has somewhere to advance to.
        unsafe { self.push_ptr(stub) };

        next = unsafe { (*head).next.load(Ordering::Acquire) };
        if !next.is_null() {
            self.head.store(next, Ordering::Relaxed);
            return Pop::Node(unsafe { NonNull::new_unchecked(head) });
        }
        Pop::Inconsistent
    }

    /// Pops the front hook. `None` means empty *or* transiently
    /// inconsistent; callers gated on a "nonempty" event re-check after the
    /// next wakeup. Single consumer only.
    pub(crate) fn try_pop_weak(&self) -> Option<NonNull<MpscHook>> {
        match self.do_pop() {
            Pop::Node(node) => Some(node),
            Pop::Empty | Pop::Inconsistent => None,
        }
    }

    /// Pops the front hook, spinning out transient inconsistency. `None`
    /// means definitely empty. Single consumer only.
    pub(crate) fn try_pop_blocking(&self) -> Option<NonNull<MpscHook>> {
        let backoff = Backoff::new();
        loop {
            match self.do_pop() {
                Pop::Node(node) => return Some(node),
                Pop::Empty => return None,
                Pop::Inconsistent => backoff.snooze(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[repr(C)]
    struct TestNode {
        hook: MpscHook,
        value: u64,
    }

    fn push_value(queue: &IntrusiveMpscQueue, value: u64) {
        let node = Box::new(TestNode { hook: MpscHook::new(), value });
        let hook = NonNull::from(&Box::leak(node).hook);
        unsafe { queue.push(hook) };
    }

    fn pop_value(queue: &IntrusiveMpscQueue) -> Option<u64> {
        queue.try_pop_blocking().map(|hook| {
            let node = unsafe { Box::from_raw(hook.as_ptr() as *mut TestNode) };
            node.value
        })
    }

    #[test]
    fn fifo_single_thread() {
        let queue = IntrusiveMpscQueue::default();
        assert!(queue.try_pop_weak().is_none());

        for v in 0..5 {
            push_value(&queue, v);
        }
        for v in 0..5 {
            assert_eq!(pop_value(&queue), Some(v));
        }
        assert!(pop_value(&queue).is_none());
    }

    #[test]
    fn interleaved_push_pop() {
        let queue = IntrusiveMpscQueue::default();
        push_value(&queue, 1);
        assert_eq!(pop_value(&queue), Some(1));
        push_value(&queue, 2);
        push_value(&queue, 3);
        assert_eq!(pop_value(&queue), Some(2));
        push_value(&queue, 4);
        assert_eq!(pop_value(&queue), Some(3));
        assert_eq!(pop_value(&queue), Some(4));
        assert!(pop_value(&queue).is_none());
    }

    #[test]
    fn fifo_per_producer_under_contention() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 1000;

        let queue = Arc::new(IntrusiveMpscQueue::default());
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    push_value(&queue, p * PER_PRODUCER + i);
                }
            }));
        }

        let mut last_seen = [None::<u64>; PRODUCERS as usize];
        let mut popped = 0;
        while popped < PRODUCERS * PER_PRODUCER {
            if let Some(value) = pop_value(&queue) {
                let producer = (value / PER_PRODUCER) as usize;
                if let Some(last) = last_seen[producer] {
                    assert!(value > last, "per-producer FIFO violated: {last} then {value}");
                }
                last_seen[producer] = Some(value);
                popped += 1;
            } else {
                std::hint::spin_loop();
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pop_value(&queue).is_none());
    }
}
