//! Specialised multi-producer single-consumer queue.
//!
//! Unlike the [generic queue](crate::queue), storage here is one heap node
//! per element linked into an intrusive Vyukov list, which amortises better
//! when `T` is large or the queue holds many elements for a long time. The
//! contract is the generic MPSC contract: FIFO within each producer,
//! capacity semaphore with a soft bound, close-for-push when the consumer
//! dies, close-for-pop once producers die and the residue is drained.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::deadline::Deadline;
use crate::intrusive::{IntrusiveMpscQueue, MpscHook};
use crate::sync::{AcquireStatus, Semaphore, SingleConsumerEvent};

pub use crate::queue::UNBOUNDED;

#[repr(C)]
struct Node<T> {
    // Must stay first: the queue traffics in hook pointers
    hook: MpscHook,
    value: T,
}

/// Multi-producer single-consumer queue with node-per-element storage.
pub struct MpscQueue<T: Send + 'static> {
    queue: IntrusiveMpscQueue,
    nonempty_event: SingleConsumerEvent,
    remaining_capacity: Semaphore,
    consumer_is_created: AtomicBool,
    consumer_is_created_and_dead: AtomicBool,
    producer_is_created_and_dead: AtomicBool,
    producers_count: AtomicUsize,
    size: AtomicUsize,
    _marker: std::marker::PhantomData<T>,
}

// The intrusive list hands nodes between producer and consumer threads;
// the queue owns every linked node's T.
unsafe impl<T: Send + 'static> Send for MpscQueue<T> {}
unsafe impl<T: Send + 'static> Sync for MpscQueue<T> {}

impl<T: Send + 'static> MpscQueue<T> {
    /// Creates a queue with the given soft max size.
    pub fn create(max_size: usize) -> Arc<Self> {
        Arc::new(MpscQueue {
            queue: IntrusiveMpscQueue::default(),
            nonempty_event: SingleConsumerEvent::new(),
            remaining_capacity: Semaphore::new(max_size.min(UNBOUNDED)),
            consumer_is_created: AtomicBool::new(false),
            consumer_is_created_and_dead: AtomicBool::new(false),
            producer_is_created_and_dead: AtomicBool::new(false),
            producers_count: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            _marker: std::marker::PhantomData,
        })
    }

    /// Creates a queue with no effective size limit.
    pub fn create_unbounded() -> Arc<Self> {
        Self::create(UNBOUNDED)
    }

    /// Issues a push handle; one fiber per handle.
    pub fn get_producer(self: &Arc<Self>) -> Producer<T> {
        self.producers_count.fetch_add(1, Ordering::AcqRel);
        self.producer_is_created_and_dead.store(false, Ordering::Release);
        self.nonempty_event.send();
        Producer { queue: self.clone(), _not_sync: std::marker::PhantomData }
    }

    /// Issues a shareable push handle. The single-consumer design makes no
    /// distinction between producer flavours, so this is the same handle
    /// type as [`Self::get_producer`].
    pub fn get_multi_producer(self: &Arc<Self>) -> Producer<T> {
        self.get_producer()
    }

    /// Issues the pop handle.
    ///
    /// # Panics
    ///
    /// Panics if a consumer was ever created; the queue is strictly
    /// single-consumer.
    pub fn get_consumer(self: &Arc<Self>) -> Consumer<T> {
        assert!(
            !self.consumer_is_created.swap(true, Ordering::AcqRel),
            "the MpscQueue consumer must only be obtained a single time"
        );
        Consumer { queue: self.clone(), _not_sync: std::marker::PhantomData }
    }

    /// Changes the soft size limit.
    pub fn set_soft_max_size(&self, max_size: usize) {
        self.remaining_capacity.capacity_control().set_capacity(max_size.min(UNBOUNDED));
    }

    /// The current soft size limit.
    pub fn soft_max_size(&self) -> usize {
        self.remaining_capacity.capacity_control().capacity()
    }

    /// Approximate number of queued elements.
    pub fn size_approximate(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    async fn push(&self, value: T, deadline: Deadline) -> bool {
        match self.remaining_capacity.acquire_until(deadline).await {
            AcquireStatus::Acquired => self.do_push(value),
            _ => false,
        }
    }

    fn push_noblock(&self, value: T) -> bool {
        self.remaining_capacity.try_acquire() && self.do_push(value)
    }

    fn do_push(&self, value: T) -> bool {
        if self.consumer_is_created_and_dead.load(Ordering::Acquire) {
            self.remaining_capacity.release(1);
            return false;
        }

        let node = Box::new(Node { hook: MpscHook::new(), value });
        let hook = NonNull::from(&Box::leak(node).hook);
        unsafe { self.queue.push(hook) };

        self.size.fetch_add(1, Ordering::AcqRel);
        self.nonempty_event.send();
        true
    }

    async fn pop(&self, deadline: Deadline) -> Option<T> {
        loop {
            if let Some(value) = self.do_pop() {
                return Some(value);
            }
            if self.producer_is_created_and_dead.load(Ordering::Acquire)
                || !self.nonempty_event.wait_for_event(deadline).await
            {
                // A producer may have pushed between our pop and its death
                // (or our timeout); check twice to avoid the TOCTOU
                return self.do_pop();
            }
        }
    }

    fn do_pop(&self) -> Option<T> {
        let hook = self.queue.try_pop_weak()?;
        let node = unsafe { Box::from_raw(hook.as_ptr() as *mut Node<T>) };

        self.size.fetch_sub(1, Ordering::AcqRel);
        self.remaining_capacity.release(1);
        self.nonempty_event.reset();
        Some(node.value)
    }

    fn mark_consumer_is_dead(&self) {
        self.consumer_is_created_and_dead.store(true, Ordering::Release);
        self.remaining_capacity.capacity_control().set_capacity_override(0);
    }

    fn mark_producer_is_dead(&self) {
        if self.producers_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.producer_is_created_and_dead.store(true, Ordering::Release);
        }
        self.nonempty_event.send();
    }
}

impl<T: Send + 'static> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        debug_assert!(
            self.consumer_is_created_and_dead.load(Ordering::Relaxed)
                || !self.consumer_is_created.load(Ordering::Relaxed)
        );
        debug_assert_eq!(self.producers_count.load(Ordering::Relaxed), 0);

        // Residual nodes never delivered
        while let Some(hook) = self.queue.try_pop_blocking() {
            drop(unsafe { Box::from_raw(hook.as_ptr() as *mut Node<T>) });
            self.remaining_capacity.release(1);
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for MpscQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpscQueue")
            .field("size_approximate", &self.size_approximate())
            .field("soft_max_size", &self.soft_max_size())
            .finish()
    }
}

/// Push handle of an [`MpscQueue`]; one fiber per handle, open several to
/// push concurrently.
pub struct Producer<T: Send + 'static> {
    queue: Arc<MpscQueue<T>>,
    _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

impl<T: Send + 'static> Producer<T> {
    /// FIFO insertion; blocks while the queue is full. `false` when the
    /// consumer is gone or the wait ended by deadline or cancellation.
    pub async fn push(&self, value: T, deadline: Deadline) -> bool {
        self.queue.push(value, deadline).await
    }

    /// Non-blocking insertion.
    pub fn push_noblock(&self, value: T) -> bool {
        self.queue.push_noblock(value)
    }

    /// The queue this handle feeds.
    pub fn queue(&self) -> &Arc<MpscQueue<T>> {
        &self.queue
    }
}

impl<T: Send + 'static> Drop for Producer<T> {
    fn drop(&mut self) {
        self.queue.mark_producer_is_dead();
    }
}

/// The single pop handle of an [`MpscQueue`].
pub struct Consumer<T: Send + 'static> {
    queue: Arc<MpscQueue<T>>,
    _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

impl<T: Send + 'static> Consumer<T> {
    /// FIFO-within-producer removal; blocks while the queue is empty and
    /// producers live. `None` when the queue is drained and closed, or the
    /// wait ended by deadline or cancellation.
    pub async fn pop(&self, deadline: Deadline) -> Option<T> {
        self.queue.pop(deadline).await
    }

    /// Non-blocking removal.
    pub fn pop_noblock(&self) -> Option<T> {
        self.queue.do_pop()
    }

    /// The queue this handle drains.
    pub fn queue(&self) -> &Arc<MpscQueue<T>> {
        &self.queue
    }
}

impl<T: Send + 'static> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.queue.mark_consumer_is_dead();
    }
}
