//! Producer and consumer side implementations.
//!
//! The single-handle sides gate on a [`SingleConsumerEvent`]; the
//! multi-handle sides gate on a [`Semaphore`] whose permits count free
//! capacity (producers) or queued elements (consumers). The policy picks
//! one of each at compile time; the sides reach the queue's storage and
//! close flags through [`QueueInternal`], so none of this is shape-aware.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::deadline::Deadline;
use crate::queue::{SEMAPHORE_UNLOCK_VALUE, UNBOUNDED};
use crate::sync::{AcquireStatus, Semaphore, SingleConsumerEvent};

/// What a queue core exposes to its sides: the backing storage, the
/// handle-accounting flags and the policy's element-size hook.
pub trait QueueInternal<T>: Send + Sync {
    fn no_more_consumers(&self) -> bool;
    fn no_more_producers(&self) -> bool;

    /// Unconditional insertion into the backing store; notifies the
    /// consumer side.
    fn do_push(&self, value: T);

    /// Removal from the backing store; credits the producer side.
    fn do_pop(&self) -> Option<T>;

    fn backing_len(&self) -> usize;

    /// The policy's capacity charge for one element.
    fn element_size(&self, value: &T) -> usize;
}

/// Push-side behaviour of a queue shape.
pub trait ProducerSide<T>: Send + Sync {
    fn with_capacity(capacity: usize) -> Self;

    /// Blocking FIFO insertion. `false` when the queue is closed for push
    /// or the wait ended by deadline or cancellation.
    fn push<'a, Q: QueueInternal<T>>(
        &'a self,
        queue: &'a Q,
        value: T,
        deadline: Deadline,
    ) -> impl Future<Output = bool> + Send + 'a
    where
        T: 'a;

    fn push_noblock<Q: QueueInternal<T>>(&self, queue: &Q, value: T) -> bool;

    /// A pop released `size` units of capacity.
    fn on_element_popped(&self, size: usize);

    /// The last consumer died: fail and wake every parked producer.
    fn stop_blocking_on_push(&self);

    /// A consumer exists again after all had died.
    fn resume_blocking_on_push(&self);

    fn set_soft_max_size(&self, size: usize);
    fn soft_max_size(&self) -> usize;
    fn size_approximate<Q: QueueInternal<T>>(&self, queue: &Q) -> usize;
}

/// Pop-side behaviour of a queue shape.
pub trait ConsumerSide<T>: Send + Sync {
    fn new() -> Self;

    /// Blocking FIFO removal. `None` when the queue is closed for pop and
    /// drained, or the wait ended by deadline or cancellation.
    fn pop<'a, Q: QueueInternal<T>>(
        &'a self,
        queue: &'a Q,
        deadline: Deadline,
    ) -> impl Future<Output = Option<T>> + Send + 'a
    where
        T: 'a;

    fn pop_noblock<Q: QueueInternal<T>>(&self, queue: &Q) -> Option<T>;

    /// A push made one more element available.
    fn on_element_pushed(&self);

    /// The last producer died: release every parked consumer so it can
    /// drain the residue and observe the closure.
    fn stop_blocking_on_pop(&self);

    /// A producer exists again after all had died.
    fn resume_blocking_on_pop(&self);
}

/// Push side for a single producer handle: an event plus two counters.
pub struct SingleProducerSide {
    non_full_event: SingleConsumerEvent,
    used_capacity: AtomicUsize,
    total_capacity: AtomicUsize,
}

impl SingleProducerSide {
    fn try_push<T, Q: QueueInternal<T>>(&self, queue: &Q, value: &mut Option<T>, size: usize) -> bool {
        if self.used_capacity.load(Ordering::Acquire) + size > self.total_capacity.load(Ordering::Acquire)
        {
            return false;
        }
        self.used_capacity.fetch_add(size, Ordering::AcqRel);
        queue.do_push(value.take().expect("push attempted twice"));
        true
    }
}

impl<T: Send + 'static> ProducerSide<T> for SingleProducerSide {
    fn with_capacity(capacity: usize) -> Self {
        SingleProducerSide {
            non_full_event: SingleConsumerEvent::new(),
            used_capacity: AtomicUsize::new(0),
            total_capacity: AtomicUsize::new(capacity),
        }
    }

    fn push<'a, Q: QueueInternal<T>>(
        &'a self,
        queue: &'a Q,
        value: T,
        deadline: Deadline,
    ) -> impl Future<Output = bool> + Send + 'a
    where
        T: 'a,
    {
        async move {
            let size = queue.element_size(&value);
            let mut slot = Some(value);
            let mut no_more_consumers = false;

            let success = self
                .non_full_event
                .wait_until(deadline, || {
                    if queue.no_more_consumers() {
                        no_more_consumers = true;
                        return true;
                    }
                    self.try_push(queue, &mut slot, size)
                })
                .await;
            success && !no_more_consumers
        }
    }

    fn push_noblock<Q: QueueInternal<T>>(&self, queue: &Q, value: T) -> bool {
        let size = queue.element_size(&value);
        let mut slot = Some(value);
        !queue.no_more_consumers() && self.try_push(queue, &mut slot, size)
    }

    fn on_element_popped(&self, size: usize) {
        self.used_capacity.fetch_sub(size, Ordering::AcqRel);
        self.non_full_event.send();
    }

    fn stop_blocking_on_push(&self) {
        self.non_full_event.send();
    }

    fn resume_blocking_on_push(&self) {}

    fn set_soft_max_size(&self, size: usize) {
        let old = self.total_capacity.swap(size, Ordering::AcqRel);
        if size > old {
            self.non_full_event.send();
        }
    }

    fn soft_max_size(&self) -> usize {
        self.total_capacity.load(Ordering::Acquire)
    }

    fn size_approximate<Q: QueueInternal<T>>(&self, _queue: &Q) -> usize {
        self.used_capacity.load(Ordering::Acquire)
    }
}

/// Push side for multiple producers: free capacity lives in a semaphore.
pub struct MultiProducerSide {
    remaining_capacity: Semaphore,
}

impl MultiProducerSide {
    fn finish_push<T, Q: QueueInternal<T>>(&self, queue: &Q, value: T, size: usize) -> bool {
        if queue.no_more_consumers() {
            // Closed between the capacity grant and the push; hand the
            // permits back
            self.remaining_capacity.release(size);
            return false;
        }
        queue.do_push(value);
        true
    }
}

impl<T: Send + 'static> ProducerSide<T> for MultiProducerSide {
    fn with_capacity(capacity: usize) -> Self {
        MultiProducerSide { remaining_capacity: Semaphore::new(capacity) }
    }

    fn push<'a, Q: QueueInternal<T>>(
        &'a self,
        queue: &'a Q,
        value: T,
        deadline: Deadline,
    ) -> impl Future<Output = bool> + Send + 'a
    where
        T: 'a,
    {
        async move {
            let size = queue.element_size(&value);
            match self.remaining_capacity.acquire_many_until(deadline, size).await {
                AcquireStatus::Acquired => self.finish_push(queue, value, size),
                _ => false,
            }
        }
    }

    fn push_noblock<Q: QueueInternal<T>>(&self, queue: &Q, value: T) -> bool {
        let size = queue.element_size(&value);
        self.remaining_capacity.try_acquire_many(size) && self.finish_push(queue, value, size)
    }

    fn on_element_popped(&self, size: usize) {
        self.remaining_capacity.release(size);
    }

    fn stop_blocking_on_push(&self) {
        self.remaining_capacity.capacity_control().set_capacity_override(0);
    }

    fn resume_blocking_on_push(&self) {
        self.remaining_capacity.capacity_control().remove_capacity_override();
    }

    fn set_soft_max_size(&self, size: usize) {
        self.remaining_capacity.capacity_control().set_capacity(size);
    }

    fn soft_max_size(&self) -> usize {
        self.remaining_capacity.capacity_control().capacity()
    }

    fn size_approximate<Q: QueueInternal<T>>(&self, _queue: &Q) -> usize {
        self.remaining_capacity.used_approx()
    }
}

/// Push side for queues without max size support; producers never block.
pub struct NoMaxSizeProducerSide;

impl<T: Send + 'static> ProducerSide<T> for NoMaxSizeProducerSide {
    fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity == UNBOUNDED,
            "a queue without max size support cannot be bounded; create it with UNBOUNDED"
        );
        NoMaxSizeProducerSide
    }

    fn push<'a, Q: QueueInternal<T>>(
        &'a self,
        queue: &'a Q,
        value: T,
        _deadline: Deadline,
    ) -> impl Future<Output = bool> + Send + 'a
    where
        T: 'a,
    {
        async move { ProducerSide::<T>::push_noblock(self, queue, value) }
    }

    fn push_noblock<Q: QueueInternal<T>>(&self, queue: &Q, value: T) -> bool {
        if queue.no_more_consumers() {
            return false;
        }
        queue.do_push(value);
        true
    }

    fn on_element_popped(&self, _size: usize) {}

    fn stop_blocking_on_push(&self) {}

    fn resume_blocking_on_push(&self) {}

    fn set_soft_max_size(&self, _size: usize) {
        panic!("cannot set a max size on a queue with MaxSizeMode::None");
    }

    fn soft_max_size(&self) -> usize {
        UNBOUNDED
    }

    fn size_approximate<Q: QueueInternal<T>>(&self, queue: &Q) -> usize {
        queue.backing_len()
    }
}

/// Pop side for a single consumer handle.
pub struct SingleConsumerSide {
    nonempty_event: SingleConsumerEvent,
}

impl SingleConsumerSide {
    fn try_pop<T, Q: QueueInternal<T>>(&self, queue: &Q) -> Option<T> {
        let value = queue.do_pop()?;
        // Drained whatever signal was latched; the next push re-signals
        self.nonempty_event.reset();
        Some(value)
    }
}

impl<T: Send + 'static> ConsumerSide<T> for SingleConsumerSide {
    fn new() -> Self {
        SingleConsumerSide { nonempty_event: SingleConsumerEvent::new() }
    }

    fn pop<'a, Q: QueueInternal<T>>(
        &'a self,
        queue: &'a Q,
        deadline: Deadline,
    ) -> impl Future<Output = Option<T>> + Send + 'a
    where
        T: 'a,
    {
        async move {
            let mut out = None;
            let success = self
                .nonempty_event
                .wait_until(deadline, || {
                    if let Some(value) = self.try_pop(queue) {
                        out = Some(value);
                        return true;
                    }
                    if queue.no_more_producers() {
                        // A producer may have pushed between our pop and its
                        // death; check twice to avoid the TOCTOU
                        out = self.try_pop(queue);
                        return true;
                    }
                    false
                })
                .await;
            if success { out } else { None }
        }
    }

    fn pop_noblock<Q: QueueInternal<T>>(&self, queue: &Q) -> Option<T> {
        self.try_pop(queue)
    }

    fn on_element_pushed(&self) {
        self.nonempty_event.send();
    }

    fn stop_blocking_on_pop(&self) {
        self.nonempty_event.send();
    }

    fn resume_blocking_on_pop(&self) {}
}

/// Pop side for multiple consumers: queued elements live in a semaphore.
///
/// The semaphore is created at the unbounded capacity and immediately
/// drained, so `remaining` counts exactly the elements pushed and not yet
/// popped. Closing the pop side overrides the capacity far upward, which
/// grants every parked consumer a phantom element; the pop loop then
/// observes "no more producers", returns the permit and reports closure.
pub struct MultiConsumerSide {
    element_count: Semaphore,
}

impl MultiConsumerSide {
    fn finish_pop<T, Q: QueueInternal<T>>(&self, queue: &Q) -> Option<T> {
        loop {
            if let Some(value) = queue.do_pop() {
                return Some(value);
            }
            if queue.no_more_producers() {
                self.element_count.release(1);
                return None;
            }
            // Transient: our element is still in flight between the
            // producer's push and its semaphore release
            std::hint::spin_loop();
        }
    }
}

impl<T: Send + 'static> ConsumerSide<T> for MultiConsumerSide {
    fn new() -> Self {
        let element_count = Semaphore::new(UNBOUNDED);
        let drained = element_count.try_acquire_many(UNBOUNDED);
        debug_assert!(drained);
        MultiConsumerSide { element_count }
    }

    fn pop<'a, Q: QueueInternal<T>>(
        &'a self,
        queue: &'a Q,
        deadline: Deadline,
    ) -> impl Future<Output = Option<T>> + Send + 'a
    where
        T: 'a,
    {
        async move {
            match self.element_count.acquire_until(deadline).await {
                AcquireStatus::Acquired => self.finish_pop(queue),
                _ => None,
            }
        }
    }

    fn pop_noblock<Q: QueueInternal<T>>(&self, queue: &Q) -> Option<T> {
        if !self.element_count.try_acquire() {
            return None;
        }
        self.finish_pop(queue)
    }

    fn on_element_pushed(&self) {
        self.element_count.release(1);
    }

    fn stop_blocking_on_pop(&self) {
        self.element_count
            .capacity_control()
            .set_capacity_override(UNBOUNDED + SEMAPHORE_UNLOCK_VALUE);
    }

    fn resume_blocking_on_pop(&self) {
        self.element_count.capacity_control().remove_capacity_override();
    }
}
