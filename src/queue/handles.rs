//! Producer and consumer handles.
//!
//! Handles hold a strong reference to their queue, so the queue outlives
//! every handle; there is no back-pointer from the queue to any handle.
//! Dropping the last producer closes the queue for pop once drained;
//! dropping the last consumer closes it for push immediately.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::queue::GenericQueue;
use crate::queue::policy::QueuePolicy;
use crate::queue::sides::{ConsumerSide, ProducerSide};

/// Exclusive push handle. Not clonable and not `Sync`: one fiber drives
/// it at a time; open several producers to push concurrently.
pub struct Producer<T: Send + 'static, P: QueuePolicy<T>> {
    queue: Arc<GenericQueue<T, P>>,
    // Marker type keeps the handle !Sync without a manual unsafe impl
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Send + 'static, P: QueuePolicy<T>> Producer<T, P> {
    pub(super) fn new(queue: Arc<GenericQueue<T, P>>) -> Self {
        Producer { queue, _not_sync: PhantomData }
    }

    /// FIFO insertion; blocks while the queue is full. `false` when the
    /// queue is closed for push, or the wait ended by deadline or
    /// cancellation.
    pub async fn push(&self, value: T, deadline: Deadline) -> bool {
        self.queue.producer_side.push(&*self.queue, value, deadline).await
    }

    /// Non-blocking insertion.
    pub fn push_noblock(&self, value: T) -> bool {
        self.queue.producer_side.push_noblock(&*self.queue, value)
    }

    /// The queue this handle feeds.
    pub fn queue(&self) -> &Arc<GenericQueue<T, P>> {
        &self.queue
    }
}

impl<T: Send + 'static, P: QueuePolicy<T>> Drop for Producer<T, P> {
    fn drop(&mut self) {
        self.queue.mark_producer_is_dead();
    }
}

/// Shared push handle of a multi-producer queue; clonable and usable from
/// several fibers at once.
pub struct MultiProducer<T: Send + 'static, P: QueuePolicy<T>> {
    queue: Arc<GenericQueue<T, P>>,
}

impl<T: Send + 'static, P: QueuePolicy<T>> MultiProducer<T, P> {
    pub(super) fn new(queue: Arc<GenericQueue<T, P>>) -> Self {
        MultiProducer { queue }
    }

    /// See [`Producer::push`].
    pub async fn push(&self, value: T, deadline: Deadline) -> bool {
        self.queue.producer_side.push(&*self.queue, value, deadline).await
    }

    /// See [`Producer::push_noblock`].
    pub fn push_noblock(&self, value: T) -> bool {
        self.queue.producer_side.push_noblock(&*self.queue, value)
    }
}

impl<T: Send + 'static, P: QueuePolicy<T>> Clone for MultiProducer<T, P> {
    fn clone(&self) -> Self {
        self.queue.prepare_producer();
        MultiProducer { queue: self.queue.clone() }
    }
}

impl<T: Send + 'static, P: QueuePolicy<T>> Drop for MultiProducer<T, P> {
    fn drop(&mut self) {
        self.queue.mark_producer_is_dead();
    }
}

/// Exclusive pop handle. Not clonable and not `Sync`; open several
/// consumers on a multi-consumer queue to pop concurrently.
pub struct Consumer<T: Send + 'static, P: QueuePolicy<T>> {
    queue: Arc<GenericQueue<T, P>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Send + 'static, P: QueuePolicy<T>> Consumer<T, P> {
    pub(super) fn new(queue: Arc<GenericQueue<T, P>>) -> Self {
        Consumer { queue, _not_sync: PhantomData }
    }

    /// FIFO removal; blocks while the queue is empty and producers live.
    /// `None` when the queue is closed for pop and drained, or the wait
    /// ended by deadline or cancellation.
    pub async fn pop(&self, deadline: Deadline) -> Option<T> {
        self.queue.consumer_side.pop(&*self.queue, deadline).await
    }

    /// Non-blocking removal.
    pub fn pop_noblock(&self) -> Option<T> {
        self.queue.consumer_side.pop_noblock(&*self.queue)
    }

    /// The queue this handle drains.
    pub fn queue(&self) -> &Arc<GenericQueue<T, P>> {
        &self.queue
    }
}

impl<T: Send + 'static, P: QueuePolicy<T>> Drop for Consumer<T, P> {
    fn drop(&mut self) {
        self.queue.mark_consumer_is_dead();
    }
}

/// Shared pop handle of a multi-consumer queue; clonable and usable from
/// several fibers at once.
pub struct MultiConsumer<T: Send + 'static, P: QueuePolicy<T>> {
    queue: Arc<GenericQueue<T, P>>,
}

impl<T: Send + 'static, P: QueuePolicy<T>> MultiConsumer<T, P> {
    pub(super) fn new(queue: Arc<GenericQueue<T, P>>) -> Self {
        MultiConsumer { queue }
    }

    /// See [`Consumer::pop`].
    pub async fn pop(&self, deadline: Deadline) -> Option<T> {
        self.queue.consumer_side.pop(&*self.queue, deadline).await
    }

    /// See [`Consumer::pop_noblock`].
    pub fn pop_noblock(&self) -> Option<T> {
        self.queue.consumer_side.pop_noblock(&*self.queue)
    }
}

impl<T: Send + 'static, P: QueuePolicy<T>> Clone for MultiConsumer<T, P> {
    fn clone(&self) -> Self {
        self.queue.prepare_consumer();
        MultiConsumer { queue: self.queue.clone() }
    }
}

impl<T: Send + 'static, P: QueuePolicy<T>> Drop for MultiConsumer<T, P> {
    fn drop(&mut self) {
        self.queue.mark_consumer_is_dead();
    }
}
