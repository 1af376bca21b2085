//! Bounded concurrent queue family.
//!
//! One generic queue, four shapes, two capacity modes:
//!
//! | Alias | Producers | Consumers | Max size |
//! |-------|-----------|-----------|----------|
//! | [`NonFifoMpmcQueue`] | multi | multi | dynamic |
//! | [`NonFifoMpscQueue`] | multi | single | dynamic |
//! | [`SpmcQueue`] | single | multi | dynamic |
//! | [`SpscQueue`] | single | single | dynamic |
//! | [`UnboundedNonFifoMpscQueue`] | multi | single | none |
//! | [`UnboundedSpmcQueue`] | single | multi | none |
//! | [`UnboundedSpscQueue`] | single | single | none |
//! | [`StringStreamQueue`] | single | single | dynamic, in bytes |
//!
//! Items from one producer are delivered in push order; items from
//! different producers interleave arbitrarily ("non-FIFO"). The backing
//! store is a lock-free array-of-blocks queue; the soft max size is
//! enforced outside it by a capacity semaphore (multi-producer) or a
//! non-full event (single-producer), so the bound may be transiently
//! exceeded by at most one in-flight push per racing producer.
//!
//! ## Lifecycle
//!
//! A queue is created shared; handles are issued from it and co-own it.
//!
//! ```text
//! Open ── last consumer dropped ──► closed for push (push → false)
//! Open ── last producer dropped ──► pop drains residue, then → None
//! ```
//!
//! Both transitions wake every parked waiter. Residual elements left when
//! the queue itself dies are destroyed in its destructor.

pub mod policy;
#[doc(hidden)]
pub mod sides;

mod handles;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

pub use handles::{Consumer, MultiConsumer, MultiProducer, Producer};
pub use policy::{MaxSizeMode, QueuePolicy};

use crate::queue::sides::{ConsumerSide, ProducerSide, QueueInternal};

/// The "no limit" capacity. Kept far under `usize::MAX` so close-time
/// capacity overrides cannot overflow the accounting.
pub const UNBOUNDED: usize = usize::MAX / 4;

/// Sentinel for "handles existed and all died".
const CREATED_AND_DEAD: usize = usize::MAX;

/// Distance the pop-side capacity override jumps beyond [`UNBOUNDED`] to
/// release every parked consumer at close.
pub(crate) const SEMAPHORE_UNLOCK_VALUE: usize = usize::MAX / 2;

/// Bounded FIFO-within-producer queue; see the [module docs](self).
pub struct GenericQueue<T: Send + 'static, P: QueuePolicy<T>> {
    backing: SegQueue<T>,
    producers_count: AtomicUsize,
    consumers_count: AtomicUsize,
    pub(crate) producer_side: P::ProducerSide,
    pub(crate) consumer_side: P::ConsumerSide,
}

impl<T: Send + 'static, P: QueuePolicy<T>> GenericQueue<T, P> {
    /// Creates a queue with the given soft max size.
    pub fn create(max_size: usize) -> Arc<Self> {
        let max_size = max_size.min(UNBOUNDED);
        Arc::new(GenericQueue {
            backing: SegQueue::new(),
            producers_count: AtomicUsize::new(0),
            consumers_count: AtomicUsize::new(0),
            producer_side: P::ProducerSide::with_capacity(max_size),
            consumer_side: P::ConsumerSide::new(),
        })
    }

    /// Creates a queue with no effective size limit.
    pub fn create_unbounded() -> Arc<Self> {
        Self::create(UNBOUNDED)
    }

    /// Issues a push handle. May be called repeatedly; each handle is
    /// exclusive to one fiber.
    ///
    /// # Panics
    ///
    /// On a single-producer queue, panics if a producer already exists.
    pub fn get_producer(self: &Arc<Self>) -> Producer<T, P> {
        self.prepare_producer();
        Producer::new(self.clone())
    }

    /// Issues a clonable, shareable push handle. Multi-producer queues
    /// only; prefer [`Self::get_producer`] where exclusivity suffices.
    pub fn get_multi_producer(self: &Arc<Self>) -> MultiProducer<T, P> {
        const {
            assert!(P::IS_MULTI_PRODUCER, "MultiProducer requested from a single-producer queue")
        };
        self.prepare_producer();
        MultiProducer::new(self.clone())
    }

    /// Issues a pop handle. May be called repeatedly; each handle is
    /// exclusive to one fiber.
    ///
    /// # Panics
    ///
    /// On a single-consumer queue, panics if a consumer already exists.
    pub fn get_consumer(self: &Arc<Self>) -> Consumer<T, P> {
        self.prepare_consumer();
        Consumer::new(self.clone())
    }

    /// Issues a clonable, shareable pop handle. Multi-consumer queues only.
    pub fn get_multi_consumer(self: &Arc<Self>) -> MultiConsumer<T, P> {
        const {
            assert!(P::IS_MULTI_CONSUMER, "MultiConsumer requested from a single-consumer queue")
        };
        self.prepare_consumer();
        MultiConsumer::new(self.clone())
    }

    /// Changes the soft size limit; pushes beyond it block. The limit may
    /// be transiently overrun by racing producers.
    ///
    /// # Panics
    ///
    /// Panics on queues with [`MaxSizeMode::None`].
    pub fn set_soft_max_size(&self, max_size: usize) {
        self.producer_side.set_soft_max_size(max_size.min(UNBOUNDED));
    }

    /// The current soft size limit.
    pub fn soft_max_size(&self) -> usize {
        self.producer_side.soft_max_size()
    }

    /// Approximate number of capacity units (elements, or bytes for
    /// byte-bounded queues) currently enqueued.
    pub fn size_approximate(&self) -> usize {
        self.producer_side.size_approximate(self)
    }

    pub(crate) fn prepare_producer(&self) {
        let old = self
            .producers_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                assert!(
                    P::IS_MULTI_PRODUCER || old == 0 || old == CREATED_AND_DEAD,
                    "a single-producer queue already has a live producer"
                );
                Some(if old == CREATED_AND_DEAD { 1 } else { old + 1 })
            })
            .unwrap();
        if old == CREATED_AND_DEAD {
            self.consumer_side.resume_blocking_on_pop();
        }
    }

    pub(crate) fn prepare_consumer(&self) {
        let old = self
            .consumers_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                assert!(
                    P::IS_MULTI_CONSUMER || old == 0 || old == CREATED_AND_DEAD,
                    "a single-consumer queue already has a live consumer"
                );
                Some(if old == CREATED_AND_DEAD { 1 } else { old + 1 })
            })
            .unwrap();
        if old == CREATED_AND_DEAD {
            self.producer_side.resume_blocking_on_push();
        }
    }

    pub(crate) fn mark_producer_is_dead(&self) {
        let old = self
            .producers_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                Some(if old == 1 { CREATED_AND_DEAD } else { old - 1 })
            })
            .unwrap();
        if old == 1 {
            tracing::trace!("queue closed for pop once drained: last producer died");
            self.consumer_side.stop_blocking_on_pop();
        }
    }

    pub(crate) fn mark_consumer_is_dead(&self) {
        let old = self
            .consumers_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                Some(if old == 1 { CREATED_AND_DEAD } else { old - 1 })
            })
            .unwrap();
        if old == 1 {
            tracing::trace!("queue closed for push: last consumer died");
            self.producer_side.stop_blocking_on_push();
        }
    }
}

impl<T: Send + 'static, P: QueuePolicy<T>> QueueInternal<T> for GenericQueue<T, P> {
    fn no_more_consumers(&self) -> bool {
        self.consumers_count.load(Ordering::Acquire) == CREATED_AND_DEAD
    }

    fn no_more_producers(&self) -> bool {
        self.producers_count.load(Ordering::Acquire) == CREATED_AND_DEAD
    }

    fn do_push(&self, value: T) {
        self.backing.push(value);
        self.consumer_side.on_element_pushed();
    }

    fn do_pop(&self) -> Option<T> {
        let value = self.backing.pop()?;
        self.producer_side.on_element_popped(P::element_size(&value));
        Some(value)
    }

    fn backing_len(&self) -> usize {
        self.backing.len()
    }

    fn element_size(&self, value: &T) -> usize {
        P::element_size(value)
    }
}

impl<T: Send + 'static, P: QueuePolicy<T>> Drop for GenericQueue<T, P> {
    fn drop(&mut self) {
        let producers = self.producers_count.load(Ordering::Relaxed);
        let consumers = self.consumers_count.load(Ordering::Relaxed);
        debug_assert!(producers == 0 || producers == CREATED_AND_DEAD);
        debug_assert!(consumers == 0 || consumers == CREATED_AND_DEAD);

        // Residual elements never delivered
        while self.backing.pop().is_some() {}
    }
}

impl<T: Send + 'static, P: QueuePolicy<T>> std::fmt::Debug for GenericQueue<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericQueue")
            .field("size_approximate", &self.size_approximate())
            .field("soft_max_size", &self.soft_max_size())
            .finish()
    }
}

/// Multi-producer multi-consumer queue. FIFO within each producer only.
pub type NonFifoMpmcQueue<T> = GenericQueue<T, policy::NonFifoMpmc>;
/// Multi-producer single-consumer queue. FIFO within each producer only.
pub type NonFifoMpscQueue<T> = GenericQueue<T, policy::NonFifoMpsc>;
/// Single-producer multi-consumer queue.
pub type SpmcQueue<T> = GenericQueue<T, policy::Spmc>;
/// Single-producer single-consumer queue.
pub type SpscQueue<T> = GenericQueue<T, policy::Spsc>;
/// [`NonFifoMpscQueue`] without max size support; slightly faster.
pub type UnboundedNonFifoMpscQueue<T> = GenericQueue<T, policy::UnboundedNonFifoMpsc>;
/// [`SpmcQueue`] without max size support; slightly faster.
pub type UnboundedSpmcQueue<T> = GenericQueue<T, policy::UnboundedSpmc>;
/// [`SpscQueue`] without max size support; slightly faster.
pub type UnboundedSpscQueue<T> = GenericQueue<T, policy::UnboundedSpsc>;
/// Single-producer single-consumer queue of strings bounded by total bytes.
pub type StringStreamQueue = GenericQueue<String, policy::ByteBounded>;
