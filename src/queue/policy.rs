//! Compile-time queue shape selection.
//!
//! A policy fixes the producer/consumer multiplicity, the capacity mode and
//! the element-size accounting of a [`GenericQueue`](super::GenericQueue).
//! The policy's associated types pick the producer/consumer side
//! implementations, so shape dispatch is monomorphised away; nothing on the
//! hot path is virtual.

use crate::queue::sides::{
    ConsumerSide, MultiConsumerSide, MultiProducerSide, NoMaxSizeProducerSide, ProducerSide,
    SingleConsumerSide, SingleProducerSide,
};

/// How a queue enforces its configured max size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxSizeMode {
    /// No max size support; producers never block. Fastest.
    None,
    /// Soft max size adjustable at runtime; producers over the limit wait.
    DynamicSync,
}

/// Shape and accounting of one queue instantiation.
pub trait QueuePolicy<T>: Sized + Send + Sync + 'static {
    /// Whether multiple concurrent producer handles are allowed. Multi-
    /// producer queues deliver across producers in unspecified order
    /// ("non-FIFO"); FIFO is kept within each producer.
    const IS_MULTI_PRODUCER: bool;

    /// Whether multiple concurrent consumer handles are allowed.
    const IS_MULTI_CONSUMER: bool;

    /// Capacity enforcement mode.
    const MAX_SIZE_MODE: MaxSizeMode;

    #[doc(hidden)]
    type ProducerSide: ProducerSide<T>;
    #[doc(hidden)]
    type ConsumerSide: ConsumerSide<T>;

    /// How much of the capacity one element occupies. The default counts
    /// elements; byte-bounded queues return the payload length. An
    /// element's size must not change while it is inside the queue.
    #[inline]
    fn element_size(_value: &T) -> usize {
        1
    }
}

macro_rules! define_policy {
    ($(#[$doc:meta])* $name:ident, $mp:literal, $mc:literal, $mode:ident, $producer:ident, $consumer:ident) => {
        $(#[$doc])*
        pub struct $name;

        impl<T: Send + 'static> QueuePolicy<T> for $name {
            const IS_MULTI_PRODUCER: bool = $mp;
            const IS_MULTI_CONSUMER: bool = $mc;
            const MAX_SIZE_MODE: MaxSizeMode = MaxSizeMode::$mode;

            type ProducerSide = $producer;
            type ConsumerSide = $consumer;
        }
    };
}

define_policy!(
    /// Multi-producer multi-consumer, dynamic soft max size.
    NonFifoMpmc, true, true, DynamicSync, MultiProducerSide, MultiConsumerSide
);
define_policy!(
    /// Multi-producer single-consumer, dynamic soft max size.
    NonFifoMpsc, true, false, DynamicSync, MultiProducerSide, SingleConsumerSide
);
define_policy!(
    /// Single-producer multi-consumer, dynamic soft max size.
    Spmc, false, true, DynamicSync, SingleProducerSide, MultiConsumerSide
);
define_policy!(
    /// Single-producer single-consumer, dynamic soft max size.
    Spsc, false, false, DynamicSync, SingleProducerSide, SingleConsumerSide
);
define_policy!(
    /// Multi-producer single-consumer without max size support.
    UnboundedNonFifoMpsc, true, false, None, NoMaxSizeProducerSide, SingleConsumerSide
);
define_policy!(
    /// Single-producer multi-consumer without max size support.
    UnboundedSpmc, false, true, None, NoMaxSizeProducerSide, MultiConsumerSide
);
define_policy!(
    /// Single-producer single-consumer without max size support.
    UnboundedSpsc, false, false, None, NoMaxSizeProducerSide, SingleConsumerSide
);

/// Single-producer single-consumer queue of strings bounded by the total
/// byte length of the queued strings rather than their count.
pub struct ByteBounded;

impl QueuePolicy<String> for ByteBounded {
    const IS_MULTI_PRODUCER: bool = false;
    const IS_MULTI_CONSUMER: bool = false;
    const MAX_SIZE_MODE: MaxSizeMode = MaxSizeMode::DynamicSync;

    type ProducerSide = SingleProducerSide;
    type ConsumerSide = SingleConsumerSide;

    #[inline]
    fn element_size(value: &String) -> usize {
        // A zero-length element would occupy no capacity and break the
        // accounting; charge at least one byte
        value.len().max(1)
    }
}
