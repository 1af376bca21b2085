//! Cooperative task runtime and lock-free concurrency core.
//!
//! `filament` is the execution substrate for asynchronous services: a
//! work-stealing multi-threaded task processor plus the primitives that
//! keep inter-task communication correct under cancellation. It provides
//! no protocol, wire or storage formats; higher layers submit work, hand
//! values between tasks through the queues, and share read-mostly state
//! through the RCU variable.
//!
//! ## Components
//!
//! | Module | What it gives you |
//! |--------|-------------------|
//! | [`runtime`] | `TaskProcessor`, `TaskHandle`, `current_task` accessors |
//! | [`sync`] | cancellable `Semaphore`, `SingleConsumerEvent`, `Mutex`, `ConditionVariable` |
//! | [`queue`] | bounded `GenericQueue` family (SPSC…MPMC, dynamic soft capacity) |
//! | [`mpsc`] | specialised intrusive MPSC queue |
//! | [`rcu`] | `rcu::Variable` with lock-free readers |
//! | [`Deadline`], [`CancellationToken`] | time and cancellation plumbing every blocking call honours |
//!
//! ## The contract in one paragraph
//!
//! Every blocking operation is a suspension point: it takes a [`Deadline`],
//! observes the calling task's [`CancellationToken`], and reports timeout
//! and cancellation as status values, never as unwinding. Deadline expiry
//! is local to the call; cancellation is task-wide and sticky. Queue
//! closure wakes all waiters and reads as plain `false`/`None`, not as
//! cancellation. Between suspension points code runs to completion.
//!
//! ## Example
//!
//! ```
//! use filament::queue::NonFifoMpscQueue;
//! use filament::{Deadline, TaskProcessor};
//!
//! let processor = TaskProcessor::new(2);
//! let queue = NonFifoMpscQueue::<u64>::create(16);
//!
//! let producer = queue.get_producer();
//! let feeder = processor.spawn(async move {
//!     for i in 0..4 {
//!         assert!(producer.push(i, Deadline::NONE).await);
//!     }
//! });
//!
//! let consumer = queue.get_consumer();
//! let drainer = processor.spawn(async move {
//!     let mut sum = 0;
//!     while let Some(value) = consumer.pop(Deadline::NONE).await {
//!         sum += value;
//!     }
//!     sum
//! });
//!
//! futures::executor::block_on(async {
//!     feeder.join().await.unwrap();
//!     drop(queue);
//!     assert_eq!(drainer.join().await.unwrap(), 6);
//! });
//! processor.shutdown();
//! ```

mod cancel;
mod deadline;
mod intrusive;
mod timer;

pub mod mpsc;
pub mod queue;
pub mod rcu;
pub mod runtime;
pub mod sync;

pub use cancel::{CancellationReason, CancellationToken};
pub use deadline::Deadline;
pub use runtime::{JoinError, TaskHandle, TaskProcessor, WaitStatus};

/// Accessors for the currently running task, mirroring the
/// `runtime::current` module under the conventional name.
pub mod current_task {
    pub use crate::runtime::current::{
        cancellation_token, set_deadline, should_cancel, task_deadline, task_id, yield_now,
    };
}
