//! Fiber-aware synchronization primitives.
//!
//! Every blocking operation here is a future (the crate's rendering of a
//! fiber suspension point), takes a [`Deadline`](crate::Deadline), and
//! observes the current task's cancellation token. Timeout and cancellation
//! are reported as status values, never as panics.

mod condvar;
mod event;
mod mutex;
mod semaphore;

pub use condvar::ConditionVariable;
pub use event::{SingleConsumerEvent, WaitEventFuture};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{AcquireFuture, AcquireStatus, CapacityControl, Semaphore};
