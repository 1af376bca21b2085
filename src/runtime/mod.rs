//! The task processor: a pool of worker threads running fibers.
//!
//! ## Scheduling model
//!
//! ```text
//!             spawn / wake
//!                  │
//!                  ▼
//!            ┌──────────┐   steal_batch    ┌─────────┐
//!            │ injector │ ───────────────► │ worker 0│──┐
//!            └──────────┘                  ├─────────┤  │ steal
//!                                          │ worker 1│◄─┘
//!                                          └─────────┘
//! ```
//!
//! Each worker owns a run queue; spawns and wakes land in the global
//! injector; idle workers refill from the injector or steal from a random
//! peer. Work stealing is opportunistic: it guarantees progress, not
//! fairness.
//!
//! A task is a future polled to completion by at most one worker at a
//! time. Between two suspension points execution is strictly sequential
//! and the task never migrates; after a suspension it may resume anywhere
//! in the pool.
//!
//! ## Cancellation and shutdown
//!
//! Every task carries a [`CancellationToken`]; `spawn` from inside a task
//! makes the new token a weak child of the spawner's, so cancelling a
//! parent propagates. [`TaskProcessor::shutdown`] cancels all live tasks
//! with [`CancellationReason::Shutdown`], waits for them to finish, then
//! stops the workers. Dropping the processor does the same.

pub mod current;
pub(crate) mod task;
mod worker;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crossbeam_deque::{Injector, Stealer, Worker};

use crate::cancel::{CancellationReason, CancellationToken};

pub use task::{JoinError, TaskHandle, WaitFuture, WaitStatus};
use task::{RawTask, ResultSlot};

/// State shared between workers, handles and wakers.
pub(crate) struct Shared {
    pub(crate) injector: Injector<Arc<RawTask>>,
    pub(crate) stealers: Vec<Stealer<Arc<RawTask>>>,
    /// Parking for idle workers: flag + condvar.
    pub(crate) parking: (Mutex<bool>, Condvar),
    /// Tells workers to exit once the queues drain.
    pub(crate) stop_workers: AtomicBool,
    /// Non-terminal tasks; shutdown waits for this to reach zero.
    active_tasks: AtomicUsize,
    all_done: (Mutex<()>, Condvar),
    /// Weak registry of live tasks for shutdown cancellation.
    registry: Mutex<Vec<Weak<RawTask>>>,
    next_task_id: AtomicU64,
}

impl Shared {
    /// Enqueues a runnable task and wakes one parked worker.
    pub(crate) fn reschedule(&self, task: Arc<RawTask>) {
        self.injector.push(task);
        let (lock, condvar) = &self.parking;
        *lock.lock().unwrap() = true;
        condvar.notify_one();
    }

    pub(crate) fn task_finished(&self) {
        if self.active_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            let (lock, condvar) = &self.all_done;
            let _guard = lock.lock().unwrap();
            condvar.notify_all();
        }
    }
}

/// A pool of `N` OS threads cooperatively running fibers.
pub struct TaskProcessor {
    shared: Arc<Shared>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

impl TaskProcessor {
    /// Starts a processor with `worker_threads` workers (0 means one per
    /// available CPU).
    pub fn new(worker_threads: usize) -> Arc<Self> {
        let worker_threads = if worker_threads == 0 {
            std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
        } else {
            worker_threads
        };

        let locals: Vec<Worker<Arc<RawTask>>> = (0..worker_threads).map(|_| Worker::new_fifo()).collect();
        let stealers = locals.iter().map(Worker::stealer).collect();

        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            parking: (Mutex::new(false), Condvar::new()),
            stop_workers: AtomicBool::new(false),
            active_tasks: AtomicUsize::new(0),
            all_done: (Mutex::new(()), Condvar::new()),
            registry: Mutex::new(Vec::new()),
            next_task_id: AtomicU64::new(1),
        });

        let threads = locals
            .into_iter()
            .enumerate()
            .map(|(index, local)| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("filament-worker-{index}"))
                    .spawn(move || worker::run(index, local, shared))
                    .expect("failed to spawn a worker thread")
            })
            .collect();

        Arc::new(TaskProcessor {
            shared,
            threads: Mutex::new(threads),
            shutdown_started: AtomicBool::new(false),
        })
    }

    /// Spawns `future` as a new fiber and returns its handle.
    ///
    /// Called from inside another fiber, the new task inherits a weak child
    /// of the spawner's cancellation token and the spawner's deadline.
    ///
    /// # Panics
    ///
    /// Panics if the processor is shutting down.
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        assert!(
            !self.shutdown_started.load(Ordering::Acquire),
            "spawn on a task processor that is shutting down"
        );

        let token = match current::try_cancellation_token() {
            Some(parent) => parent.child(),
            None => CancellationToken::new(),
        };
        let deadline = current::task_deadline();

        let slot = Arc::new(ResultSlot::new());
        let slot_for_future = slot.clone();
        let wrapped = Box::pin(async move {
            slot_for_future.set(future.await);
        });

        let id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
        let raw = RawTask::new(id, wrapped, token, deadline, Arc::downgrade(&self.shared));

        self.shared.active_tasks.fetch_add(1, Ordering::AcqRel);
        {
            let mut registry = self.shared.registry.lock().unwrap();
            if registry.len() == registry.capacity() {
                registry.retain(|weak| weak.strong_count() > 0);
            }
            registry.push(Arc::downgrade(&raw));
        }

        tracing::trace!(task = id, "spawned");
        self.shared.reschedule(raw.clone());
        TaskHandle::new(raw, slot)
    }

    /// Number of tasks not yet terminal.
    pub fn active_tasks(&self) -> usize {
        self.shared.active_tasks.load(Ordering::Acquire)
    }

    /// Cancels every live task with [`CancellationReason::Shutdown`], waits
    /// for all tasks to finish, then stops and joins the workers.
    /// Idempotent; the second caller returns once shutdown completes.
    pub fn shutdown(&self) {
        if !self.shutdown_started.swap(true, Ordering::AcqRel) {
            let live: Vec<_> = {
                let registry = self.shared.registry.lock().unwrap();
                registry.iter().filter_map(Weak::upgrade).collect()
            };
            for task in live {
                task.token.request_cancel(CancellationReason::Shutdown);
            }
        }

        // Wait for the task population to drain
        {
            let (lock, condvar) = &self.shared.all_done;
            let mut guard = lock.lock().unwrap();
            while self.shared.active_tasks.load(Ordering::Acquire) > 0 {
                guard = condvar.wait(guard).unwrap();
            }
        }

        self.shared.stop_workers.store(true, Ordering::Release);
        {
            let (lock, condvar) = &self.shared.parking;
            *lock.lock().unwrap() = true;
            condvar.notify_all();
        }

        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("task processor stopped");
    }
}

impl Drop for TaskProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("workers", &self.shared.stealers.len())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::Deadline;
    use crate::sync::Semaphore;
    use futures::executor::block_on;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn spawn_and_join() {
        let processor = TaskProcessor::new(2);
        let handle = processor.spawn(async { 2 + 2 });
        assert_eq!(block_on(handle.join()).unwrap(), 4);
        processor.shutdown();
    }

    #[test]
    fn many_tasks_all_run() {
        let processor = TaskProcessor::new(4);
        let counter = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let counter = counter.clone();
                processor.spawn(async move {
                    current::yield_now().await;
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for handle in handles {
            block_on(handle.join()).unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn nested_spawn_inherits_token() {
        let processor = TaskProcessor::new(2);
        let inner_processor = processor.clone();

        let parent = processor.spawn(async move {
            inner_processor.spawn(async {
                // Spin cooperatively until the inherited token fires
                while !current::should_cancel() {
                    current::yield_now().await;
                }
                current::cancellation_token().cancellation_reason()
            })
        });

        let parent_token = parent.cancellation_token();
        let child = block_on(parent.join()).unwrap();

        // The child token is a weak descendant: cancelling the parent's
        // token reaches it even though the parent task already finished
        parent_token.request_cancel(CancellationReason::User);
        let reason = block_on(child.join()).unwrap();
        assert_eq!(reason, Some(CancellationReason::Parent));
        processor.shutdown();
    }

    #[test]
    fn cancellation_wakes_a_suspended_task() {
        let processor = TaskProcessor::new(2);
        let semaphore = Arc::new(Semaphore::new(0));

        let waiting = {
            let semaphore = semaphore.clone();
            processor.spawn(async move { semaphore.acquire_until(Deadline::NONE).await })
        };
        std::thread::sleep(Duration::from_millis(50));

        waiting.request_cancel(CancellationReason::User);
        let status = block_on(waiting.join()).unwrap();
        assert_eq!(status, crate::sync::AcquireStatus::Cancelled);
        processor.shutdown();
    }

    #[test]
    fn task_deadline_clamps_blocking_calls() {
        let processor = TaskProcessor::new(1);
        let semaphore = Arc::new(Semaphore::new(0));

        let handle = {
            let semaphore = semaphore.clone();
            processor.spawn(async move {
                current::set_deadline(Deadline::from_duration(Duration::from_millis(20)));
                // The call itself asks for forever; the task deadline wins
                semaphore.acquire_until(Deadline::NONE).await
            })
        };
        let status = block_on(handle.join()).unwrap();
        assert_eq!(status, crate::sync::AcquireStatus::TimedOut);

        // Deadline expiry is local, not a cancellation
        let handle = processor.spawn(async { current::should_cancel() });
        assert!(!block_on(handle.join()).unwrap());
        processor.shutdown();
    }

    #[test]
    fn panic_is_delivered_to_joiner() {
        let processor = TaskProcessor::new(1);
        let handle = processor.spawn(async { panic!("boom") });
        match block_on(handle.join()) {
            Err(JoinError::Panicked { message }) => assert!(message.contains("boom")),
            other => panic!("expected a panic report, got {other:?}"),
        }
        processor.shutdown();
    }

    #[test]
    fn wait_until_times_out_without_cancelling() {
        let processor = TaskProcessor::new(2);
        let semaphore = Arc::new(Semaphore::new(0));

        let slow = {
            let semaphore = semaphore.clone();
            processor.spawn(async move {
                semaphore.acquire_until(Deadline::NONE).await;
            })
        };

        let status = block_on(slow.wait_until(Deadline::from_duration(Duration::from_millis(20))));
        assert_eq!(status, WaitStatus::TimedOut);
        assert!(!slow.is_finished());

        semaphore.release(1);
        assert_eq!(block_on(slow.wait_until(Deadline::NONE)), WaitStatus::Ready);
        processor.shutdown();
    }

    #[test]
    fn dropped_handle_cancels_the_task() {
        let processor = TaskProcessor::new(2);
        let semaphore = Arc::new(Semaphore::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        {
            let semaphore = semaphore.clone();
            let finished = finished.clone();
            let handle = processor.spawn(async move {
                let status = semaphore.acquire_until(Deadline::NONE).await;
                finished.store(status == crate::sync::AcquireStatus::Cancelled, Ordering::Release);
            });
            drop(handle);
        }

        processor.shutdown();
        assert!(finished.load(Ordering::Acquire), "drop did not cancel the suspended task");
    }

    #[test]
    fn detached_task_runs_to_completion() {
        let processor = TaskProcessor::new(2);
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            processor
                .spawn(async move {
                    current::yield_now().await;
                    done.store(true, Ordering::Release);
                })
                .detach();
        }
        processor.shutdown();
        assert!(done.load(Ordering::Acquire));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let processor = TaskProcessor::new(1);
        processor.spawn(async {}).detach();
        processor.shutdown();
        processor.shutdown();
    }
}
