//! Worker thread loop.
//!
//! Each worker owns a FIFO run queue. Work is found in this order: own
//! queue, a batch from the global injector, a steal from a random victim.
//! An idle worker parks on the shared condvar with a short timeout so a
//! missed notification costs at most one tick.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_deque::{Steal, Worker};

use crate::runtime::task::{COMPLETED, QUEUED, RUNNING, SUSPENDED, RawTask};
use crate::runtime::{Shared, current};

const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Simple xorshift for victim selection; seeded per worker.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

pub(crate) fn run(index: usize, local: Worker<Arc<RawTask>>, shared: Arc<Shared>) {
    let mut rng = XorShift((index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    tracing::debug!(worker = index, "worker started");

    loop {
        if let Some(task) = find_task(&local, &shared, &mut rng) {
            run_task(task, &shared);
            continue;
        }

        if shared.stop_workers.load(Ordering::Acquire) {
            // Drain what is left so no queued task is silently dropped
            while let Some(task) = find_task(&local, &shared, &mut rng) {
                run_task(task, &shared);
            }
            break;
        }

        let (lock, condvar) = &shared.parking;
        let mut notified = lock.lock().unwrap();
        if *notified {
            *notified = false;
            continue;
        }
        let (mut notified, _) = condvar.wait_timeout(notified, PARK_TIMEOUT).unwrap();
        *notified = false;
    }

    tracing::debug!(worker = index, "worker stopped");
}

fn find_task(
    local: &Worker<Arc<RawTask>>,
    shared: &Shared,
    rng: &mut XorShift,
) -> Option<Arc<RawTask>> {
    if let Some(task) = local.pop() {
        return Some(task);
    }

    // Refill from the injector, then try one random victim; retry while
    // either source reports a transient race
    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Retry => continue,
            Steal::Empty => {}
        }

        let victims = shared.stealers.len();
        if victims > 1 {
            let victim = (rng.next() as usize) % victims;
            match shared.stealers[victim].steal() {
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
                Steal::Empty => {}
            }
        }
        return None;
    }
}

fn run_task(task: Arc<RawTask>, shared: &Shared) {
    if task.state.load(Ordering::Acquire) == COMPLETED {
        return;
    }
    task.state.store(RUNNING, Ordering::Release);

    let waker = task.waker();
    let mut context = std::task::Context::from_waker(&waker);

    let poll_result = {
        let _guard = current::enter(task.clone());
        let mut slot = task.future.lock().unwrap();
        let Some(future) = slot.as_mut() else {
            // Completed elsewhere (shutdown drop)
            return;
        };
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| future.as_mut().poll(&mut context)))
    };

    match poll_result {
        Ok(std::task::Poll::Ready(())) => {
            task.mark_completed();
            shared.task_finished();
        }
        Ok(std::task::Poll::Pending) => {
            // A waker that fired during the poll flipped us to Queued; the
            // failed CAS tells us to run again instead of parking
            if task
                .state
                .compare_exchange(RUNNING, SUSPENDED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug_assert_eq!(task.state.load(Ordering::Acquire), QUEUED);
                shared.reschedule(task);
            }
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            if task.detached.load(Ordering::Acquire) {
                tracing::error!(task = task.id, %message, "detached task panicked");
            } else {
                tracing::debug!(task = task.id, %message, "task panicked; stored for the joiner");
            }
            task.record_panic(message);
            task.mark_completed();
            shared.task_finished();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}
