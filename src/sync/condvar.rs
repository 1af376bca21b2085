//! Condition variable for fiber [`Mutex`]es.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::sync::event::SingleConsumerEvent;
use crate::sync::mutex::MutexGuard;

/// Wakes fibers waiting for a condition guarded by a [`Mutex`](super::Mutex).
///
/// Each waiter parks on its own [`SingleConsumerEvent`], queued FIFO.
/// The waiter is enqueued *before* the mutex is released, so a notify that
/// races the unlock still lands on the latched event and is not lost.
#[derive(Default)]
pub struct ConditionVariable {
    waiters: std::sync::Mutex<VecDeque<Arc<SingleConsumerEvent>>>,
}

impl ConditionVariable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically releases the mutex and suspends until notified, then
    /// re-acquires the mutex. Spurious wakeups are possible; callers loop
    /// over their condition as usual.
    pub async fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let (guard, _) = self.wait_until(guard, Deadline::NONE).await;
        guard
    }

    /// Like [`Self::wait`] with a deadline. The boolean is `false` if the
    /// wait ended by timeout or cancellation rather than a notification.
    pub async fn wait_until<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Deadline,
    ) -> (MutexGuard<'a, T>, bool) {
        let event = Arc::new(SingleConsumerEvent::new());
        self.waiters.lock().unwrap().push_back(event.clone());

        let mutex = guard.mutex();
        drop(guard);

        let notified = event.wait_for_event(deadline).await;
        if !notified {
            // Drop our entry so a future notify is not wasted on it; the
            // entry may already be gone if a notify raced the timeout
            let mut waiters = self.waiters.lock().unwrap();
            if let Some(position) = waiters.iter().position(|w| Arc::ptr_eq(w, &event)) {
                waiters.remove(position);
            }
        }

        (mutex.lock().await, notified)
    }

    /// Wakes the longest-waiting fiber, if any.
    pub fn notify_one(&self) {
        let waiter = self.waiters.lock().unwrap().pop_front();
        if let Some(waiter) = waiter {
            waiter.send();
        }
    }

    /// Wakes every waiting fiber.
    pub fn notify_all(&self) {
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.drain(..).collect()
        };
        for waiter in drained {
            waiter.send();
        }
    }
}

impl std::fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiters", &self.waiters.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn notify_one_wakes_a_waiter() {
        let mutex = Arc::new(Mutex::new(false));
        let condvar = Arc::new(ConditionVariable::new());

        let waiter = {
            let mutex = mutex.clone();
            let condvar = condvar.clone();
            tokio::spawn(async move {
                let mut guard = mutex.lock().await;
                while !*guard {
                    guard = condvar.wait(guard).await;
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        *mutex.lock().await = true;
        condvar.notify_one();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn notify_all_wakes_everyone() {
        let mutex = Arc::new(Mutex::new(false));
        let condvar = Arc::new(ConditionVariable::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                let condvar = condvar.clone();
                tokio::spawn(async move {
                    let mut guard = mutex.lock().await;
                    while !*guard {
                        guard = condvar.wait(guard).await;
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        *mutex.lock().await = true;
        condvar.notify_all();
        for waiter in waiters {
            waiter.await.unwrap();
        }
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        let mutex = Mutex::new(());
        let condvar = ConditionVariable::new();

        let guard = mutex.lock().await;
        let (_guard, notified) =
            condvar.wait_until(guard, Deadline::from_duration(Duration::from_millis(10))).await;
        assert!(!notified);
    }
}
