//! Edge-triggered wakeup for a single waiting fiber.
//!
//! A `send` before the wait is never lost: the signal is latched in a flag
//! that the next wait consumes. Multiple `send`s before a wait collapse
//! into one wakeup (auto-reset). The waiting side re-checks the flag after
//! registering its waker, closing the window in which a concurrent `send`
//! could slip between the check and the registration.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

use crate::cancel::CancellationToken;
use crate::deadline::Deadline;
use crate::runtime::current;
use crate::timer::TimerRegistration;

/// One-waiter event with a latched signal.
#[derive(Default)]
pub struct SingleConsumerEvent {
    signaled: AtomicBool,
    waker: AtomicWaker,
}

impl SingleConsumerEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches the signal and wakes the parked consumer, if any.
    /// Idempotent.
    pub fn send(&self) {
        self.signaled.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Clears a pending signal. Consumers call this after draining the
    /// guarded resource so a stale signal does not cause a useless wakeup.
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    /// Suspends until a signal arrives, consuming it. Returns `false` on
    /// deadline expiry or task cancellation.
    pub fn wait_for_event(&self, deadline: Deadline) -> WaitEventFuture<'_> {
        WaitEventFuture { event: self, deadline, timer: None, token: None, started: false }
    }

    /// Loops `predicate` over wakeups until it reports done. Returns
    /// `false` if the deadline passes or the task is cancelled first.
    ///
    /// The single consumer both polls the predicate and consumes signals,
    /// so a signal sent after a false predicate check is still observed by
    /// the following wait.
    pub async fn wait_until(&self, deadline: Deadline, mut predicate: impl FnMut() -> bool) -> bool {
        loop {
            if predicate() {
                return true;
            }
            if !self.wait_for_event(deadline).await {
                return false;
            }
        }
    }
}

impl std::fmt::Debug for SingleConsumerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleConsumerEvent")
            .field("signaled", &self.signaled.load(Ordering::Relaxed))
            .finish()
    }
}

/// Future of one signal. Only one of these may exist per event at a time.
pub struct WaitEventFuture<'a> {
    event: &'a SingleConsumerEvent,
    deadline: Deadline,
    timer: Option<TimerRegistration>,
    token: Option<CancellationToken>,
    started: bool,
}

impl Future for WaitEventFuture<'_> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.started {
            this.started = true;
            this.token = current::try_cancellation_token();
            this.deadline = this.deadline.min(current::task_deadline());
        }

        if this.event.signaled.swap(false, Ordering::AcqRel) {
            return Poll::Ready(true);
        }
        if let Some(token) = &this.token
            && token.is_cancellation_requested()
        {
            return Poll::Ready(false);
        }
        if this.deadline.is_reached() {
            return Poll::Ready(false);
        }

        this.event.waker.register(cx.waker());
        match &this.timer {
            Some(timer) => timer.set_waker(cx.waker()),
            None => {
                if let Some(instant) = this.deadline.instant() {
                    this.timer = Some(TimerRegistration::new(instant, cx.waker()));
                }
            }
        }
        if let Some(token) = &this.token {
            token.register(cx.waker());
        }

        // A send may have landed between the swap above and the
        // registration; without this re-check it would be lost
        if this.event.signaled.swap(false, Ordering::AcqRel) {
            return Poll::Ready(true);
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn send_before_wait_is_latched() {
        let event = SingleConsumerEvent::new();
        event.send();
        assert!(event.wait_for_event(Deadline::NONE).await);
    }

    #[tokio::test]
    async fn sends_collapse() {
        let event = SingleConsumerEvent::new();
        event.send();
        event.send();
        event.send();
        assert!(event.wait_for_event(Deadline::NONE).await);
        // Only one signal was latched
        assert!(!event.wait_for_event(Deadline::from_duration(Duration::from_millis(10))).await);
    }

    #[tokio::test]
    async fn reset_clears_the_latch() {
        let event = SingleConsumerEvent::new();
        event.send();
        event.reset();
        assert!(!event.wait_for_event(Deadline::from_duration(Duration::from_millis(10))).await);
    }

    #[tokio::test]
    async fn wakes_a_parked_consumer() {
        let event = Arc::new(SingleConsumerEvent::new());
        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.wait_for_event(Deadline::NONE).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        event.send();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn predicate_wait_sees_late_condition() {
        let event = Arc::new(SingleConsumerEvent::new());
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let event = event.clone();
            let flag = flag.clone();
            tokio::spawn(async move {
                event.wait_until(Deadline::NONE, move || flag.load(Ordering::Acquire)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.store(true, Ordering::Release);
        event.send();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn predicate_wait_times_out() {
        let event = SingleConsumerEvent::new();
        let done = event
            .wait_until(Deadline::from_duration(Duration::from_millis(10)), || false)
            .await;
        assert!(!done);
    }
}
