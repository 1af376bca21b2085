//! Cancellable counting semaphore with dynamic capacity.
//!
//! The semaphore parks fibers, not threads: `acquire_many_until` is a
//! future that registers itself in a FIFO waiter queue and resolves on
//! release, deadline expiry or task cancellation. Waiters are served
//! strictly head-first — a later small-`n` waiter never overtakes a parked
//! large-`n` one, which bounds waiting for every acquirer.
//!
//! [`CapacityControl`] adjusts the total capacity at runtime. Shrinking
//! below the number of outstanding permits leaves the difference "owed":
//! future releases pay the debt before anything becomes acquirable again.
//! A temporary override replaces the configured capacity outright; demand
//! above the effective capacity fails immediately with
//! [`AcquireStatus::Unsatisfiable`], which is how the queues fail and wake
//! every parked producer at close.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::cancel::CancellationToken;
use crate::deadline::Deadline;
use crate::runtime::current;
use crate::timer::TimerRegistration;

/// Outcome of a blocking acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    /// The permits are held by the caller.
    Acquired,
    /// The deadline passed first. Local to this call; the task keeps
    /// running un-cancelled.
    TimedOut,
    /// The task's cancellation token fired during the wait.
    Cancelled,
    /// The demand exceeds the (possibly overridden) capacity and can never
    /// be met.
    Unsatisfiable,
}

// Waiter lifecycle, written under the semaphore lock, read lock-free by the
// waiting future.
const WAITING: u8 = 0;
const GRANTED: u8 = 1;
const REJECTED: u8 = 2;

struct Waiter {
    n: usize,
    state: AtomicU8,
    waker: Mutex<Waker>,
}

struct State {
    remaining: usize,
    capacity: usize,
    capacity_override: Option<usize>,
    /// Capacity shrink that outstanding permits have not yet paid back.
    owed: usize,
    /// Permits currently held; what the queues report as their size.
    in_flight: usize,
    waiters: VecDeque<Arc<Waiter>>,
}

impl State {
    fn effective_capacity(&self) -> usize {
        self.capacity_override.unwrap_or(self.capacity)
    }

    /// Serves the waiter queue head-first. Returns the wakers to run once
    /// the lock is dropped.
    fn pump(&mut self, wakeups: &mut Vec<Waker>) {
        while let Some(front) = self.waiters.front() {
            if front.n > self.effective_capacity() {
                front.state.store(REJECTED, Ordering::Release);
            } else if front.n <= self.remaining {
                self.remaining -= front.n;
                self.in_flight = self.in_flight.saturating_add(front.n);
                front.state.store(GRANTED, Ordering::Release);
            } else {
                // The head cannot be served; nobody behind it may skip ahead
                break;
            }
            let front = self.waiters.pop_front().unwrap();
            wakeups.push(front.waker.lock().unwrap().clone());
        }
    }

    fn add_permits(&mut self, n: usize) {
        let paid = n.min(self.owed);
        self.owed -= paid;
        self.remaining = self.remaining.saturating_add(n - paid);
    }

    fn shrink_permits(&mut self, n: usize) {
        let taken = n.min(self.remaining);
        self.remaining -= taken;
        self.owed = self.owed.saturating_add(n - taken);
    }

    fn change_effective_capacity(&mut self, old: usize, new: usize, wakeups: &mut Vec<Waker>) {
        if new > old {
            self.add_permits(new - old);
        } else {
            self.shrink_permits(old - new);
        }
        self.pump(wakeups);
    }
}

/// Counting semaphore whose blocking acquire suspends the calling fiber.
pub struct Semaphore {
    state: Mutex<State>,
}

impl Semaphore {
    /// A semaphore with `capacity` permits, all initially available.
    pub fn new(capacity: usize) -> Self {
        Semaphore {
            state: Mutex::new(State {
                remaining: capacity,
                capacity,
                capacity_override: None,
                owed: 0,
                in_flight: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Non-blocking acquire of one permit.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_many(1)
    }

    /// Non-blocking acquire of `n` permits. Fails while earlier waiters are
    /// parked, preserving FIFO service.
    pub fn try_acquire_many(&self, n: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.waiters.is_empty() || n > state.effective_capacity() || n > state.remaining {
            return false;
        }
        state.remaining -= n;
        state.in_flight = state.in_flight.saturating_add(n);
        true
    }

    /// Suspends until one permit is available, the deadline passes or the
    /// task is cancelled.
    pub async fn acquire_until(&self, deadline: Deadline) -> AcquireStatus {
        self.acquire_many_until(deadline, 1).await
    }

    /// Suspends until `n` permits are available, the deadline passes or the
    /// task is cancelled.
    pub fn acquire_many_until(&self, deadline: Deadline, n: usize) -> AcquireFuture<'_> {
        AcquireFuture::new(self, deadline, n, true)
    }

    /// Acquire that ignores task cancellation. Mutexes are built on this:
    /// a lock must either be taken or not at all, and cleanup paths of
    /// cancelled tasks still need them.
    pub(crate) fn acquire_many_uncancellable(&self, deadline: Deadline, n: usize) -> AcquireFuture<'_> {
        AcquireFuture::new(self, deadline, n, false)
    }

    /// Returns `n` permits and serves eligible waiters head-first.
    pub fn release(&self, n: usize) {
        let mut wakeups = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.add_permits(n);
            state.in_flight = state.in_flight.saturating_sub(n);
            state.pump(&mut wakeups);
        }
        for waker in wakeups {
            waker.wake();
        }
    }

    /// Permits currently held by acquirers. Approximate under concurrency.
    pub fn used_approx(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    /// Permits currently available. Approximate under concurrency.
    pub fn remaining_approx(&self) -> usize {
        self.state.lock().unwrap().remaining
    }

    /// The owner-facing capacity knob.
    pub fn capacity_control(&self) -> CapacityControl<'_> {
        CapacityControl { semaphore: self }
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Semaphore")
            .field("remaining", &state.remaining)
            .field("capacity", &state.capacity)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Capacity adjustment view of a [`Semaphore`], kept separate so that the
/// override machinery does not leak into the acquire/release surface.
pub struct CapacityControl<'a> {
    semaphore: &'a Semaphore,
}

impl CapacityControl<'_> {
    /// Changes the configured capacity. Growth releases the delta; a shrink
    /// is collected from available permits first and owed by outstanding
    /// ones after.
    pub fn set_capacity(&self, capacity: usize) {
        let mut wakeups = Vec::new();
        {
            let mut state = self.semaphore.state.lock().unwrap();
            let old = state.capacity;
            state.capacity = capacity;
            if state.capacity_override.is_none() {
                state.change_effective_capacity(old, capacity, &mut wakeups);
            }
        }
        for waker in wakeups {
            waker.wake();
        }
    }

    /// Temporarily replaces the configured capacity. Queues close their
    /// push side with an override of zero (fails every parked producer) and
    /// release their pop side with a huge one (grants every parked
    /// consumer).
    pub fn set_capacity_override(&self, capacity: usize) {
        let mut wakeups = Vec::new();
        {
            let mut state = self.semaphore.state.lock().unwrap();
            let old = state.effective_capacity();
            state.capacity_override = Some(capacity);
            state.change_effective_capacity(old, capacity, &mut wakeups);
        }
        for waker in wakeups {
            waker.wake();
        }
    }

    /// Restores the configured capacity.
    pub fn remove_capacity_override(&self) {
        let mut wakeups = Vec::new();
        {
            let mut state = self.semaphore.state.lock().unwrap();
            let Some(overridden) = state.capacity_override.take() else { return };
            let configured = state.capacity;
            state.change_effective_capacity(overridden, configured, &mut wakeups);
        }
        for waker in wakeups {
            waker.wake();
        }
    }

    /// The configured capacity (ignores any override).
    pub fn capacity(&self) -> usize {
        self.semaphore.state.lock().unwrap().capacity
    }
}

/// Future of a blocking acquire. Dropping it mid-wait leaves the queue; if
/// the grant raced the drop, the permits go straight back.
pub struct AcquireFuture<'a> {
    semaphore: &'a Semaphore,
    n: usize,
    deadline: Deadline,
    honor_cancellation: bool,
    waiter: Option<Arc<Waiter>>,
    timer: Option<TimerRegistration>,
    token: Option<CancellationToken>,
    done: bool,
}

impl<'a> AcquireFuture<'a> {
    fn new(semaphore: &'a Semaphore, deadline: Deadline, n: usize, honor_cancellation: bool) -> Self {
        AcquireFuture {
            semaphore,
            n,
            deadline,
            honor_cancellation,
            waiter: None,
            timer: None,
            token: None,
            done: false,
        }
    }

    /// Unlinks our waiter, if it is still queued. Returns `true` if a grant
    /// raced us and the permits must be handed back.
    fn abandon(&self, waiter: &Arc<Waiter>) -> bool {
        let mut wakeups = Vec::new();
        let granted;
        {
            let mut state = self.semaphore.state.lock().unwrap();
            if let Some(position) = state.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
                state.waiters.remove(position);
                granted = false;
            } else {
                granted = waiter.state.load(Ordering::Acquire) == GRANTED;
                if granted {
                    state.add_permits(self.n);
                    state.in_flight = state.in_flight.saturating_sub(self.n);
                    state.pump(&mut wakeups);
                }
            }
        }
        for waker in wakeups {
            waker.wake();
        }
        granted
    }
}

impl Future for AcquireFuture<'_> {
    type Output = AcquireStatus;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.waiter.is_none() {
            // First poll runs inside the owning task, so the ambient token
            // and task deadline are captured here
            if this.honor_cancellation {
                this.token = current::try_cancellation_token();
                this.deadline = this.deadline.min(current::task_deadline());
            }

            if this.honor_cancellation
                && let Some(token) = &this.token
                && token.is_cancellation_requested()
            {
                this.done = true;
                return Poll::Ready(AcquireStatus::Cancelled);
            }

            {
                let mut state = this.semaphore.state.lock().unwrap();
                if this.n > state.effective_capacity() {
                    this.done = true;
                    return Poll::Ready(AcquireStatus::Unsatisfiable);
                }
                if state.waiters.is_empty() && this.n <= state.remaining {
                    state.remaining -= this.n;
                    state.in_flight = state.in_flight.saturating_add(this.n);
                    this.done = true;
                    return Poll::Ready(AcquireStatus::Acquired);
                }
                if this.deadline.is_reached() {
                    this.done = true;
                    return Poll::Ready(AcquireStatus::TimedOut);
                }
                let waiter = Arc::new(Waiter {
                    n: this.n,
                    state: AtomicU8::new(WAITING),
                    waker: Mutex::new(cx.waker().clone()),
                });
                state.waiters.push_back(waiter.clone());
                this.waiter = Some(waiter);
            }

            if let Some(instant) = this.deadline.instant() {
                this.timer = Some(TimerRegistration::new(instant, cx.waker()));
            }
            if let Some(token) = &this.token {
                token.register(cx.waker());
            }
            return Poll::Pending;
        }

        let waiter = this.waiter.as_ref().unwrap().clone();
        match waiter.state.load(Ordering::Acquire) {
            GRANTED => {
                this.done = true;
                Poll::Ready(AcquireStatus::Acquired)
            }
            REJECTED => {
                this.done = true;
                Poll::Ready(AcquireStatus::Unsatisfiable)
            }
            _ => {
                if this.honor_cancellation
                    && let Some(token) = &this.token
                    && token.is_cancellation_requested()
                {
                    this.done = true;
                    // A racing grant is returned by `abandon`; the wait
                    // still reports the cancellation
                    this.abandon(&waiter);
                    return Poll::Ready(AcquireStatus::Cancelled);
                }
                if this.deadline.is_reached() {
                    this.done = true;
                    this.abandon(&waiter);
                    return Poll::Ready(AcquireStatus::TimedOut);
                }

                *waiter.waker.lock().unwrap() = cx.waker().clone();
                if let Some(timer) = &this.timer {
                    timer.set_waker(cx.waker());
                }
                if let Some(token) = &this.token {
                    token.register(cx.waker());
                }
                // The grant may have landed between the state load and the
                // waker update
                if waiter.state.load(Ordering::Acquire) != WAITING {
                    cx.waker().wake_by_ref();
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for AcquireFuture<'_> {
    fn drop(&mut self) {
        if !self.done
            && let Some(waiter) = self.waiter.take()
        {
            self.abandon(&waiter);
        }
    }
}
