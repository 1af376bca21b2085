//! Task representation and join handles.
//!
//! A task is a boxed future (the state-machine rendering of a fiber) plus a
//! shared header: lifecycle state, cancellation token, deadline slot and
//! completion signalling. The scheduler owns the polling loop; the header's
//! waker re-enqueues the task through its processor.
//!
//! Lifecycle: `Queued → Running ⇄ Suspended → Completed`. A wake racing the
//! poll flips `Running → Queued` so the worker knows to re-enqueue instead
//! of parking the task (see the CAS pair in [`TaskWaker::wake_by_ref`] and
//! the worker loop).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Wake, Waker};

use crate::cancel::{CancellationReason, CancellationToken};
use crate::deadline::Deadline;
use crate::runtime::Shared;
use crate::timer::TimerRegistration;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) const QUEUED: u8 = 0;
pub(crate) const RUNNING: u8 = 1;
pub(crate) const SUSPENDED: u8 = 2;
pub(crate) const COMPLETED: u8 = 3;

/// Why `join` produced no value.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// The task's future was dropped before completion.
    #[error("task was cancelled ({reason:?})")]
    Cancelled {
        /// The first cancellation reason recorded on the task's token.
        reason: CancellationReason,
    },
    /// The task body panicked; the panic was captured by the worker.
    #[error("task panicked: {message}")]
    Panicked { message: String },
    /// The waiting task itself was cancelled while joining.
    #[error("join was interrupted by cancellation of the waiting task")]
    WaitInterrupted,
}

/// Outcome of [`TaskHandle::wait_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The task reached a terminal state.
    Ready,
    /// The deadline passed first.
    TimedOut,
    /// The *waiting* task was cancelled.
    Cancelled,
}

/// Typed result slot shared between the spawned future and its handle.
pub(crate) struct ResultSlot<R> {
    inner: Mutex<Option<R>>,
}

impl<R> ResultSlot<R> {
    pub(crate) fn new() -> Self {
        ResultSlot { inner: Mutex::new(None) }
    }

    pub(crate) fn set(&self, value: R) {
        *self.inner.lock().unwrap() = Some(value);
    }

    pub(crate) fn take(&self) -> Option<R> {
        self.inner.lock().unwrap().take()
    }
}

/// The scheduler-facing task object.
pub(crate) struct RawTask {
    pub(crate) id: u64,
    pub(crate) state: AtomicU8,
    pub(crate) token: CancellationToken,
    pub(crate) deadline: Mutex<Deadline>,
    pub(crate) future: Mutex<Option<BoxFuture>>,
    pub(crate) detached: AtomicBool,
    completed: AtomicBool,
    join_wakers: Mutex<Vec<Waker>>,
    panic_message: Mutex<Option<String>>,
    /// One waker per task, reused across polls so that `Waker::will_wake`
    /// deduplicates registrations in waiter lists.
    cached_waker: Mutex<Option<Waker>>,
    /// Back-reference for the waker's re-enqueue; weak so a forgotten task
    /// does not keep the whole processor alive.
    pub(crate) shared: Weak<Shared>,
}

impl RawTask {
    pub(crate) fn new(
        id: u64,
        future: BoxFuture,
        token: CancellationToken,
        deadline: Deadline,
        shared: Weak<Shared>,
    ) -> Arc<Self> {
        Arc::new(RawTask {
            id,
            state: AtomicU8::new(QUEUED),
            token,
            deadline: Mutex::new(deadline),
            future: Mutex::new(Some(future)),
            detached: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            join_wakers: Mutex::new(Vec::new()),
            panic_message: Mutex::new(None),
            cached_waker: Mutex::new(None),
            shared,
        })
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn record_panic(&self, message: String) {
        *self.panic_message.lock().unwrap() = Some(message);
    }

    pub(crate) fn take_panic(&self) -> Option<String> {
        self.panic_message.lock().unwrap().take()
    }

    /// Marks the task terminal and wakes joiners. Idempotent.
    pub(crate) fn mark_completed(&self) {
        self.state.store(COMPLETED, Ordering::Release);
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        // The future (with its captures) dies here, before joiners observe
        // completion
        *self.future.lock().unwrap() = None;
        for waker in self.join_wakers.lock().unwrap().drain(..) {
            waker.wake();
        }
    }

    pub(crate) fn register_join_waker(&self, waker: &Waker) {
        if self.is_completed() {
            waker.wake_by_ref();
            return;
        }
        {
            let mut wakers = self.join_wakers.lock().unwrap();
            if !wakers.iter().any(|w| w.will_wake(waker)) {
                wakers.push(waker.clone());
            }
        }
        // Completion may have raced the push
        if self.is_completed() {
            for waker in self.join_wakers.lock().unwrap().drain(..) {
                waker.wake();
            }
        }
    }

    pub(crate) fn waker(self: &Arc<Self>) -> Waker {
        let mut cache = self.cached_waker.lock().unwrap();
        if let Some(waker) = &*cache {
            return waker.clone();
        }
        // Weak back-reference: a live Waker must not keep the task alive
        let waker = Waker::from(Arc::new(TaskWaker { task: Arc::downgrade(self) }));
        *cache = Some(waker.clone());
        waker
    }
}

struct TaskWaker {
    task: Weak<RawTask>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let Some(task) = self.task.upgrade() else { return };
        loop {
            match task.state.load(Ordering::Acquire) {
                SUSPENDED => {
                    if task
                        .state
                        .compare_exchange(SUSPENDED, QUEUED, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }
                    if let Some(shared) = task.shared.upgrade() {
                        shared.reschedule(task.clone());
                    }
                    return;
                }
                RUNNING => {
                    // Fired during poll: leave a Queued marker so the
                    // worker's park CAS fails and re-enqueues
                    if task
                        .state
                        .compare_exchange(RUNNING, QUEUED, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }
                    return;
                }
                // Already queued or finished
                _ => return,
            }
        }
    }
}

/// Owner-side handle of a spawned task.
///
/// Dropping an un-detached, un-joined handle requests cancellation of the
/// task with [`CancellationReason::Parent`]; the processor keeps tracking
/// it and joins it at shutdown.
#[must_use = "dropping a TaskHandle cancels the task; call detach() to let it run"]
pub struct TaskHandle<R> {
    raw: Arc<RawTask>,
    slot: Arc<ResultSlot<R>>,
    consumed: bool,
}

impl<R> TaskHandle<R> {
    pub(crate) fn new(raw: Arc<RawTask>, slot: Arc<ResultSlot<R>>) -> Self {
        TaskHandle { raw, slot, consumed: false }
    }

    /// Requests cooperative cancellation of the task.
    pub fn request_cancel(&self, reason: CancellationReason) {
        self.raw.token.request_cancel(reason);
    }

    /// The task's cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.raw.token.clone()
    }

    /// Attaches a deadline to the task; blocking primitives inside it clamp
    /// their waits to it.
    pub fn set_deadline(&self, deadline: Deadline) {
        *self.raw.deadline.lock().unwrap() = deadline;
    }

    /// True once the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.raw.is_completed()
    }

    /// Lets the task run to completion on its own. Panics out of a
    /// detached task are logged and suppressed.
    pub fn detach(mut self) {
        self.raw.detached.store(true, Ordering::Release);
        self.consumed = true;
    }

    /// Suspends until the task finishes, the deadline passes, or the
    /// waiting task is cancelled. Does not consume the result.
    pub fn wait_until(&self, deadline: Deadline) -> WaitFuture<'_, R> {
        WaitFuture { handle: self, deadline, timer: None, started: false }
    }

    /// Suspends until the task finishes and takes its result.
    pub async fn join(mut self) -> Result<R, JoinError> {
        match self.wait_until(Deadline::NONE).await {
            WaitStatus::Ready => {}
            WaitStatus::Cancelled => return Err(JoinError::WaitInterrupted),
            WaitStatus::TimedOut => unreachable!("infinite deadline cannot expire"),
        }
        self.consumed = true;
        match self.slot.take() {
            Some(value) => Ok(value),
            None => match self.raw.take_panic() {
                Some(message) => Err(JoinError::Panicked { message }),
                None => Err(JoinError::Cancelled {
                    reason: self
                        .raw
                        .token
                        .cancellation_reason()
                        .unwrap_or(CancellationReason::Shutdown),
                }),
            },
        }
    }
}

impl<R> Drop for TaskHandle<R> {
    fn drop(&mut self) {
        if !self.consumed && !self.raw.is_completed() {
            self.raw.token.request_cancel(CancellationReason::Parent);
        }
    }
}

/// Future of [`TaskHandle::wait_until`].
pub struct WaitFuture<'a, R> {
    handle: &'a TaskHandle<R>,
    deadline: Deadline,
    timer: Option<TimerRegistration>,
    started: bool,
}

impl<R> Future for WaitFuture<'_, R> {
    type Output = WaitStatus;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.started {
            this.started = true;
            this.deadline = this.deadline.min(crate::runtime::current::task_deadline());
        }

        if this.handle.raw.is_completed() {
            return Poll::Ready(WaitStatus::Ready);
        }
        if let Some(token) = crate::runtime::current::try_cancellation_token() {
            if token.is_cancellation_requested() {
                return Poll::Ready(WaitStatus::Cancelled);
            }
            token.register(cx.waker());
        }
        if this.deadline.is_reached() {
            return Poll::Ready(WaitStatus::TimedOut);
        }

        this.handle.raw.register_join_waker(cx.waker());
        match &this.timer {
            Some(timer) => timer.set_waker(cx.waker()),
            None => {
                if let Some(instant) = this.deadline.instant() {
                    this.timer = Some(TimerRegistration::new(instant, cx.waker()));
                }
            }
        }
        if this.handle.raw.is_completed() {
            return Poll::Ready(WaitStatus::Ready);
        }
        Poll::Pending
    }
}
