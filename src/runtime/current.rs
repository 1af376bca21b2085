//! Accessors for the task currently being polled on this thread.
//!
//! The worker installs the running task here for the duration of each poll.
//! Fibers never migrate mid-poll, so thread-local storage is exact. Off the
//! runtime (plain threads, foreign executors) the accessors degrade to
//! "no task": no token, infinite deadline, plain cooperative yield.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::cancel::CancellationToken;
use crate::deadline::Deadline;
use crate::runtime::task::RawTask;

thread_local! {
    static CURRENT: RefCell<Option<Arc<RawTask>>> = const { RefCell::new(None) };
}

/// Installs `task` as current for the duration of the guard. Restores the
/// previous value on drop, so panics during a poll cannot leak a stale
/// task into the worker's next poll.
pub(crate) struct CurrentTaskGuard {
    previous: Option<Arc<RawTask>>,
}

pub(crate) fn enter(task: Arc<RawTask>) -> CurrentTaskGuard {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(task));
    CurrentTaskGuard { previous }
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| *current.borrow_mut() = self.previous.take());
    }
}

fn with_current<R>(f: impl FnOnce(Option<&Arc<RawTask>>) -> R) -> R {
    CURRENT.with(|current| f(current.borrow().as_ref()))
}

/// The current task's cancellation token.
///
/// # Panics
///
/// Panics when called outside a task. Use [`try_cancellation_token`]
/// internally where "no task" is an expected state.
pub fn cancellation_token() -> CancellationToken {
    try_cancellation_token().expect("current_task accessor called outside of a filament task")
}

pub(crate) fn try_cancellation_token() -> Option<CancellationToken> {
    with_current(|task| task.map(|t| t.token.clone()))
}

/// True if the current task has been asked to stop. Advisory: callers are
/// expected to consult it in long computations and return early.
pub fn should_cancel() -> bool {
    with_current(|task| task.is_some_and(|t| t.token.is_cancellation_requested()))
}

/// Attaches `deadline` to the current task. Subsequent blocking calls clamp
/// their waits to it. No-op outside a task.
pub fn set_deadline(deadline: Deadline) {
    with_current(|task| {
        if let Some(task) = task {
            *task.deadline.lock().unwrap() = deadline;
        }
    });
}

/// The deadline attached to the current task, or [`Deadline::NONE`].
pub fn task_deadline() -> Deadline {
    with_current(|task| task.map_or(Deadline::NONE, |t| *t.deadline.lock().unwrap()))
}

/// Diagnostic identifier of the current task, if any.
pub fn task_id() -> Option<u64> {
    with_current(|task| task.map(|t| t.id))
}

/// Cooperatively gives up the worker to other runnable fibers.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future of [`yield_now`]: pending exactly once.
#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        // Requeue ourselves behind whatever is already runnable
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_runtime_defaults() {
        assert!(try_cancellation_token().is_none());
        assert!(!should_cancel());
        assert_eq!(task_deadline(), Deadline::NONE);
        assert_eq!(task_id(), None);
        set_deadline(Deadline::from_duration(std::time::Duration::from_secs(1)));
        assert_eq!(task_deadline(), Deadline::NONE);
    }

    #[tokio::test]
    async fn yield_now_completes() {
        yield_now().await;
        yield_now().await;
    }
}
