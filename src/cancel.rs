//! Cooperative task cancellation.
//!
//! Every task carries a [`CancellationToken`]. Cancellation is observed only
//! at suspension points: a pending wait registers with the token, and
//! [`CancellationToken::request_cancel`] wakes it so the primitive can
//! return a `Cancelled` status. Between suspension points code runs to
//! completion undisturbed.
//!
//! Tokens form a tree. A child created with [`CancellationToken::child`]
//! holds only a weak link to its parent, so a task may outlive its spawner;
//! cancelling the parent propagates a [`CancellationReason::Parent`]
//! cancellation to the children that are still alive.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::Waker;

/// Why a task was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    /// Explicit `request_cancel` by user code.
    User,
    /// The task's own deadline expired.
    Deadline,
    /// The owning task processor is shutting down.
    Shutdown,
    /// Load shedding decided this task is expendable.
    Overload,
    /// The parent task was cancelled.
    Parent,
}

const REASONS: [CancellationReason; 5] = [
    CancellationReason::User,
    CancellationReason::Deadline,
    CancellationReason::Shutdown,
    CancellationReason::Overload,
    CancellationReason::Parent,
];

// Token state machine: NotRequested -> Requested -> Acknowledged,
// with `clear` returning to NotRequested from either. State lives in the
// low two bits, the reason in the bits above, so a single load observes a
// consistent (state, reason) pair.
const NOT_REQUESTED: u8 = 0;
const REQUESTED: u8 = 1;
const ACKNOWLEDGED: u8 = 2;
const STATE_MASK: u8 = 0b11;

struct Inner {
    state: AtomicU8,
    parent: Weak<Inner>,
    children: Mutex<Vec<Weak<Inner>>>,
    wakers: Mutex<Vec<Waker>>,
}

impl Inner {
    fn new(parent: Weak<Inner>) -> Arc<Self> {
        Arc::new(Inner {
            state: AtomicU8::new(NOT_REQUESTED),
            parent,
            children: Mutex::new(Vec::new()),
            wakers: Mutex::new(Vec::new()),
        })
    }

    fn request(&self, reason: CancellationReason) -> bool {
        let requested = REQUESTED | (reason as u8) << 2;
        if self
            .state
            .compare_exchange(NOT_REQUESTED, requested, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Already requested (or acknowledged); first reason wins
            return false;
        }

        for waker in self.wakers.lock().unwrap().drain(..) {
            waker.wake();
        }

        let children = std::mem::take(&mut *self.children.lock().unwrap());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.request(CancellationReason::Parent);
            }
        }
        true
    }

    fn is_requested(&self) -> bool {
        if self.state.load(Ordering::Acquire) != NOT_REQUESTED {
            return true;
        }
        // Not locally cancelled; a parent may have been cancelled before we
        // were linked into its child list
        match self.parent.upgrade() {
            Some(parent) => parent.is_requested(),
            None => false,
        }
    }
}

/// Shared tri-state cancellation flag of one task.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// A fresh, un-cancelled token with no parent.
    pub fn new() -> Self {
        CancellationToken { inner: Inner::new(Weak::new()) }
    }

    /// A child token. The child only weakly references `self`, so the child
    /// task may outlive its parent without keeping the parent alive.
    pub fn child(&self) -> Self {
        let child = Inner::new(Arc::downgrade(&self.inner));
        if self.inner.state.load(Ordering::Acquire) == NOT_REQUESTED {
            self.inner.children.lock().unwrap().push(Arc::downgrade(&child));
        } else {
            child.request(CancellationReason::Parent);
        }
        CancellationToken { inner: child }
    }

    /// Marks the token cancelled and wakes any suspended wait registered on
    /// it. Returns `false` if cancellation was already requested; the first
    /// reason sticks.
    pub fn request_cancel(&self, reason: CancellationReason) -> bool {
        self.inner.request(reason)
    }

    /// True once cancellation has been requested, either on this token or
    /// on a live ancestor.
    pub fn is_cancellation_requested(&self) -> bool {
        self.inner.is_requested()
    }

    /// The reason of the first cancellation request, if any.
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        let bits = self.inner.state.load(Ordering::Acquire);
        if bits & STATE_MASK == NOT_REQUESTED {
            return None;
        }
        Some(REASONS[(bits >> 2) as usize])
    }

    /// Records that the task observed the request. Purely diagnostic; the
    /// token still reads as cancelled.
    pub fn acknowledge(&self) {
        let bits = self.inner.state.load(Ordering::Acquire);
        if bits & STATE_MASK == REQUESTED {
            let _ = self.inner.state.compare_exchange(
                bits,
                ACKNOWLEDGED | (bits & !STATE_MASK),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Suppresses a pending cancellation so cleanup code can use blocking
    /// primitives again.
    pub fn clear(&self) {
        self.inner.state.store(NOT_REQUESTED, Ordering::Release);
    }

    /// Registers a waker to be woken by `request_cancel`. Wakes immediately
    /// if cancellation was already requested.
    pub(crate) fn register(&self, waker: &Waker) {
        if self.inner.is_requested() {
            waker.wake_by_ref();
            return;
        }
        let mut wakers = self.inner.wakers.lock().unwrap();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
        drop(wakers);
        // Request may have slipped in between the check and the push
        if self.inner.is_requested() {
            waker.wake_by_ref();
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("requested", &self.is_cancellation_requested())
            .field("reason", &self.cancellation_reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_clean() {
        let token = CancellationToken::new();
        assert!(!token.is_cancellation_requested());
        assert_eq!(token.cancellation_reason(), None);
    }

    #[test]
    fn first_reason_wins() {
        let token = CancellationToken::new();
        assert!(token.request_cancel(CancellationReason::Deadline));
        assert!(!token.request_cancel(CancellationReason::User));
        assert_eq!(token.cancellation_reason(), Some(CancellationReason::Deadline));
    }

    #[test]
    fn parent_cancel_reaches_children() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.request_cancel(CancellationReason::Shutdown);

        assert!(child.is_cancellation_requested());
        assert_eq!(child.cancellation_reason(), Some(CancellationReason::Parent));
        assert!(grandchild.is_cancellation_requested());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let parent = CancellationToken::new();
        parent.request_cancel(CancellationReason::User);

        let child = parent.child();
        assert!(child.is_cancellation_requested());
        assert_eq!(child.cancellation_reason(), Some(CancellationReason::Parent));
    }

    #[test]
    fn child_cancel_does_not_climb() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.request_cancel(CancellationReason::User);
        assert!(!parent.is_cancellation_requested());
    }

    #[test]
    fn clear_suppresses() {
        let token = CancellationToken::new();
        token.request_cancel(CancellationReason::User);
        assert!(token.is_cancellation_requested());
        token.clear();
        assert!(!token.is_cancellation_requested());
    }

    #[test]
    fn child_outlives_parent() {
        let child = {
            let parent = CancellationToken::new();
            parent.child()
        };
        // Parent dropped; the weak link is dead, the child simply reports
        // its own state
        assert!(!child.is_cancellation_requested());
        child.request_cancel(CancellationReason::User);
        assert!(child.is_cancellation_requested());
    }
}
