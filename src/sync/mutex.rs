//! Fiber-aware mutual exclusion.
//!
//! A binary [`Semaphore`] underneath: `lock` acquires the single permit,
//! dropping the guard releases it. Waiting fibers park in the semaphore's
//! FIFO, so the mutex inherits its bounded-waiting property. `lock` is
//! deliberately cancellation-blind — cleanup paths of cancelled tasks must
//! still be able to take their locks.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

use crate::deadline::Deadline;
use crate::sync::semaphore::{AcquireStatus, Semaphore};

/// Mutual exclusion whose `lock` suspends the fiber, never the thread.
pub struct Mutex<T: ?Sized> {
    semaphore: Semaphore,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(data: T) -> Self {
        Mutex { semaphore: Semaphore::new(1), data: UnsafeCell::new(data) }
    }

    /// Suspends until the lock is held.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        let status = self.semaphore.acquire_many_uncancellable(Deadline::NONE, 1).await;
        debug_assert_eq!(status, AcquireStatus::Acquired);
        MutexGuard { mutex: self }
    }

    /// Like [`Self::lock`] with a deadline. `None` on expiry.
    pub async fn lock_until(&self, deadline: Deadline) -> Option<MutexGuard<'_, T>> {
        match self.semaphore.acquire_many_uncancellable(deadline, 1).await {
            AcquireStatus::Acquired => Some(MutexGuard { mutex: self }),
            _ => None,
        }
    }

    /// Non-blocking lock attempt.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.semaphore.try_acquire().then(|| MutexGuard { mutex: self })
    }

    /// Exclusive access without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII lock token. Must be dropped in the same task that locked; do not
/// hold it across `spawn` boundaries.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.semaphore.release(1);
    }
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn exclusive_access() {
        let mutex = Arc::new(Mutex::new(0u64));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let mutex = mutex.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    *mutex.lock().await += 1;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*mutex.lock().await, 8000);
    }

    #[tokio::test]
    async fn try_lock_respects_holder() {
        let mutex = Mutex::new(());
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[tokio::test]
    async fn lock_until_expires() {
        let mutex = Mutex::new(());
        let _held = mutex.lock().await;
        let attempt = mutex.lock_until(Deadline::from_duration(Duration::from_millis(10))).await;
        assert!(attempt.is_none());
    }
}
