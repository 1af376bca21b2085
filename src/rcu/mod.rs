//! Read-copy-update variable.
//!
//! A [`Variable`] holds read-mostly data. Readers take a snapshot pointer
//! without ever blocking and keep it valid for as long as they hold it;
//! writers clone the current value, mutate the copy and publish it with one
//! sequentially-consistent pointer store. Replaced snapshots are *retired*
//! and reclaimed once a striped read indicator proves no reader still uses
//! them.
//!
//! ## Record lifecycle
//!
//! ```text
//!   free list ──► emplaced ──► current ──► retired ──► (is_free) ──► free list
//! ```
//!
//! At any instant exactly one record is current; retired records wait for
//! their readers; free records keep their allocation for the next write.
//! Records are only deallocated in the variable's destructor.
//!
//! ## Reader protocol
//!
//! 1. load `current`
//! 2. lock the record's read indicator
//! 3. reload `current`; if unchanged the lock is proven to cover a live
//!    snapshot, otherwise unlock and retry with the new record
//!
//! Without the re-check, a writer could swap and reclaim the record between
//! steps 1 and 2. The indicator's internal seq-cst fence pairs with the
//! writer's scan fence, so a writer that observes `is_free()` cannot have
//! missed a reader that locked before its pointer store. Readers may run on
//! any thread, coroutine or not.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::intrusive::{FreeListNode, IntrusiveStack, ReadIndicatorLock, StripedReadIndicator};
use crate::runtime::TaskProcessor;
use crate::sync::{Mutex, MutexGuard};

/// One version of the value plus its reader bookkeeping.
struct SnapshotRecord<T> {
    data: std::cell::UnsafeCell<Option<T>>,
    indicator: StripedReadIndicator,
    free_hook: AtomicPtr<SnapshotRecord<T>>,
    /// Writer-only link of the retired list; guarded by the writer mutex.
    next_retired: AtomicPtr<SnapshotRecord<T>>,
}

unsafe impl<T: Send + Sync> Send for SnapshotRecord<T> {}
unsafe impl<T: Send + Sync> Sync for SnapshotRecord<T> {}

impl<T> SnapshotRecord<T> {
    fn empty() -> NonNull<Self> {
        NonNull::from(Box::leak(Box::new(SnapshotRecord {
            data: std::cell::UnsafeCell::new(None),
            indicator: StripedReadIndicator::default(),
            free_hook: AtomicPtr::new(std::ptr::null_mut()),
            next_retired: AtomicPtr::new(std::ptr::null_mut()),
        })))
    }

    /// # Safety
    ///
    /// Caller must hold a reader lock on the record or the writer mutex.
    unsafe fn value(&self) -> &T {
        unsafe { (*self.data.get()).as_ref().expect("snapshot record without a value") }
    }
}

impl<T> FreeListNode for SnapshotRecord<T> {
    fn free_hook(&self) -> &AtomicPtr<Self> {
        &self.free_hook
    }
}

/// Singly-linked list of retired records; touched only under the writer
/// mutex.
struct RetiredList<T> {
    head: *mut SnapshotRecord<T>,
}

unsafe impl<T: Send + Sync> Send for RetiredList<T> {}

impl<T> RetiredList<T> {
    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    fn push(&mut self, record: NonNull<SnapshotRecord<T>>) {
        unsafe { record.as_ref() }.next_retired.store(self.head, Ordering::Relaxed);
        self.head = record.as_ptr();
    }

    fn remove_and_dispose_if(
        &mut self,
        predicate: impl Fn(&SnapshotRecord<T>) -> bool,
        mut disposer: impl FnMut(NonNull<SnapshotRecord<T>>),
    ) {
        let mut cursor: *mut *mut SnapshotRecord<T> = &mut self.head;
        unsafe {
            while !(*cursor).is_null() {
                let record = NonNull::new_unchecked(*cursor);
                if predicate(record.as_ref()) {
                    *cursor = record.as_ref().next_retired.swap(std::ptr::null_mut(), Ordering::Relaxed);
                    disposer(record);
                } else {
                    cursor = record.as_ref().next_retired.as_ptr();
                }
            }
        }
    }
}

/// Garbage disposal strategy for retired snapshots.
///
/// A sum type rather than a trait hierarchy: the variants differ only in
/// *where* the destructor runs.
#[derive(Clone, Default)]
pub enum Deleter {
    /// Destroy inline under the writer mutex. Right for small values with
    /// cheap destructors, and the only option off the runtime.
    #[default]
    Sync,
    /// Destroy in a detached fiber on the given processor. Right for
    /// multi-megabyte caches whose destructors would stall the writer.
    /// The variable's destructor waits for all pending deletions.
    Async(Arc<TaskProcessor>),
}

/// Counts pending detached deletions; the variable's destructor blocks
/// until every token is returned.
struct WaitTokenStorage {
    state: Arc<(std::sync::Mutex<usize>, std::sync::Condvar)>,
}

struct WaitToken {
    state: Arc<(std::sync::Mutex<usize>, std::sync::Condvar)>,
}

impl WaitTokenStorage {
    fn new() -> Self {
        WaitTokenStorage { state: Arc::new((std::sync::Mutex::new(0), std::sync::Condvar::new())) }
    }

    fn token(&self) -> WaitToken {
        *self.state.0.lock().unwrap() += 1;
        WaitToken { state: self.state.clone() }
    }

    fn wait_for_all(&self) {
        let (lock, condvar) = &*self.state;
        let mut count = lock.lock().unwrap();
        while *count > 0 {
            count = condvar.wait(count).unwrap();
        }
    }
}

impl Drop for WaitToken {
    fn drop(&mut self) {
        let (lock, condvar) = &*self.state;
        let mut count = lock.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            condvar.notify_all();
        }
    }
}

/// Owns a retired record just long enough to destroy its value and return
/// the empty record to the free list. Movable into a detached deletion
/// fiber; the variable outlives it via the wait-token protocol.
struct SnapshotHandle<T> {
    record: NonNull<SnapshotRecord<T>>,
    free_list: NonNull<IntrusiveStack<SnapshotRecord<T>>>,
}

unsafe impl<T: Send> Send for SnapshotHandle<T> {}

impl<T> Drop for SnapshotHandle<T> {
    fn drop(&mut self) {
        unsafe {
            *self.record.as_ref().data.get() = None;
            self.free_list.as_ref().push(self.record);
        }
    }
}

/// Read-mostly shared variable with lock-free readers.
///
/// Writers are serialised by a fiber mutex and never block readers; a slow
/// writer only delays other writers.
pub struct Variable<T: Send + Sync + 'static> {
    /// Covers the `current` store, free-list pops and the retired list.
    mutex: Mutex<RetiredList<T>>,
    free_list: IntrusiveStack<SnapshotRecord<T>>,
    deleter: Deleter,
    wait_tokens: WaitTokenStorage,
    current: AtomicPtr<SnapshotRecord<T>>,
}

unsafe impl<T: Send + Sync + 'static> Send for Variable<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for Variable<T> {}

impl<T: Send + Sync + 'static> Variable<T> {
    /// A variable with synchronous garbage disposal.
    pub fn new(initial_value: T) -> Self {
        Self::with_deleter(initial_value, Deleter::Sync)
    }

    /// A variable with the chosen garbage disposal strategy.
    pub fn with_deleter(initial_value: T, deleter: Deleter) -> Self {
        let record = SnapshotRecord::empty();
        unsafe { *record.as_ref().data.get() = Some(initial_value) };
        Variable {
            mutex: Mutex::new(RetiredList { head: std::ptr::null_mut() }),
            free_list: IntrusiveStack::default(),
            deleter,
            wait_tokens: WaitTokenStorage::new(),
            current: AtomicPtr::new(record.as_ptr()),
        }
    }

    /// A snapshot pointer to the current value. Never blocks; usable from
    /// any thread. The snapshot stays valid and immutable for the
    /// pointer's whole lifetime, regardless of concurrent writers.
    pub fn read(&self) -> ReadablePtr<'_, T> {
        let mut record = self.current.load(Ordering::SeqCst);
        loop {
            // Lock first, then prove the record is still current; the
            // indicator's internal fence makes the lock visible to any
            // writer that scans after its own pointer store
            let lock = unsafe { (*record).indicator.lock() };

            let reloaded = self.current.load(Ordering::SeqCst);
            if reloaded == record {
                return ReadablePtr {
                    record: unsafe { NonNull::new_unchecked(record) },
                    lock: Some(lock),
                    _variable: std::marker::PhantomData,
                };
            }

            unsafe { (*record).indicator.unlock(lock) };
            record = reloaded;
        }
    }

    /// A copy of the current value.
    pub fn read_copy(&self) -> T
    where
        T: Clone,
    {
        self.read().clone_inner()
    }

    /// Begins a write with a copy of the current value. Serialises against
    /// other writers; readers continue undisturbed on the old snapshot
    /// until [`WritablePtr::commit`].
    pub async fn start_write(&self) -> WritablePtr<'_, T>
    where
        T: Clone,
    {
        let guard = self.mutex.lock().await;
        // Safe to clone outside a reader lock: reclamation runs only under
        // the writer mutex, which we hold
        let value = unsafe { (*self.current.load(Ordering::SeqCst)).value().clone() };
        let record = self.emplace_snapshot(move || value);
        WritablePtr { variable: self, guard: Some(guard), record: Some(record) }
    }

    /// Begins a write with a freshly constructed value, skipping the copy.
    pub async fn start_write_emplace(&self, make: impl FnOnce() -> T) -> WritablePtr<'_, T> {
        let guard = self.mutex.lock().await;
        let record = self.emplace_snapshot(make);
        WritablePtr { variable: self, guard: Some(guard), record: Some(record) }
    }

    /// Replaces the value.
    pub async fn assign(&self, new_value: T) {
        self.start_write_emplace(move || new_value).await.commit();
    }

    /// Replaces the value with a freshly constructed one.
    pub async fn emplace(&self, make: impl FnOnce() -> T) {
        self.start_write_emplace(make).await.commit();
    }

    /// Opportunistically reclaims retired snapshots whose readers are gone.
    /// Skips silently if a writer is active; that writer scans anyway.
    pub fn cleanup(&self) {
        if let Some(mut retired) = self.mutex.try_lock() {
            self.scan_retired_list(&mut retired);
        }
    }

    fn emplace_snapshot(&self, make: impl FnOnce() -> T) -> NonNull<SnapshotRecord<T>> {
        // Free-list pops require the writer mutex, which every caller holds
        let record = self.free_list.try_pop().unwrap_or_else(SnapshotRecord::empty);
        debug_assert!(unsafe { (*record.as_ref().data.get()).is_none() });

        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(make)) {
            Ok(value) => {
                unsafe { *record.as_ref().data.get() = Some(value) };
                record
            }
            Err(payload) => {
                // Keep the empty record for the next writer
                unsafe { self.free_list.push(record) };
                std::panic::resume_unwind(payload);
            }
        }
    }

    fn do_assign(&self, new_record: NonNull<SnapshotRecord<T>>, retired: &mut RetiredList<T>) {
        let old = self.current.load(Ordering::SeqCst);
        // The one store readers double-check against
        self.current.store(new_record.as_ptr(), Ordering::SeqCst);

        retired.push(unsafe { NonNull::new_unchecked(old) });
        self.scan_retired_list(retired);
    }

    fn scan_retired_list(&self, retired: &mut RetiredList<T>) {
        if retired.is_empty() {
            return;
        }
        // is_free() fences before reading the stripes, pairing with the
        // readers' lock fences
        retired.remove_and_dispose_if(
            |record| record.indicator.is_free(),
            |record| self.delete_snapshot(record),
        );
    }

    fn delete_snapshot(&self, record: NonNull<SnapshotRecord<T>>) {
        let handle = SnapshotHandle { record, free_list: NonNull::from(&self.free_list) };
        match &self.deleter {
            Deleter::Sync => drop(handle),
            Deleter::Async(processor) => {
                let token = self.wait_tokens.token();
                let spawned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    processor
                        .spawn(async move {
                            // The handle must die before the token: the
                            // variable's destructor returns once the last
                            // token drops
                            drop(handle);
                            drop(token);
                        })
                        .detach();
                }));
                if spawned.is_err() {
                    // Processor unavailable; the handle and token were
                    // dropped with the rejected future, so the deletion
                    // already happened synchronously
                    tracing::warn!("async snapshot deletion fell back to synchronous");
                }
            }
        }
    }
}

impl<T: Send + Sync + 'static> Drop for Variable<T> {
    fn drop(&mut self) {
        {
            let current = *self.current.get_mut();
            let record = unsafe { &*current };
            assert!(record.indicator.is_free(), "RCU variable is destroyed while being used");
            drop(unsafe { Box::from_raw(current) });
        }

        // Let detached deleters finish touching the free list
        self.wait_tokens.wait_for_all();

        self.mutex.get_mut().remove_and_dispose_if(
            |_| true,
            |record| {
                assert!(
                    unsafe { record.as_ref() }.indicator.is_free(),
                    "RCU variable is destroyed while being used"
                );
                drop(unsafe { Box::from_raw(record.as_ptr()) });
            },
        );

        unsafe {
            self.free_list.dispose_unsafe(|record| drop(unsafe { Box::from_raw(record.as_ptr()) }));
        }
    }
}

impl<T: Send + Sync + std::fmt::Debug + 'static> std::fmt::Debug for Variable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("rcu::Variable").field("current", &*self.read()).finish()
    }
}

/// Reader snapshot pointer; dereferences to the immutable value it was
/// created on, for as long as it lives.
#[must_use = "a ReadablePtr only pins its snapshot while it is held"]
pub struct ReadablePtr<'a, T: Send + Sync + 'static> {
    record: NonNull<SnapshotRecord<T>>,
    lock: Option<ReadIndicatorLock>,
    _variable: std::marker::PhantomData<&'a Variable<T>>,
}

unsafe impl<T: Send + Sync + 'static> Send for ReadablePtr<'_, T> {}
unsafe impl<T: Send + Sync + 'static> Sync for ReadablePtr<'_, T> {}

impl<T: Send + Sync + 'static> ReadablePtr<'_, T> {
    fn clone_inner(&self) -> T
    where
        T: Clone,
    {
        (**self).clone()
    }
}

impl<T: Send + Sync + 'static> std::ops::Deref for ReadablePtr<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // The indicator lock keeps the record from being reclaimed
        unsafe { self.record.as_ref().value() }
    }
}

impl<T: Send + Sync + 'static> Clone for ReadablePtr<'_, T> {
    fn clone(&self) -> Self {
        // Re-locking a record we already pin cannot race reclamation
        let lock = unsafe { self.record.as_ref().indicator.lock() };
        ReadablePtr { record: self.record, lock: Some(lock), _variable: std::marker::PhantomData }
    }
}

impl<T: Send + Sync + 'static> Drop for ReadablePtr<'_, T> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            unsafe { self.record.as_ref().indicator.unlock(lock) };
        }
    }
}

/// Writer pointer: an exclusive, not-yet-published copy of the value.
/// Commit publishes it; dropping without commit discards it.
#[must_use = "dropping a WritablePtr without commit() discards the write"]
pub struct WritablePtr<'a, T: Send + Sync + 'static> {
    variable: &'a Variable<T>,
    guard: Option<MutexGuard<'a, RetiredList<T>>>,
    record: Option<NonNull<SnapshotRecord<T>>>,
}

impl<T: Send + Sync + 'static> WritablePtr<'_, T> {
    /// Publishes the new value. New readers observe it immediately; the
    /// replaced snapshot is retired and reclaimed once its readers drop.
    pub fn commit(mut self) {
        let record = self.record.take().expect("commit called twice");
        let mut guard = self.guard.take().expect("writer lock missing");
        self.variable.do_assign(record, &mut guard);
    }
}

impl<T: Send + Sync + 'static> std::ops::Deref for WritablePtr<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        let record = self.record.expect("WritablePtr used after commit");
        unsafe { record.as_ref().value() }
    }
}

impl<T: Send + Sync + 'static> std::ops::DerefMut for WritablePtr<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        let record = self.record.expect("WritablePtr used after commit");
        // Exclusive: the record is unpublished and we hold the writer mutex
        unsafe { (*record.as_ref().data.get()).as_mut().expect("snapshot record without a value") }
    }
}

impl<T: Send + Sync + 'static> Drop for WritablePtr<'_, T> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            // Abandoned write: destroy the copy, keep the allocation
            drop(SnapshotHandle { record, free_list: NonNull::from(&self.variable.free_list) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TaskProcessor;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Counts live instances so tests can observe reclamation.
    struct Tracked {
        value: u64,
        live: Arc<AtomicUsize>,
    }

    impl Tracked {
        fn new(value: u64, live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Tracked { value, live: live.clone() }
        }
    }

    impl Clone for Tracked {
        fn clone(&self) -> Self {
            self.live.fetch_add(1, Ordering::SeqCst);
            Tracked { value: self.value, live: self.live.clone() }
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn read_sees_initial_value() {
        let variable = Variable::new(41u64);
        assert_eq!(*variable.read(), 41);
        assert_eq!(variable.read_copy(), 41);
    }

    #[test]
    fn assign_is_visible_to_new_readers() {
        let variable = Variable::new(1u64);
        block_on(variable.assign(2));
        assert_eq!(*variable.read(), 2);
    }

    #[test]
    fn readable_ptr_pins_its_snapshot() {
        let variable = Variable::new(String::from("old"));
        let pinned = variable.read();
        block_on(variable.assign(String::from("new")));

        // The old snapshot survives for the pinned reader only
        assert_eq!(&*pinned, "old");
        assert_eq!(&*variable.read(), "new");
        drop(pinned);
    }

    #[test]
    fn start_write_publishes_on_commit_only() {
        let variable = Variable::new(10u64);
        let mut write = block_on(variable.start_write());
        *write += 5;
        assert_eq!(*variable.read(), 10, "uncommitted write became visible");
        write.commit();
        assert_eq!(*variable.read(), 15);
    }

    #[test]
    fn abandoned_write_changes_nothing() {
        let live = Arc::new(AtomicUsize::new(0));
        let variable = Variable::new(Tracked::new(1, &live));
        {
            let mut write = block_on(variable.start_write());
            write.value = 99;
            // Dropped without commit
        }
        assert_eq!(variable.read().value, 1);
        assert_eq!(live.load(Ordering::SeqCst), 1, "abandoned copy leaked");
    }

    #[test]
    fn retired_records_are_reclaimed_when_free() {
        let live = Arc::new(AtomicUsize::new(0));
        let variable = Variable::new(Tracked::new(0, &live));

        for i in 1..=10 {
            block_on(variable.assign(Tracked::new(i, &live)));
        }
        // No readers are pinning anything: each assign's scan reclaimed
        // the previous snapshot, only the current value is alive
        assert_eq!(live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pinned_record_is_reclaimed_by_cleanup_after_release() {
        let live = Arc::new(AtomicUsize::new(0));
        let variable = Variable::new(Tracked::new(0, &live));

        let pinned = variable.read();
        block_on(variable.assign(Tracked::new(1, &live)));
        assert_eq!(live.load(Ordering::SeqCst), 2, "pinned snapshot was reclaimed early");

        drop(pinned);
        variable.cleanup();
        assert_eq!(live.load(Ordering::SeqCst), 1, "cleanup failed to reclaim a free record");
    }

    #[test]
    fn snapshot_records_are_reused() {
        let variable = Variable::new(0u64);
        // Steady-state writing must cycle between two records rather than
        // allocating; observed indirectly by the stable live count of the
        // tracked test above, asserted here over a longer run
        for i in 0..1000u64 {
            block_on(variable.assign(i));
        }
        assert_eq!(*variable.read(), 999);
    }

    #[test]
    fn per_reader_monotonicity() {
        let variable = Arc::new(Variable::new(0u64));
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let variable = variable.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut last = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let seen = *variable.read();
                    assert!(seen >= last, "reader observed {seen} after {last}");
                    last = seen;
                }
            })
        };

        for i in 1..=50_000u64 {
            block_on(variable.assign(i));
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }

    /// Readers on plain OS threads verify snapshot invariants while a
    /// writer churns; the destructor then reclaims everything.
    #[test]
    fn contended_readers_see_consistent_snapshots() {
        const WRITES: u64 = 100_000;

        let variable = Arc::new(Variable::new(0u64));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let variable = variable.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let snapshot = variable.read();
                        let first = *snapshot;
                        assert_eq!(first % 2, 0, "odd value published");
                        // The snapshot must not change under us
                        std::hint::spin_loop();
                        assert_eq!(*snapshot, first, "snapshot mutated while pinned");
                    }
                })
            })
            .collect();

        for i in 1..=WRITES {
            block_on(variable.assign(i * 2));
        }

        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }

        variable.cleanup();
        assert_eq!(*variable.read(), WRITES * 2);
        // Variable drops here; its destructor asserts every record is free
    }

    #[test]
    fn async_deleter_runs_on_the_processor_and_drains() {
        let processor = TaskProcessor::new(2);
        let live = Arc::new(AtomicUsize::new(0));
        {
            let variable =
                Variable::with_deleter(Tracked::new(0, &live), Deleter::Async(processor.clone()));
            for i in 1..=100 {
                block_on(variable.assign(Tracked::new(i, &live)));
            }
            // Dropping the variable waits for every detached deletion
        }
        assert_eq!(live.load(Ordering::SeqCst), 0);
        processor.shutdown();
    }

    #[test]
    fn writers_serialise_but_do_not_block_readers() {
        let processor = TaskProcessor::new(4);
        let variable = Arc::new(Variable::new(0u64));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let variable = variable.clone();
                processor.spawn(async move {
                    for i in 0..100u64 {
                        variable.assign(w * 1000 + i).await;
                    }
                })
            })
            .collect();

        // Reads proceed from this plain thread all along
        for _ in 0..1000 {
            let _ = *variable.read();
        }

        for writer in writers {
            block_on(writer.join()).unwrap();
        }
        processor.shutdown();
    }
}
