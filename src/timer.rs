//! Deadline expiry driver.
//!
//! Deadline-aware futures register here to be woken when their deadline
//! passes. A single lazily-started driver thread owns a min-heap of pending
//! expirations and sleeps until the earliest one. Wakes are edge signals
//! only; the waiting future re-checks its deadline on poll, so a spurious
//! or stale wake is harmless.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::task::Waker;
use std::time::Instant;

static DRIVER: OnceLock<TimerDriver> = OnceLock::new();

fn driver() -> &'static TimerDriver {
    DRIVER.get_or_init(TimerDriver::start)
}

/// One pending expiration, shared between the registering future and the
/// driver thread.
struct Entry {
    when: Instant,
    cancelled: AtomicBool,
    waker: Mutex<Waker>,
}

/// Registration guard held by a deadline-aware future. Dropping it lazily
/// removes the expiration from the driver.
pub(crate) struct TimerRegistration {
    entry: Arc<Entry>,
}

impl TimerRegistration {
    /// Schedules a wake of `waker` at `when`.
    pub(crate) fn new(when: Instant, waker: &Waker) -> Self {
        let entry = Arc::new(Entry {
            when,
            cancelled: AtomicBool::new(false),
            waker: Mutex::new(waker.clone()),
        });
        driver().push(entry.clone());
        TimerRegistration { entry }
    }

    /// Refreshes the waker. Futures call this on every poll because the
    /// executor may hand out a different waker each time.
    pub(crate) fn set_waker(&self, waker: &Waker) {
        let mut slot = self.entry.waker.lock().unwrap();
        if !slot.will_wake(waker) {
            *slot = waker.clone();
        }
    }
}

impl Drop for TimerRegistration {
    fn drop(&mut self) {
        self.entry.cancelled.store(true, Ordering::Relaxed);
    }
}

struct HeapItem(Arc<Entry>);

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.0.when == other.0.when
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.when.cmp(&other.0.when)
    }
}

struct TimerDriver {
    state: Mutex<BinaryHeap<Reverse<HeapItem>>>,
    condvar: Condvar,
}

impl TimerDriver {
    fn start() -> Self {
        let driver = TimerDriver { state: Mutex::new(BinaryHeap::new()), condvar: Condvar::new() };
        std::thread::Builder::new()
            .name("filament-timer".into())
            .spawn(|| driver_loop())
            .expect("failed to spawn the timer driver thread");
        driver
    }

    fn push(&self, entry: Arc<Entry>) {
        let mut heap = self.state.lock().unwrap();
        heap.push(Reverse(HeapItem(entry)));
        // The new entry may be earlier than what the driver is sleeping on
        self.condvar.notify_one();
    }
}

fn driver_loop() {
    let driver = driver();
    let mut due: Vec<Arc<Entry>> = Vec::new();

    loop {
        {
            let mut heap = driver.state.lock().unwrap();
            loop {
                let now = Instant::now();
                match heap.peek() {
                    Some(Reverse(item)) if item.0.when <= now => {
                        let Reverse(item) = heap.pop().unwrap();
                        due.push(item.0);
                    }
                    Some(Reverse(item)) => {
                        let timeout = item.0.when - now;
                        if !due.is_empty() {
                            break;
                        }
                        let (guard, _) = driver.condvar.wait_timeout(heap, timeout).unwrap();
                        heap = guard;
                    }
                    None => {
                        if !due.is_empty() {
                            break;
                        }
                        heap = driver.condvar.wait(heap).unwrap();
                    }
                }
            }
        }

        // Wake outside the lock: a waker may run arbitrary executor code
        for entry in due.drain(..) {
            if !entry.cancelled.load(Ordering::Relaxed) {
                entry.waker.lock().unwrap().wake_by_ref();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;
    use std::time::Duration;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn wakes_after_expiry() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());

        let _reg = TimerRegistration::new(Instant::now() + Duration::from_millis(10), &waker);

        let start = Instant::now();
        while counter.0.load(Ordering::SeqCst) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "timer never fired");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn dropped_registration_does_not_wake() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());

        let reg = TimerRegistration::new(Instant::now() + Duration::from_millis(20), &waker);
        drop(reg);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn earlier_entry_preempts_later_sleep() {
        let late = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let early = Arc::new(CountingWaker(AtomicUsize::new(0)));

        let _late_reg =
            TimerRegistration::new(Instant::now() + Duration::from_secs(60), &Waker::from(late.clone()));
        let _early_reg =
            TimerRegistration::new(Instant::now() + Duration::from_millis(10), &Waker::from(early.clone()));

        let start = Instant::now();
        while early.0.load(Ordering::SeqCst) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "early timer stuck behind late one");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(late.0.load(Ordering::SeqCst), 0);
    }
}
