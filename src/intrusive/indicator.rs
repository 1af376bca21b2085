//! Striped read indicator.
//!
//! A sharded reader counter that lets a rare writer prove the absence of
//! live readers. Readers increment one of a small set of cache-padded
//! stripes chosen by a thread-local hash, so concurrent readers rarely
//! touch the same line; the writer sums every stripe.
//!
//! The hazard-pointer literature pairs the reader's entry with an
//! asymmetric *light* fence and the writer's scan with an asymmetric
//! *heavy* fence. Portable Rust has no asymmetric fence, so both sides
//! issue `fence(SeqCst)` — same ordering, higher reader cost, identical
//! correctness.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use crossbeam_utils::CachePadded;

const STRIPE_COUNT: usize = 8;

static NEXT_THREAD_SEED: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // Each thread starts on its own stripe and rotates once per lock, so a
    // thread locking many indicators does not always hammer one stripe.
    static STRIPE_SEED: Cell<usize> =
        Cell::new(NEXT_THREAD_SEED.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9E37_79B9));
}

fn pick_stripe() -> usize {
    STRIPE_SEED.with(|seed| {
        let s = seed.get();
        seed.set(s.wrapping_add(1));
        s % STRIPE_COUNT
    })
}

/// Proof that one reader is inside a critical section. Must be returned to
/// the same indicator via [`StripedReadIndicator::unlock`]; travels freely
/// across threads with a moved reader handle.
#[derive(Debug)]
pub(crate) struct ReadIndicatorLock {
    stripe: usize,
}

/// Sharded reader-presence counter.
pub(crate) struct StripedReadIndicator {
    stripes: [CachePadded<AtomicUsize>; STRIPE_COUNT],
}

impl Default for StripedReadIndicator {
    fn default() -> Self {
        StripedReadIndicator {
            stripes: std::array::from_fn(|_| CachePadded::new(AtomicUsize::new(0))),
        }
    }
}

impl StripedReadIndicator {
    /// Marks a reader as inside the critical section.
    pub(crate) fn lock(&self) -> ReadIndicatorLock {
        let stripe = pick_stripe();
        self.stripes[stripe].fetch_add(1, Ordering::Relaxed);
        // Heavy stand-in for the asymmetric light fence: orders the
        // increment before the reader's subsequent pointer re-check, and
        // pairs with the fence in `is_free`
        fence(Ordering::SeqCst);
        ReadIndicatorLock { stripe }
    }

    /// Releases a reader previously admitted by [`Self::lock`].
    pub(crate) fn unlock(&self, lock: ReadIndicatorLock) {
        self.stripes[lock.stripe].fetch_sub(1, Ordering::Release);
    }

    /// True iff no reader holds an unmatched lock that the calling writer's
    /// fence could have missed. A `true` result proves the guarded object
    /// can be reclaimed; `false` may be transient.
    pub(crate) fn is_free(&self) -> bool {
        // Pairs with the fence in `lock`: after this, any reader that got
        // its increment in before our fence is visible below
        fence(Ordering::SeqCst);
        self.stripes.iter().all(|stripe| stripe.load(Ordering::Acquire) == 0)
    }
}

impl std::fmt::Debug for StripedReadIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedReadIndicator").field("free", &self.is_free()).finish()
    }
}
