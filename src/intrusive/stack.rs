//! Intrusive Treiber stack.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// A node that can be linked into an [`IntrusiveStack`].
pub(crate) trait FreeListNode {
    /// The embedded link. Owned by the stack while the node is linked.
    fn free_hook(&self) -> &AtomicPtr<Self>
    where
        Self: Sized;
}

/// Lock-free LIFO of intrusive nodes.
///
/// `push` is lock-free from any thread. `try_pop` is safe against ABA only
/// under a single concurrent popper; the RCU free list guarantees this by
/// popping exclusively under the writer mutex. Nodes are freed solely by
/// [`IntrusiveStack::dispose_unsafe`] in the owner's destructor, so a
/// popped node is never recycled into the stack by another thread mid-CAS.
pub(crate) struct IntrusiveStack<N: FreeListNode> {
    head: AtomicPtr<N>,
}

impl<N: FreeListNode> Default for IntrusiveStack<N> {
    fn default() -> Self {
        IntrusiveStack { head: AtomicPtr::new(ptr::null_mut()) }
    }
}

impl<N: FreeListNode> IntrusiveStack<N> {
    /// Links `node` as the new head.
    ///
    /// # Safety
    ///
    /// `node` must be live, not linked anywhere, and must stay live until
    /// popped or disposed.
    pub(crate) unsafe fn push(&self, node: NonNull<N>) {
        let node_ptr = node.as_ptr();
        let hook = unsafe { node.as_ref() }.free_hook();

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            hook.store(head, Ordering::Relaxed);
            // Release publishes the node's contents along with the link
            match self.head.compare_exchange_weak(head, node_ptr, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Unlinks and returns the head node, if any. Single-popper only.
    pub(crate) fn try_pop(&self) -> Option<NonNull<N>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let node = NonNull::new(head)?;
            let next = unsafe { node.as_ref() }.free_hook().load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire) {
                Ok(_) => return Some(node),
                Err(current) => head = current,
            }
        }
    }

    /// Drains the stack without synchronisation, handing each node to `f`.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive access (destructor-only).
    pub(crate) unsafe fn dispose_unsafe(&self, mut f: impl FnMut(NonNull<N>)) {
        let mut current = self.head.swap(ptr::null_mut(), Ordering::Relaxed);
        while let Some(node) = NonNull::new(current) {
            current = unsafe { node.as_ref() }.free_hook().load(Ordering::Relaxed);
            f(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestNode {
        value: u32,
        hook: AtomicPtr<TestNode>,
    }

    impl TestNode {
        fn boxed(value: u32) -> NonNull<TestNode> {
            let node = Box::new(TestNode { value, hook: AtomicPtr::new(ptr::null_mut()) });
            NonNull::from(Box::leak(node))
        }
    }

    impl FreeListNode for TestNode {
        fn free_hook(&self) -> &AtomicPtr<Self> {
            &self.hook
        }
    }

    fn reclaim(node: NonNull<TestNode>) -> u32 {
        let boxed = unsafe { Box::from_raw(node.as_ptr()) };
        boxed.value
    }

    #[test]
    fn lifo_order() {
        let stack = IntrusiveStack::<TestNode>::default();
        for v in 0..3 {
            unsafe { stack.push(TestNode::boxed(v)) };
        }

        assert_eq!(reclaim(stack.try_pop().unwrap()), 2);
        assert_eq!(reclaim(stack.try_pop().unwrap()), 1);
        assert_eq!(reclaim(stack.try_pop().unwrap()), 0);
        assert!(stack.try_pop().is_none());
    }

    #[test]
    fn dispose_visits_every_node() {
        let stack = IntrusiveStack::<TestNode>::default();
        for v in 0..10 {
            unsafe { stack.push(TestNode::boxed(v)) };
        }

        let mut seen = Vec::new();
        unsafe { stack.dispose_unsafe(|node| seen.push(reclaim(node))) };
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(stack.try_pop().is_none());
    }

    #[test]
    fn concurrent_pushers_single_popper() {
        let stack = std::sync::Arc::new(IntrusiveStack::<TestNode>::default());
        let mut handles = Vec::new();
        for t in 0..4 {
            let stack = stack.clone();
            handles.push(std::thread::spawn(move || {
                for v in 0..100 {
                    unsafe { stack.push(TestNode::boxed(t * 100 + v)) };
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = Vec::new();
        while let Some(node) = stack.try_pop() {
            seen.push(reclaim(node));
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..400).collect::<Vec<_>>());
    }
}
