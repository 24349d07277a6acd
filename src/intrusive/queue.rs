//! Lock-free multi-producer, single-consumer intrusive queue.

#![allow(unsafe_code)]

use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::list::{IntrusiveList, ListNode};

/// A lock-free MPSC queue with an inactive-consumer sentinel.
///
/// Producers [`enqueue`](Self::enqueue) from any thread; a single consumer
/// drains with [`dequeue_all`](Self::dequeue_all). The queue's head slot
/// encodes one extra state beyond "empty" and "non-empty": *inactive*,
/// meaning the consumer has gone to sleep. `enqueue` reports whether it found
/// the queue inactive, which tells exactly one producer that it is
/// responsible for waking the consumer, and
/// [`try_mark_inactive_or_dequeue_all`](Self::try_mark_inactive_or_dequeue_all)
/// lets the consumer go to sleep without racing a concurrent producer.
///
/// Internally producers prepend, so the stored chain is newest-first; the
/// consumer reverses it back into arrival order while draining.
#[derive(Debug)]
pub struct AtomicIntrusiveQueue<T> {
    head: AtomicPtr<ListNode<T>>,
}

// Safety: the queue itself holds no T, only pointers to nodes owned by the
// producers; moving those pointers across threads requires T: Send.
unsafe impl<T: Send> Send for AtomicIntrusiveQueue<T> {}
unsafe impl<T: Send> Sync for AtomicIntrusiveQueue<T> {}

impl<T> AtomicIntrusiveQueue<T> {
    /// The sentinel stored while the consumer is marked inactive. Never a
    /// valid node address: nodes are aligned, so address 1 cannot alias one.
    fn inactive() -> *mut ListNode<T> {
        1 as *mut ListNode<T>
    }

    /// Creates an empty queue, optionally with the consumer already marked
    /// inactive.
    #[must_use]
    pub fn new(initially_inactive: bool) -> Self {
        let head = if initially_inactive {
            Self::inactive()
        } else {
            ptr::null_mut()
        };
        Self {
            head: AtomicPtr::new(head),
        }
    }

    /// Atomically prepends `node`.
    ///
    /// Returns `true` if the consumer was marked inactive at the time: the
    /// queue is now active again and the calling producer must wake the
    /// consumer.
    ///
    /// # Safety
    ///
    /// `node` must not currently be linked anywhere and must stay alive and
    /// pinned until the consumer drains it.
    pub unsafe fn enqueue(&self, mut node: NonNull<ListNode<T>>) -> bool {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let was_inactive = head == Self::inactive();
            node.as_mut().set_next_raw(if was_inactive {
                ptr::null_mut()
            } else {
                head
            });
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return was_inactive,
                Err(current) => head = current,
            }
        }
    }

    /// Atomically claims every queued node, returning them in arrival order.
    ///
    /// Must not be called while the queue is marked inactive; the consumer is
    /// the only party allowed to flip between active and inactive, so this is
    /// a local usage contract.
    #[must_use]
    pub fn dequeue_all(&self) -> IntrusiveList<T> {
        let chain = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        debug_assert!(
            chain != Self::inactive(),
            "dequeue_all called while the consumer is marked inactive"
        );
        Self::reverse_into_list(chain)
    }

    /// Atomically either marks the queue inactive (when empty, returning
    /// `None`) or claims every queued node (returning them in arrival order).
    ///
    /// This gives the consumer a race-free way to go to sleep: if a producer
    /// slips an item in between the emptiness check and the mark, the CAS
    /// fails and the items are drained instead.
    #[must_use]
    pub fn try_mark_inactive_or_dequeue_all(&self) -> Option<IntrusiveList<T>> {
        let head = self.head.load(Ordering::Relaxed);
        debug_assert!(
            head != Self::inactive(),
            "consumer is already marked inactive"
        );
        if head.is_null()
            && self
                .head
                .compare_exchange(
                    ptr::null_mut(),
                    Self::inactive(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            return None;
        }
        let chain = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        Some(Self::reverse_into_list(chain))
    }

    /// Walks a newest-first chain, rebuilding it as a doubly linked list in
    /// arrival order.
    fn reverse_into_list(mut chain: *mut ListNode<T>) -> IntrusiveList<T> {
        let mut list = IntrusiveList::new();
        while let Some(node) = NonNull::new(chain) {
            // Safety: the chain was built from pinned, live nodes by enqueue.
            unsafe {
                chain = node.as_ref().next_raw();
                list.push_front(node);
            }
        }
        list
    }
}

impl<T> Drop for AtomicIntrusiveQueue<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        debug_assert!(
            head.is_null() || head == Self::inactive(),
            "atomic intrusive queue dropped with nodes still queued"
        );
    }
}
