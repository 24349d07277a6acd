//! Cancellation-aware async reader/writer lock.
//!
//! Any number of readers may hold the lock together; a writer holds it
//! alone. Waiters of both kinds share one FIFO queue, which gives writers a
//! progress guarantee: once a writer is queued, later readers queue behind
//! it instead of piling onto the shared side forever. When the lock frees
//! up, the queue is drained from the front, so a run of consecutive readers
//! is granted as one batch.
//!
//! # Cancellation
//!
//! [`RwLock::read`] and [`RwLock::write`] take a [`CancelToken`]; a pending
//! acquisition whose token fires resolves to `Err(Cancelled)` and leaves the
//! queue. Removing a queued writer re-runs the grant drain, so readers that
//! were stuck behind it start without waiting for the next unlock.

#![allow(unsafe_code)]

use parking_lot::Mutex as ParkingMutex;
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::future::Future;
use std::marker::PhantomPinned;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll, Waker};

use super::waiter::{
    WaiterNode, OUTCOME_CANCELLED, OUTCOME_GRANTED, PHASE_ACQUIRED_NOT_ENQUEUED, PHASE_CANCELLED,
    PHASE_ENQUEUED, PHASE_NOT_ENQUEUED,
};
use crate::cancel::{CancelSubscription, CancelToken};
use crate::error::Cancelled;
use crate::intrusive::{IntrusiveList, ListNode};

/// Wakers collected under the internal mutex, woken after it is released.
type WakeBatch = SmallVec<[Waker; 4]>;

/// An async reader/writer lock.
#[derive(Debug)]
pub struct RwLock<T> {
    inner: RwInner,
    /// The protected data.
    data: UnsafeCell<T>,
}

// Safety: exclusive access is serialized by the lock protocol; shared
// access hands out &T, hence the Sync bound on Sync.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

/// The non-generic lock machinery, shared with the cancellation callback.
#[derive(Debug)]
struct RwInner {
    state: ParkingMutex<RwState>,
}

#[derive(Debug)]
struct RwState {
    /// Whether a writer currently holds the lock.
    exclusive: bool,
    /// Number of readers currently holding the lock.
    shared: usize,
    /// Pending acquisitions of both kinds, in arrival order.
    queue: IntrusiveList<WaiterNode>,
}

impl RwInner {
    const fn new() -> Self {
        Self {
            state: ParkingMutex::new(RwState {
                exclusive: false,
                shared: 0,
                queue: IntrusiveList::new(),
            }),
        }
    }

    fn unlock_shared(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.shared > 0);
        state.shared -= 1;
        let wakers = if state.shared == 0 && !state.exclusive {
            drain_locked(&mut state)
        } else {
            WakeBatch::new()
        };
        drop(state);
        for waker in wakers {
            waker.wake();
        }
    }

    fn unlock_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.exclusive);
        state.exclusive = false;
        let wakers = drain_locked(&mut state);
        drop(state);
        for waker in wakers {
            waker.wake();
        }
    }

    /// Cancellation path for one acquisition, driven by its subscription.
    fn cancel_waiter(&self, node_ptr: NonNull<ListNode<WaiterNode>>) {
        // Safety: the future deregisters its subscription before freeing the
        // node, and deregistration waits out an in-flight delivery.
        let node = unsafe { node_ptr.as_ref() };
        let prior = node.phase.swap(PHASE_CANCELLED, Ordering::AcqRel);
        match prior {
            // `poll` has not published yet; it will observe the swap and
            // clean up itself.
            PHASE_NOT_ENQUEUED => {}
            PHASE_ACQUIRED_NOT_ENQUEUED => {
                if node.try_claim(OUTCOME_CANCELLED) {
                    // The waiter was granted a slot it will never use.
                    if node.exclusive {
                        self.unlock_exclusive();
                    } else {
                        self.unlock_shared();
                    }
                    complete_claimed(node);
                }
            }
            PHASE_ENQUEUED => {
                if node.try_claim(OUTCOME_CANCELLED) {
                    let wakers = self.remove_and_drain(node_ptr);
                    for waker in wakers {
                        waker.wake();
                    }
                    complete_claimed(node);
                }
            }
            _ => debug_assert!(false, "cancellation delivered twice to one waiter"),
        }
    }

    /// Unlinks a claimed node if it is still queued and re-runs the grant
    /// drain: removing a queued writer can make the readers behind it
    /// eligible without any unlock happening.
    fn remove_and_drain(&self, node_ptr: NonNull<ListNode<WaiterNode>>) -> WakeBatch {
        let mut state = self.state.lock();
        // Safety: the caller owns the node's completion ticket.
        let node = unsafe { node_ptr.as_ref() };
        if node.queued.load(Ordering::Relaxed) {
            // Safety: `queued` means the node is linked into this list.
            unsafe { state.queue.remove(node_ptr) };
            node.queued.store(false, Ordering::Relaxed);
            drain_locked(&mut state)
        } else {
            WakeBatch::new()
        }
    }
}

/// Grants from the front of the queue while the grant rules allow it.
///
/// A run of consecutive readers is granted as one batch; a writer is granted
/// alone, and stops the drain. Nodes whose completion ticket was already
/// claimed by a cancellation are dropped from the queue in passing.
fn drain_locked(state: &mut RwState) -> WakeBatch {
    let mut wakers = WakeBatch::new();
    while let Some(front) = state.queue.front() {
        // Safety: queued nodes are kept alive by their futures until the
        // completion handshake.
        let wants_exclusive = unsafe { front.as_ref() }.exclusive;
        if state.exclusive || (wants_exclusive && state.shared > 0) {
            break;
        }
        let Some(node_ptr) = state.queue.pop_front() else {
            break;
        };
        let node = unsafe { node_ptr.as_ref() };
        node.queued.store(false, Ordering::Relaxed);
        if !node.try_claim(OUTCOME_GRANTED) {
            // Lost to a cancellation; skip it.
            continue;
        }
        if wants_exclusive {
            state.exclusive = true;
        } else {
            state.shared += 1;
        }
        if let Some(waker) = node.take_waker() {
            wakers.push(waker);
        }
        node.finish();
        if wants_exclusive {
            break;
        }
    }
    wakers
}

/// Finishes a node whose ticket the caller has already claimed.
fn complete_claimed(node: &WaiterNode) {
    let waker = node.take_waker();
    node.finish();
    if let Some(waker) = waker {
        waker.wake();
    }
}

impl<T> RwLock<T> {
    /// Creates a new lock in an unlocked state.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            inner: RwInner::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock for shared access.
    ///
    /// Grants immediately when no writer holds the lock and no waiter is
    /// queued; otherwise joins the queue, so readers arriving after a
    /// pending writer wait behind it.
    pub fn read<'a, 'b>(&'a self, token: &'b CancelToken) -> ReadFuture<'a, 'b, T> {
        ReadFuture {
            lock: self,
            acquire: Acquire::new(&self.inner, token, false),
        }
    }

    /// Acquires the lock for exclusive access.
    pub fn write<'a, 'b>(&'a self, token: &'b CancelToken) -> WriteFuture<'a, 'b, T> {
        WriteFuture {
            lock: self,
            acquire: Acquire::new(&self.inner, token, true),
        }
    }

    /// Attempts shared access without waiting.
    ///
    /// Fails while a writer holds the lock or any waiter is queued; a
    /// stream of `try_read` calls therefore cannot starve a pending writer.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let mut state = self.inner.state.lock();
        if state.exclusive || !state.queue.is_empty() {
            None
        } else {
            state.shared += 1;
            Some(RwLockReadGuard { lock: self })
        }
    }

    /// Attempts exclusive access without waiting.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let mut state = self.inner.state.lock();
        if state.exclusive || state.shared > 0 {
            None
        } else {
            state.exclusive = true;
            Some(RwLockWriteGuard { lock: self })
        }
    }

    /// Consumes the lock and returns the protected data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the protected data.
    ///
    /// The exclusive borrow proves no guard or waiter exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for shared access. Releases on drop; the last reader out runs
/// the grant drain.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: shared access is held; writers are excluded.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.inner.unlock_shared();
    }
}

/// RAII guard for exclusive access.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: exclusive access is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: exclusive access is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.inner.unlock_exclusive();
    }
}

/// The wait machinery shared by [`ReadFuture`] and [`WriteFuture`]. The
/// node's `exclusive` flag decides which grant rules apply.
struct Acquire<'a, 'b> {
    inner: &'a RwInner,
    token: &'b CancelToken,
    node: ListNode<WaiterNode>,
    subscription: Option<CancelSubscription>,
    started: bool,
    finished: bool,
    _pin: PhantomPinned,
}

/// Raw pointers handed to the cancellation callback. The future keeps both
/// referents alive until the subscription is deregistered.
struct CancelTarget {
    inner: NonNull<RwInner>,
    node: NonNull<ListNode<WaiterNode>>,
}

// Safety: the callback only touches the internal mutex, atomics, and the
// waker slot.
unsafe impl Send for CancelTarget {}

// Safety: the node is shared only through &WaiterNode under the protocols
// above.
unsafe impl Send for Acquire<'_, '_> {}

impl<'a, 'b> Acquire<'a, 'b> {
    fn new(inner: &'a RwInner, token: &'b CancelToken, exclusive: bool) -> Self {
        Self {
            inner,
            token,
            node: ListNode::new(WaiterNode::new(exclusive)),
            subscription: None,
            started: false,
            finished: false,
            _pin: PhantomPinned,
        }
    }

    /// Drives the acquisition. `Ready(Ok(()))` means the slot is held and
    /// the caller may construct its guard.
    ///
    /// The caller guarantees `self` is pinned and never moved afterwards.
    fn poll_acquire(&mut self, waker: &Waker) -> Poll<Result<(), Cancelled>> {
        assert!(!self.finished, "lock future polled after completion");
        if self.started {
            return self.poll_registered(waker);
        }
        self.started = true;
        self.node.set_waker(waker);

        // Subscribe before touching the lock: a stop that was already
        // requested runs the callback inline, which observes
        // PHASE_NOT_ENQUEUED and leaves the cleanup to us below.
        if self.token.stop_possible() {
            let target = CancelTarget {
                inner: NonNull::from(self.inner),
                node: NonNull::from(&self.node),
            };
            self.subscription = Some(CancelSubscription::new(self.token, move || {
                // Capture the struct, not its fields; closure capture of the
                // raw pointers alone would sidestep the Send impl.
                let target = target;
                // Safety: the future outlives the subscription.
                unsafe { target.inner.as_ref() }.cancel_waiter(target.node);
            }));
        }

        let wants_exclusive = self.node.exclusive;
        let acquired = {
            let mut state = self.inner.state.lock();
            let grantable = if wants_exclusive {
                !state.exclusive && state.shared == 0 && state.queue.is_empty()
            } else {
                !state.exclusive && state.queue.is_empty()
            };
            if grantable {
                if wants_exclusive {
                    state.exclusive = true;
                } else {
                    state.shared += 1;
                }
                true
            } else {
                // Safety: the node is pinned inside this future and stays
                // alive until unlinked.
                unsafe { state.queue.push_back(NonNull::from(&mut self.node)) };
                self.node.queued.store(true, Ordering::Relaxed);
                false
            }
        };

        let published = if acquired {
            PHASE_ACQUIRED_NOT_ENQUEUED
        } else {
            PHASE_ENQUEUED
        };
        let prev = self.node.phase.swap(published, Ordering::AcqRel);

        if prev == PHASE_CANCELLED {
            return self.cleanup_cancelled_start(acquired);
        }
        debug_assert_eq!(prev, PHASE_NOT_ENQUEUED);

        if acquired {
            // Race our grant against a cancellation arriving right now.
            if self.node.try_claim(OUTCOME_GRANTED) {
                self.node.finish();
                self.finished = true;
                Poll::Ready(Ok(()))
            } else {
                // The callback won; it released the slot on our behalf.
                self.node.wait_finished();
                self.finished = true;
                Poll::Ready(Err(Cancelled))
            }
        } else {
            Poll::Pending
        }
    }

    /// First-poll cleanup when the cancellation callback fired before the
    /// phase was published.
    fn cleanup_cancelled_start(&mut self, acquired: bool) -> Poll<Result<(), Cancelled>> {
        if acquired {
            // We took a slot but were cancelled first; give it back. The
            // callback saw PHASE_NOT_ENQUEUED and never claims in that case.
            let claimed = self.node.try_claim(OUTCOME_CANCELLED);
            debug_assert!(claimed);
            if self.node.exclusive {
                self.inner.unlock_exclusive();
            } else {
                self.inner.unlock_shared();
            }
            self.node.finish();
            self.finished = true;
            return Poll::Ready(Err(Cancelled));
        }
        let wakers = self.inner.remove_and_drain(NonNull::from(&self.node));
        for waker in wakers {
            waker.wake();
        }
        if self.node.try_claim(OUTCOME_CANCELLED) {
            self.node.finish();
            self.finished = true;
            Poll::Ready(Err(Cancelled))
        } else {
            // A drain dequeued and granted us before the cancellation
            // published; the grant stands.
            debug_assert_eq!(self.node.outcome(), OUTCOME_GRANTED);
            self.node.wait_finished();
            self.finished = true;
            Poll::Ready(Ok(()))
        }
    }

    fn poll_registered(&mut self, waker: &Waker) -> Poll<Result<(), Cancelled>> {
        let outcome = match self.node.outcome() {
            o @ (OUTCOME_GRANTED | OUTCOME_CANCELLED) => o,
            _ => {
                self.node.set_waker(waker);
                // Re-check: the completer may have taken the old waker just
                // before we stored the new one.
                match self.node.outcome() {
                    o @ (OUTCOME_GRANTED | OUTCOME_CANCELLED) => o,
                    _ => return Poll::Pending,
                }
            }
        };
        // The claim publishes before the handshake flag; wait until the
        // completer is done with the node.
        self.node.wait_finished();
        self.finished = true;
        if outcome == OUTCOME_GRANTED {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(Cancelled))
        }
    }
}

impl Drop for Acquire<'_, '_> {
    fn drop(&mut self) {
        if !self.started || self.finished {
            return;
        }
        // Deregistering first blocks out the cancellation callback; after
        // this, the only other party that can touch the node is a drain.
        self.subscription = None;
        if self.node.queued.load(Ordering::Relaxed) {
            let wakers = self.inner.remove_and_drain(NonNull::from(&self.node));
            for waker in wakers {
                waker.wake();
            }
            if self.node.try_claim(OUTCOME_CANCELLED) {
                self.node.finish();
                return;
            }
        }
        // Someone completed the node; wait them out, and if a slot was
        // handed to us, pass it on instead of leaking it.
        self.node.wait_finished();
        if self.node.outcome() == OUTCOME_GRANTED {
            if self.node.exclusive {
                self.inner.unlock_exclusive();
            } else {
                self.inner.unlock_shared();
            }
        }
    }
}

/// Future returned by [`RwLock::read`].
#[must_use = "futures do nothing unless polled"]
pub struct ReadFuture<'a, 'b, T> {
    lock: &'a RwLock<T>,
    acquire: Acquire<'a, 'b>,
}

impl<'a, T> Future for ReadFuture<'a, '_, T> {
    type Output = Result<RwLockReadGuard<'a, T>, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: we never move out of `this`; the node stays pinned.
        let this = unsafe { self.get_unchecked_mut() };
        this.acquire
            .poll_acquire(cx.waker())
            .map_ok(|()| RwLockReadGuard { lock: this.lock })
    }
}

/// Future returned by [`RwLock::write`].
#[must_use = "futures do nothing unless polled"]
pub struct WriteFuture<'a, 'b, T> {
    lock: &'a RwLock<T>,
    acquire: Acquire<'a, 'b>,
}

impl<'a, T> Future for WriteFuture<'a, '_, T> {
    type Output = Result<RwLockWriteGuard<'a, T>, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: we never move out of `this`; the node stays pinned.
        let this = unsafe { self.get_unchecked_mut() };
        this.acquire
            .poll_acquire(cx.waker())
            .map_ok(|()| RwLockWriteGuard { lock: this.lock })
    }
}
