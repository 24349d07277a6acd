//! Cancellation-aware async mutex with FIFO handoff.
//!
//! An async mutex whose guard may be held across await points. Waiters queue
//! in arrival order in an intrusive list (no allocation per wait), and
//! `unlock` hands the lock directly to the oldest live waiter instead of
//! releasing it for a free-for-all.
//!
//! # Cancellation
//!
//! [`Mutex::lock`] takes a [`CancelToken`]. A pending acquisition whose token
//! fires resolves to `Err(Cancelled)` and leaves the queue; a grant that
//! races the cancellation is resolved by a run-once completion ticket, so the
//! lock is never both handed out and abandoned.
//!
//! # Example
//!
//! ```ignore
//! use cancelsync::{CancelToken, Mutex};
//!
//! let mutex = Mutex::new(42);
//! let mut guard = mutex.lock(&CancelToken::never()).await?;
//! *guard += 1;
//! ```

#![allow(unsafe_code)]

use parking_lot::Mutex as ParkingMutex;
use std::cell::UnsafeCell;
use std::future::Future;
use std::marker::PhantomPinned;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

use super::waiter::{
    WaiterNode, OUTCOME_CANCELLED, OUTCOME_GRANTED, PHASE_ACQUIRED_NOT_ENQUEUED, PHASE_CANCELLED,
    PHASE_ENQUEUED, PHASE_NOT_ENQUEUED,
};
use crate::cancel::{CancelSubscription, CancelToken};
use crate::error::Cancelled;
use crate::intrusive::{IntrusiveList, ListNode};

/// An async mutex for mutual exclusion.
#[derive(Debug)]
pub struct Mutex<T> {
    inner: MutexInner,
    /// The protected data.
    data: UnsafeCell<T>,
}

// Safety: Mutex is Send/Sync if T is Send; access to `data` is serialized
// by the lock protocol.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

/// The non-generic lock machinery, shared with the cancellation callback.
#[derive(Debug)]
struct MutexInner {
    /// Whether the mutex is currently held. `try_lock` and the uncontended
    /// acquire path race on this word alone.
    locked: AtomicBool,
    state: ParkingMutex<MutexState>,
}

#[derive(Debug)]
struct MutexState {
    /// Pending acquisitions in arrival order. Nodes are owned by their
    /// futures; the `queued` flag on each node is only written while this
    /// mutex is held.
    waiters: IntrusiveList<WaiterNode>,
}

impl MutexInner {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            state: ParkingMutex::new(MutexState {
                waiters: IntrusiveList::new(),
            }),
        }
    }

    /// Releases the lock, handing it to the oldest live waiter if any.
    fn unlock(&self) {
        let mut state = self.state.lock();
        loop {
            let Some(node_ptr) = state.waiters.pop_front() else {
                // Nobody waiting. The flag is only cleared here, under the
                // internal mutex, so an acquire that enqueues under the same
                // mutex can never miss the release.
                self.locked.store(false, Ordering::Release);
                return;
            };
            // Safety: queued nodes are kept alive by their futures until the
            // completion handshake below.
            let node = unsafe { node_ptr.as_ref() };
            node.queued.store(false, Ordering::Relaxed);
            if node.try_claim(OUTCOME_GRANTED) {
                // Ownership passes directly to this waiter; `locked` stays
                // set across the handoff.
                let waker = node.take_waker();
                node.finish();
                drop(state);
                if let Some(waker) = waker {
                    waker.wake();
                }
                return;
            }
            // Claim lost to a cancellation; try the next waiter.
        }
    }

    /// Cancellation path for one acquisition, driven by its subscription.
    ///
    /// The phase word tells us how far `poll` got before the cancellation
    /// fired; whichever side observes the other's transition cleans up.
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
                    // The waiter acquired the lock but loses it to the
                    // cancellation; pass it on before completing.
                    self.unlock();
                    complete_claimed(node);
                }
            }
            PHASE_ENQUEUED => {
                if node.try_claim(OUTCOME_CANCELLED) {
                    {
                        let mut state = self.state.lock();
                        if node.queued.load(Ordering::Relaxed) {
                            // Safety: `queued` means the node is linked into
                            // this list.
                            unsafe { state.waiters.remove(node_ptr) };
                            node.queued.store(false, Ordering::Relaxed);
                        }
                    }
                    complete_claimed(node);
                }
            }
            _ => debug_assert!(false, "cancellation delivered twice to one waiter"),
        }
    }
}

/// Finishes a node whose ticket the caller has already claimed.
fn complete_claimed(node: &WaiterNode) {
    let waker = node.take_waker();
    node.finish();
    if let Some(waker) = waker {
        waker.wake();
    }
}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            inner: MutexInner::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the mutex, waiting in FIFO order.
    ///
    /// Resolves to a guard once the lock is held, or to `Err(Cancelled)` if
    /// stop is requested on `token`'s source first. Dropping the future
    /// before completion withdraws the waiter; if a grant raced the drop,
    /// the lock is released again rather than leaked.
    pub fn lock<'a, 'b>(&'a self, token: &'b CancelToken) -> LockFuture<'a, 'b, T> {
        LockFuture {
            mutex: self,
            token,
            node: ListNode::new(WaiterNode::new(true)),
            subscription: None,
            started: false,
            finished: false,
            _pin: PhantomPinned,
        }
    }

    /// Attempts to acquire the mutex without waiting.
    ///
    /// This barges: it may succeed ahead of queued waiters.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.inner.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(MutexGuard { mutex: self })
        }
    }

    /// Returns whether the mutex is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::Acquire)
    }

    /// Consumes the mutex and returns the protected data.
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

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for [`Mutex`]. Releases the lock on drop, waking the next
/// waiter in FIFO order.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

// Safety: holding the guard is exclusive access to T, so moving or sharing
// the guard is moving or sharing that access.
unsafe impl<T: Send> Send for MutexGuard<'_, T> {}
unsafe impl<T: Send + Sync> Sync for MutexGuard<'_, T> {}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves the lock is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves the lock is held.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.inner.unlock();
    }
}

/// Future returned by [`Mutex::lock`].
#[must_use = "futures do nothing unless polled"]
pub struct LockFuture<'a, 'b, T> {
    mutex: &'a Mutex<T>,
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
    inner: NonNull<MutexInner>,
    node: NonNull<ListNode<WaiterNode>>,
}

// Safety: the callback only touches atomics, the internal mutex, and the
// waker slot.
unsafe impl Send for CancelTarget {}

// Safety: the raw-pointer-free state is Sync; the node is shared only
// through &WaiterNode under the protocols above.
unsafe impl<T: Send> Send for LockFuture<'_, '_, T> {}

impl<'a, T> Future for LockFuture<'a, '_, T> {
    type Output = Result<MutexGuard<'a, T>, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: we never move out of `this`; the node stays pinned.
        let this = unsafe { self.get_unchecked_mut() };
        assert!(!this.finished, "LockFuture polled after completion");

        if this.started {
            return this.poll_registered(cx.waker());
        }
        this.started = true;
        this.node.set_waker(cx.waker());

        // Subscribe before touching the lock: a stop that was already
        // requested runs the callback inline, which observes
        // PHASE_NOT_ENQUEUED and leaves the cleanup to us below.
        if this.token.stop_possible() {
            let target = CancelTarget {
                inner: NonNull::from(&this.mutex.inner),
                node: NonNull::from(&this.node),
            };
            this.subscription = Some(CancelSubscription::new(this.token, move || {
                // Capture the struct, not its fields; closure capture of the
                // raw pointers alone would sidestep the Send impl.
                let target = target;
                // Safety: the future outlives the subscription.
                unsafe { target.inner.as_ref() }.cancel_waiter(target.node);
            }));
        }

        let inner = &this.mutex.inner;
        let acquired = {
            let mut state = inner.state.lock();
            if inner.locked.swap(true, Ordering::Acquire) {
                // Held; join the queue.
                // Safety: the node is pinned inside this future and stays
                // alive until unlinked.
                unsafe { state.waiters.push_back(NonNull::from(&mut this.node)) };
                this.node.queued.store(true, Ordering::Relaxed);
                false
            } else {
                true
            }
        };

        let published = if acquired {
            PHASE_ACQUIRED_NOT_ENQUEUED
        } else {
            PHASE_ENQUEUED
        };
        let prev = this.node.phase.swap(published, Ordering::AcqRel);

        if prev == PHASE_CANCELLED {
            // The callback fired while we were still unpublished and left
            // the cleanup to us.
            return this.cleanup_cancelled_start(acquired);
        }
        debug_assert_eq!(prev, PHASE_NOT_ENQUEUED);

        if acquired {
            // Race our grant against a cancellation arriving right now.
            if this.node.try_claim(OUTCOME_GRANTED) {
                this.node.finish();
                this.finished = true;
                Poll::Ready(Ok(MutexGuard { mutex: this.mutex }))
            } else {
                // The callback won; it released the lock on our behalf.
                this.node.wait_finished();
                this.finished = true;
                Poll::Ready(Err(Cancelled))
            }
        } else {
            Poll::Pending
        }
    }
}

impl<'a, T> LockFuture<'a, '_, T> {
    /// First-poll cleanup when the cancellation callback fired before the
    /// phase was published.
    fn cleanup_cancelled_start(
        &mut self,
        acquired: bool,
    ) -> Poll<Result<MutexGuard<'a, T>, Cancelled>> {
        let inner = &self.mutex.inner;
        if acquired {
            // We took the lock but were cancelled first; give it back. The
            // callback saw PHASE_NOT_ENQUEUED and never claims in that case.
            let claimed = self.node.try_claim(OUTCOME_CANCELLED);
            debug_assert!(claimed);
            inner.unlock();
            self.node.finish();
            self.finished = true;
            return Poll::Ready(Err(Cancelled));
        }
        {
            let mut state = inner.state.lock();
            if self.node.queued.load(Ordering::Relaxed) {
                // Safety: `queued` means the node is linked into this list.
                unsafe { state.waiters.remove(NonNull::from(&mut self.node)) };
                self.node.queued.store(false, Ordering::Relaxed);
            }
        }
        if self.node.try_claim(OUTCOME_CANCELLED) {
            self.node.finish();
            self.finished = true;
            Poll::Ready(Err(Cancelled))
        } else {
            // An unlock dequeued and granted us before the cancellation
            // published; the grant stands.
            debug_assert_eq!(self.node.outcome(), OUTCOME_GRANTED);
            self.node.wait_finished();
            self.finished = true;
            Poll::Ready(Ok(MutexGuard { mutex: self.mutex }))
        }
    }

    fn poll_registered(&mut self, waker: &Waker) -> Poll<Result<MutexGuard<'a, T>, Cancelled>> {
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
            Poll::Ready(Ok(MutexGuard { mutex: self.mutex }))
        } else {
            Poll::Ready(Err(Cancelled))
        }
    }
}

impl<T> Drop for LockFuture<'_, '_, T> {
    fn drop(&mut self) {
        if !self.started || self.finished {
            return;
        }
        // Deregistering first blocks out the cancellation callback; after
        // this, the only other party that can touch the node is an unlock.
        self.subscription = None;
        let inner = &self.mutex.inner;
        let removed = {
            let mut state = inner.state.lock();
            if self.node.queued.load(Ordering::Relaxed) {
                // Safety: `queued` means the node is linked into this list.
                unsafe { state.waiters.remove(NonNull::from(&mut self.node)) };
                self.node.queued.store(false, Ordering::Relaxed);
                true
            } else {
                false
            }
        };
        if removed {
            // Withdrawn before anyone claimed it.
            let claimed = self.node.try_claim(OUTCOME_CANCELLED);
            debug_assert!(claimed);
            self.node.finish();
            return;
        }
        // Someone completed the node; wait them out, and if the lock was
        // handed to us, pass it on instead of leaking it.
        self.node.wait_finished();
        if self.node.outcome() == OUTCOME_GRANTED {
            inner.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use crate::test_logging::init_test_logging;
    use std::sync::Arc;
    use std::thread;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn poll_once<T>(future: &mut (impl Future<Output = T> + Send)) -> Option<T> {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        // Safety: the future is not moved after this call.
        match unsafe { Pin::new_unchecked(future) }.poll(&mut cx) {
            Poll::Ready(v) => Some(v),
            Poll::Pending => None,
        }
    }

    #[test]
    fn uncontended_lock_grants_immediately() {
        init_test("uncontended_lock_grants_immediately");
        let mutex = Mutex::new(5u32);
        let token = CancelToken::never();

        let mut fut = mutex.lock(&token);
        let mut guard = poll_once(&mut fut).expect("immediate grant").expect("not cancelled");
        *guard += 1;
        drop(guard);
        drop(fut);

        let value = *mutex.try_lock().expect("free again");
        crate::assert_with_log!(value == 6, "mutated under guard", 6u32, value);
        crate::test_complete!("uncontended_lock_grants_immediately");
    }

    #[test]
    fn try_lock_respects_holder() {
        init_test("try_lock_respects_holder");
        let mutex = Mutex::new(());
        let guard = mutex.try_lock().expect("first try_lock");
        let blocked = mutex.try_lock().is_none();
        crate::assert_with_log!(blocked, "second try_lock blocked", true, blocked);
        drop(guard);
        let free = mutex.try_lock().is_some();
        crate::assert_with_log!(free, "free after drop", true, free);
        crate::test_complete!("try_lock_respects_holder");
    }

    #[test]
    fn waiters_are_granted_in_fifo_order() {
        init_test("waiters_are_granted_in_fifo_order");
        let mutex = Mutex::new(());
        let token = CancelToken::never();

        let holder = mutex.try_lock().expect("holder");
        let mut first = mutex.lock(&token);
        let mut second = mutex.lock(&token);
        let p1 = poll_once(&mut first).is_none();
        let p2 = poll_once(&mut second).is_none();
        crate::assert_with_log!(p1 && p2, "both pending", true, p1 && p2);

        drop(holder);
        let second_still_pending = poll_once(&mut second).is_none();
        crate::assert_with_log!(
            second_still_pending,
            "second waits for first",
            true,
            second_still_pending
        );
        let first_guard = poll_once(&mut first).expect("first granted").expect("ok");

        drop(first_guard);
        let granted = poll_once(&mut second).expect("second granted").is_ok();
        crate::assert_with_log!(granted, "second granted after first", true, granted);
        crate::test_complete!("waiters_are_granted_in_fifo_order");
    }

    #[test]
    fn cancellation_removes_pending_waiter() {
        init_test("cancellation_removes_pending_waiter");
        let mutex = Mutex::new(());
        let source = CancelSource::new();
        let token = source.token();

        let holder = mutex.try_lock().expect("holder");
        let mut fut = mutex.lock(&token);
        let pending = poll_once(&mut fut).is_none();
        crate::assert_with_log!(pending, "waiter pending", true, pending);

        source.request_stop();
        let result = poll_once(&mut fut).expect("resolved");
        crate::assert_with_log!(
            result.is_err(),
            "waiter cancelled",
            true,
            result.is_err()
        );

        // The holder still owns the lock and releases it normally.
        drop(holder);
        let free = mutex.try_lock().is_some();
        crate::assert_with_log!(free, "lock released cleanly", true, free);
        crate::test_complete!("cancellation_removes_pending_waiter");
    }

    #[test]
    fn cancelled_waiter_does_not_block_successors() {
        init_test("cancelled_waiter_does_not_block_successors");
        let mutex = Mutex::new(());
        let source = CancelSource::new();
        let never = CancelToken::never();
        let doomed_token = source.token();

        let holder = mutex.try_lock().expect("holder");
        let mut doomed = mutex.lock(&doomed_token);
        let mut patient = mutex.lock(&never);
        let _ = poll_once(&mut doomed);
        let _ = poll_once(&mut patient);

        source.request_stop();
        drop(holder);
        let granted = poll_once(&mut patient).expect("resolved").is_ok();
        crate::assert_with_log!(granted, "successor granted", true, granted);
        let cancelled = poll_once(&mut doomed).expect("resolved").is_err();
        crate::assert_with_log!(cancelled, "doomed cancelled", true, cancelled);
        crate::test_complete!("cancelled_waiter_does_not_block_successors");
    }

    #[test]
    fn lock_after_stop_requested_fails_fast() {
        init_test("lock_after_stop_requested_fails_fast");
        let mutex = Mutex::new(());
        let source = CancelSource::new();
        let token = source.token();
        source.request_stop();

        let mut fut = mutex.lock(&token);
        let result = poll_once(&mut fut).expect("resolved on first poll");
        crate::assert_with_log!(result.is_err(), "cancelled", true, result.is_err());

        // The inline cancellation must not leak the briefly-taken lock.
        let free = mutex.try_lock().is_some();
        crate::assert_with_log!(free, "lock not leaked", true, free);
        crate::test_complete!("lock_after_stop_requested_fails_fast");
    }

    #[test]
    fn abandoned_waiter_leaves_queue_clean() {
        init_test("abandoned_waiter_leaves_queue_clean");
        let mutex = Mutex::new(());
        let token = CancelToken::never();

        let holder = mutex.try_lock().expect("holder");
        {
            let mut fut = mutex.lock(&token);
            let _ = poll_once(&mut fut);
            // Dropped while queued.
        }
        let mut successor = mutex.lock(&token);
        let _ = poll_once(&mut successor);
        drop(holder);
        let granted = poll_once(&mut successor).expect("resolved").is_ok();
        crate::assert_with_log!(granted, "successor granted", true, granted);
        crate::test_complete!("abandoned_waiter_leaves_queue_clean");
    }

    #[test]
    fn contended_increments_stay_exclusive() {
        init_test("contended_increments_stay_exclusive");
        let mutex = Arc::new(Mutex::new(0u64));
        let threads: u32 = 4;
        let per_thread: u64 = 100;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    let token = CancelToken::never();
                    for _ in 0..per_thread {
                        let mut fut = mutex.lock(&token);
                        let mut guard = loop {
                            match poll_once(&mut fut) {
                                Some(result) => break result.expect("never cancelled"),
                                None => thread::yield_now(),
                            }
                        };
                        *guard += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        let total = *mutex.try_lock().expect("free");
        let expected = u64::from(threads) * per_thread;
        crate::assert_with_log!(total == expected, "all increments kept", expected, total);
        crate::test_complete!("contended_increments_stay_exclusive");
    }
}
