//! Single-waiter cancellable signal.
//!
//! [`Signal`] is the minimal cancellation-aware event: one producer, at most
//! one registered waiter, and (optionally) one cancellation subscriber, all
//! racing to a single exactly-once completion encoded in one machine word.
//! It is the pattern the queue-based locks generalize; callers needing more
//! than one outstanding waiter should use [`Mutex`](super::Mutex) or
//! [`RwLock`](super::RwLock) instead.
//!
//! # States
//!
//! The word holds one of: *unset* (0), *signalled* (1), *cancelled* (2), or
//! the address of the registered waiter. Waiter nodes are word-aligned, so
//! the small sentinels can never alias one. Every transition is a single
//! compare-and-swap, which is what resolves the three-way race between
//! `set()`, waiter registration, and cancellation without blocking.

#![allow(unsafe_code)]

use std::future::Future;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};

use super::waiter::{WaiterNode, OUTCOME_CANCELLED, OUTCOME_GRANTED};
use crate::cancel::{CancelSubscription, CancelToken};
use crate::error::Cancelled;

const UNSET: usize = 0;
const SIGNALLED: usize = 1;
const CANCELLED: usize = 2;

/// A single-waiter cancellable signal.
///
/// `set()` is idempotent and may be called with no waiter present; a waiter
/// registering after `set()` completes immediately. At most one waiter may
/// be registered between [`reset`](Self::reset)s; a second concurrent waiter
/// is a contract violation and panics.
#[derive(Debug)]
pub struct Signal {
    state: AtomicUsize,
}

impl Signal {
    /// Creates a signal in the unset state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(UNSET),
        }
    }

    /// Returns whether the signal is currently set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == SIGNALLED
    }

    /// Sets the signal.
    ///
    /// If a waiter is registered it is completed (with success) immediately,
    /// on the calling thread. Otherwise this is a no-op: calling `set()` on
    /// an already-signalled (or unset, or cancelled) signal does nothing.
    pub fn set(&self) {
        let prev = self.state.swap(SIGNALLED, Ordering::AcqRel);
        match prev {
            UNSET | SIGNALLED | CANCELLED => {}
            addr => {
                // Safety: a non-sentinel value is the address of a live
                // waiter node; its owner waits for the completion handshake
                // before freeing it.
                let node = unsafe { &*(addr as *const WaiterNode) };
                complete(node, OUTCOME_GRANTED);
            }
        }
    }

    /// Returns a signalled or cancelled signal to the unset state so a new
    /// waiter can be registered. A no-op when already unset.
    ///
    /// Calling this while a waiter is registered is a contract violation.
    pub fn reset(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match current {
                UNSET => return,
                SIGNALLED | CANCELLED => {
                    match self.state.compare_exchange(
                        current,
                        UNSET,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(observed) => current = observed,
                    }
                }
                _ => {
                    debug_assert!(false, "signal reset with a waiter registered");
                    return;
                }
            }
        }
    }

    /// Waits for the signal to be set.
    ///
    /// Resolves to `Ok(())` when [`set`](Self::set) fires (or had already
    /// fired), or to `Err(Cancelled)` if stop is requested on `token`'s
    /// source first. If `set()` and the cancellation request race, the
    /// producer wins: the wait completes with success.
    pub fn wait<'a, 'b>(&'a self, token: &'b CancelToken) -> WaitFuture<'a, 'b> {
        WaitFuture {
            signal: self,
            token,
            node: WaiterNode::new(false),
            subscription: None,
            started: false,
            finished: false,
            _pin: PhantomPinned,
        }
    }

    /// Cancellation path for a registered waiter.
    ///
    /// Invoked by the waiter's cancellation subscription, which is created
    /// only after the registration is published, so any state other than the
    /// waiter's own address means someone else already resolved the wait.
    fn cancel_waiter(&self, node: &WaiterNode) {
        let addr = node as *const WaiterNode as usize;
        if self
            .state
            .compare_exchange(addr, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            complete(node, OUTCOME_CANCELLED);
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes a claimed waiter in the fixed order (ticket, waker, handshake,
/// wake) so the node's owner can free it once the handshake flag is set.
fn complete(node: &WaiterNode, outcome: u8) {
    if node.try_claim(outcome) {
        let waker = node.take_waker();
        node.finish();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Future returned by [`Signal::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct WaitFuture<'a, 'b> {
    signal: &'a Signal,
    token: &'b CancelToken,
    node: WaiterNode,
    subscription: Option<CancelSubscription>,
    started: bool,
    finished: bool,
    _pin: PhantomPinned,
}

/// Raw pointers handed to the cancellation callback. The future keeps both
/// referents alive until the subscription is deregistered.
struct CancelTarget {
    signal: NonNull<Signal>,
    node: NonNull<WaiterNode>,
}

// Safety: the callback only touches atomics and the waker mutex.
unsafe impl Send for CancelTarget {}

// Safety: the embedded raw-pointer-free state is all Sync; the node is only
// shared through &WaiterNode.
unsafe impl Send for WaitFuture<'_, '_> {}

impl Future for WaitFuture<'_, '_> {
    type Output = Result<(), Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: we never move out of `this`; the node stays pinned.
        let this = unsafe { self.get_unchecked_mut() };
        assert!(!this.finished, "WaitFuture polled after completion");

        if this.started {
            return this.poll_registered(cx.waker());
        }
        this.started = true;
        this.node.set_waker(cx.waker());

        let addr = &this.node as *const WaiterNode as usize;
        debug_assert_eq!(addr & 0b11, 0, "waiter nodes must be word-aligned");
        match this
            .signal
            .state
            .compare_exchange(UNSET, addr, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(SIGNALLED) => {
                // Already set; complete ourselves. No subscription exists
                // yet, so the ticket claim cannot fail.
                let claimed = this.node.try_claim(OUTCOME_GRANTED);
                debug_assert!(claimed);
                this.node.finish();
                this.finished = true;
                return Poll::Ready(Ok(()));
            }
            Err(CANCELLED) => {
                this.finished = true;
                return Poll::Ready(Err(Cancelled));
            }
            Err(_) => panic!("signal already has a registered waiter"),
        }

        // Subscribe only after publishing the registration: if stop was
        // already requested the callback runs inline, right here, and must
        // find the node in the state word.
        if this.token.stop_possible() {
            let target = CancelTarget {
                signal: NonNull::from(&*this.signal),
                node: NonNull::from(&this.node),
            };
            this.subscription = Some(CancelSubscription::new(this.token, move || {
                // Capture the struct, not its fields; closure capture of the
                // raw pointers alone would sidestep the Send impl.
                let target = target;
                // Safety: the future deregisters this subscription before
                // the signal borrow ends or the node is freed.
                unsafe { target.signal.as_ref().cancel_waiter(target.node.as_ref()) }
            }));
        }

        // set() or the inline cancellation may have resolved the wait
        // between the publish and here.
        match this.node.outcome() {
            OUTCOME_GRANTED => {
                this.node.wait_finished();
                this.finished = true;
                Poll::Ready(Ok(()))
            }
            OUTCOME_CANCELLED => {
                this.node.wait_finished();
                this.finished = true;
                Poll::Ready(Err(Cancelled))
            }
            _ => Poll::Pending,
        }
    }
}

impl WaitFuture<'_, '_> {
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
        // The claim publishes before the handshake flag; wait the handful of
        // instructions until the completer is done with the node.
        self.node.wait_finished();
        self.finished = true;
        if outcome == OUTCOME_GRANTED {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(Cancelled))
        }
    }
}

impl Drop for WaitFuture<'_, '_> {
    fn drop(&mut self) {
        if !self.started || self.finished {
            return;
        }
        // Deregistering first blocks out the cancel callback; after this no
        // new completer can appear.
        self.subscription = None;
        let addr = &self.node as *const WaiterNode as usize;
        if self
            .signal
            .state
            .compare_exchange(addr, UNSET, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Withdrawn cleanly; nobody ever saw the node.
            return;
        }
        // A completer claimed the node; wait until it is done touching it.
        self.node.wait_finished();
    }
}
