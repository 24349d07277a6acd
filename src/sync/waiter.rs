//! The waiter record embedded in every pending acquisition.
//!
//! A `WaiterNode` is owned by the caller of a lock for the duration of the
//! wait (it lives inside the pinned acquisition future) and is referenced,
//! never owned, by the lock's internal queue. Two small state machines live
//! here:
//!
//! - the **phase** word tracks how far `start()` got before a concurrent
//!   cancellation fired (not yet enqueued / acquired without enqueueing /
//!   enqueued / cancelled), so whichever side observes the other's transition
//!   performs the cleanup;
//! - the **completion ticket** is a run-once claim shared by the grant and
//!   cancel paths: whichever CAS wins delivers, the loser backs off.
//!
//! Completion publishes in a fixed order: claim the ticket, take the waker,
//! set the handshake flag, then wake. An owner abandoning its wait can
//! therefore spin on the handshake flag and know the completing thread is
//! done touching the node.

use parking_lot::Mutex as ParkingMutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::Waker;

use crate::util::SpinWait;

/// `start()` has not yet published whether it acquired or enqueued.
pub(crate) const PHASE_NOT_ENQUEUED: u8 = 0;
/// `start()` acquired the lock immediately, without enqueueing.
pub(crate) const PHASE_ACQUIRED_NOT_ENQUEUED: u8 = 1;
/// `start()` enqueued the waiter.
pub(crate) const PHASE_ENQUEUED: u8 = 2;
/// The cancellation callback fired.
pub(crate) const PHASE_CANCELLED: u8 = 3;

/// No completion has been claimed yet.
pub(crate) const OUTCOME_PENDING: u8 = 0;
/// The waiter was granted the lock (or the signal was set).
pub(crate) const OUTCOME_GRANTED: u8 = 1;
/// The waiter was cancelled.
pub(crate) const OUTCOME_CANCELLED: u8 = 2;

/// One pending acquisition's shared state.
#[derive(Debug)]
pub(crate) struct WaiterNode {
    /// Where `start()` got to; swapped to `PHASE_CANCELLED` by the
    /// cancellation callback.
    pub(crate) phase: AtomicU8,
    /// The run-once completion ticket.
    outcome: AtomicU8,
    /// Set once the completing thread is done touching this node.
    finished: AtomicBool,
    /// The waker to resume the waiting task.
    waker: ParkingMutex<Option<Waker>>,
    /// Whether the node is currently linked into the lock's queue. Guarded
    /// by the lock's internal mutex.
    pub(crate) queued: AtomicBool,
    /// Whether this waiter wants exclusive access (shared lock only).
    pub(crate) exclusive: bool,
}

impl WaiterNode {
    pub(crate) fn new(exclusive: bool) -> Self {
        Self {
            phase: AtomicU8::new(PHASE_NOT_ENQUEUED),
            outcome: AtomicU8::new(OUTCOME_PENDING),
            finished: AtomicBool::new(false),
            waker: ParkingMutex::new(None),
            queued: AtomicBool::new(false),
            exclusive,
        }
    }

    /// Stores (or refreshes) the waker to resume. Executors may hand out a
    /// different waker on every poll; failing to update would leave the task
    /// unwakeable.
    pub(crate) fn set_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    /// Claims the run-once completion ticket for `outcome`. Exactly one
    /// caller per node ever succeeds.
    pub(crate) fn try_claim(&self, outcome: u8) -> bool {
        debug_assert_ne!(outcome, OUTCOME_PENDING);
        self.outcome
            .compare_exchange(
                OUTCOME_PENDING,
                outcome,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn outcome(&self) -> u8 {
        self.outcome.load(Ordering::Acquire)
    }

    /// Takes the stored waker. Only the ticket winner may call this.
    pub(crate) fn take_waker(&self) -> Option<Waker> {
        self.waker.lock().take()
    }

    /// Marks the completion handshake: the completing thread will not touch
    /// the node again (waking happens through the already-taken waker).
    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Spins until the completing thread has finished with the node. Called
    /// by an abandoning owner before it frees the node's memory.
    pub(crate) fn wait_finished(&self) {
        let mut spin = SpinWait::new();
        while !self.finished.load(Ordering::Acquire) {
            spin.spin();
        }
    }
}
