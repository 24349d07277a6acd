//! Cancellation-aware synchronization primitives.
//!
//! All three primitives share one contract: a pending acquisition is resolved
//! by exactly one of *granted* or *cancelled*, even when the grant and a
//! cancellation request race on different threads with no common lock held
//! across the decision point.
//!
//! - [`Signal`]: the minimal building block; one producer, one waiter, one
//!   cancellation subscriber, racing to a single completion in one word
//! - [`Mutex`]: FIFO async mutual exclusion with direct ownership handoff
//! - [`RwLock`]: shared/exclusive lock with reader batching and writer
//!   anti-starvation
//!
//! Waiting never blocks a thread: an acquisition that cannot be granted
//! immediately parks a waiter record and returns `Poll::Pending`; resumption
//! generally happens from whichever thread performs the releasing call, so
//! callers needing affinity to their original execution context re-schedule
//! themselves.

mod mutex;
mod rwlock;
mod signal;
pub(crate) mod waiter;

pub use mutex::{LockFuture, Mutex, MutexGuard};
pub use rwlock::{ReadFuture, RwLock, RwLockReadGuard, RwLockWriteGuard, WriteFuture};
pub use signal::{Signal, WaitFuture};
