//! Cancelsync: cooperative cancellation and cancellation-aware async locks.
//!
//! # Overview
//!
//! Cancelsync is the synchronization core of an asynchronous runtime: a
//! broadcast-once cancellation signal tree plus a set of locking primitives
//! whose pending acquisitions can be cancelled at any time, from any thread.
//! The central guarantee is exactly-once completion: a pending wait that is
//! raced between its grant and a concurrent cancellation resolves to precisely
//! one of the two outcomes, never both and never neither.
//!
//! # Core Guarantees
//!
//! - **Exactly-once completion**: grant and cancel paths share a run-once
//!   completion ticket; whichever claims it delivers
//! - **FIFO fairness**: lock waiters are granted in arrival order, except for
//!   the shared lock's documented immediate-grant rule
//! - **Writer anti-starvation**: readers arriving behind a queued writer wait
//!   their turn rather than jumping ahead
//! - **No missed wakeups**: the fast-path flags and waiter queues are only
//!   ever reconciled under a single internal critical section
//! - **No allocation in the hot path**: waiter records are embedded in the
//!   pending operation and linked intrusively
//!
//! # Module Structure
//!
//! - [`intrusive`]: non-owning linked list and lock-free MPSC queue
//! - [`cancel`]: cancellation source, token, and scoped subscriptions
//! - [`sync`]: single-waiter signal, async mutex, async read-write lock
//! - [`util`]: spin-wait backoff
//! - [`error`]: the `Cancelled` completion value
//! - [`test_logging`]: leveled logging support for the test suites

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

pub mod cancel;
pub mod error;
pub mod intrusive;
pub mod sync;
pub mod test_logging;
pub mod util;

// Re-exports for convenient access to core types
pub use cancel::{CancelSource, CancelSubscription, CancelToken};
pub use error::Cancelled;
pub use sync::{Mutex, RwLock, Signal};
