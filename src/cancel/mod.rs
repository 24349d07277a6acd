//! Cooperative cancellation signal tree.
//!
//! One [`CancelSource`] owns a cancellation domain; any number of cheap
//! [`CancelToken`] handles reference it; a [`CancelSubscription`] registers a
//! callback to run once, when stop is requested. Registration and removal are
//! safe to perform concurrently with delivery, including from inside a
//! callback that is currently being delivered.

mod source;

pub use source::{CancelSource, CancelSubscription, CancelToken};
