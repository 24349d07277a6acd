//! Error types for Cancelsync.
//!
//! This core defines exactly one non-panic failure value: [`Cancelled`].
//! A pending acquisition is resolved by precisely one of success or
//! cancellation, so lock and wait futures return `Result<_, Cancelled>`.
//! Everything else that can go wrong here (double unlock, a second waiter on
//! a single-waiter signal, dropping a cancel source with live subscriptions)
//! is a caller bug and surfaces as an assertion, not an error value.

use core::fmt;

/// A pending operation was resolved by cancellation rather than by its grant.
///
/// This is an expected outcome, delivered through the same completion channel
/// as success and distinguished only by this value. It carries no payload:
/// the cancellation request itself is the whole story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}
