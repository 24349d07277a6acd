//! Non-owning intrusive containers.
//!
//! The containers in this module never allocate and never own their elements:
//! every element embeds a [`ListNode`] whose link fields the container
//! threads through. Ownership of each node stays with whoever embedded it,
//! typically a pending operation living on a caller's stack or inside a
//! pinned future; the container holds only raw, non-owning pointers.
//!
//! # Safety discipline
//!
//! A node handed to a container must stay pinned (its address must not
//! change) and must outlive its membership. Both containers debug-assert on
//! drop that nothing is still linked: a node left behind is an upstream bug,
//! not a condition the container can recover from.

mod list;
mod queue;

pub use list::{IntrusiveList, ListNode};
pub use queue::AtomicIntrusiveQueue;
