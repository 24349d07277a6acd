//! Internal utilities.

mod spin;

pub use spin::SpinWait;
