//! Bounded busy-wait backoff.
//!
//! Used wherever this crate spin-waits: the cancellation source's internal
//! spinlock, cross-thread subscription removal, and the short windows in which
//! one thread waits for another to publish a state transition. All of those
//! waits are bounded to O(1) logical work per contended party, so a spin with
//! escalating backoff beats parking the thread.

use std::hint;
use std::thread;

/// The number of spin rounds before each wait escalates to `yield_now`.
const SPIN_ROUNDS: u32 = 6;

/// Exponential spin-then-yield backoff.
///
/// Each call to [`spin`](Self::spin) busy-waits a little longer than the
/// last; once the spin budget is exhausted every further call yields the
/// thread to the scheduler.
#[derive(Debug, Default)]
pub struct SpinWait {
    counter: u32,
}

impl SpinWait {
    /// Creates a fresh backoff state.
    #[must_use]
    pub const fn new() -> Self {
        Self { counter: 0 }
    }

    /// Performs one backoff step.
    pub fn spin(&mut self) {
        if self.counter < SPIN_ROUNDS {
            self.counter += 1;
            for _ in 0..(1u32 << self.counter) {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
    }

    /// Resets the backoff to its initial (shortest) wait.
    pub fn reset(&mut self) {
        self.counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_escalates_without_panicking() {
        let mut spin = SpinWait::new();
        for _ in 0..32 {
            spin.spin();
        }
        spin.reset();
        spin.spin();
    }
}
