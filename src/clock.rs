//! Monotonic clock helpers built on [`crate::fiber::time_ms`].
//!
//! Grounded on the teacher crate's `clock.rs`, which exposes the same small
//! set of free functions over a single underlying clock source instead of
//! requiring callers to construct their own `Instant`.

use std::time::Duration;

/// A duration effectively indistinguishable from "forever" for the
/// purposes of a timeout parameter, matching the teacher crate's own
/// `clock::INFINITY` constant (there: 100 years).
pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Milliseconds elapsed since this thread's runtime was created.
pub fn monotonic_ms() -> u64 {
    crate::fiber::time_ms()
}

/// The same value as [`monotonic_ms`], as a [`Duration`].
pub fn monotonic() -> Duration {
    Duration::from_millis(monotonic_ms())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backwards() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }
}
