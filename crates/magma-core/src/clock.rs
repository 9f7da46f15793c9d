//! # Clock Sources
//!
//! Monotonic time for host-side polling and timeouts.

use core::sync::atomic::{AtomicU64, Ordering};

/// Nanoseconds per microsecond
pub const NSEC_PER_USEC: u64 = 1_000;

/// Nanoseconds per millisecond
pub const NSEC_PER_MSEC: u64 = 1_000_000;

/// Source of monotonic time
pub trait ClockSource: Send + Sync {
    /// Monotonic time in nanoseconds
    fn monotonic_ns(&self) -> u64;
}

/// Deterministic clock that advances a fixed step on every read
#[derive(Debug)]
pub struct StepClock {
    now: AtomicU64,
    step: u64,
}

impl StepClock {
    /// Create a clock starting at zero
    pub const fn new(step: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            step,
        }
    }

    /// Advance time by given nanoseconds
    pub fn advance(&self, nanos: u64) {
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Current time without advancing
    pub fn peek(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl ClockSource for StepClock {
    fn monotonic_ns(&self) -> u64 {
        self.now.fetch_add(self.step, Ordering::SeqCst)
    }
}

/// Host clock backed by `std::time::Instant`
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct StdClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    /// Create a clock with its origin at the current instant
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl ClockSource for StdClock {
    fn monotonic_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_clock() {
        let clock = StepClock::new(10);
        assert_eq!(clock.monotonic_ns(), 0);
        assert_eq!(clock.monotonic_ns(), 10);
        clock.advance(NSEC_PER_USEC);
        assert_eq!(clock.peek(), 1_020);
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_std_clock_is_monotonic() {
        let clock = StdClock::new();
        let a = clock.monotonic_ns();
        let b = clock.monotonic_ns();
        assert!(b >= a);
    }
}
