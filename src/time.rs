//! Monotonic instants and durations used across the stack.
//!
//! The timer, ARP cache, and TCP sessions all reason about elapsed
//! milliseconds rather than wall-clock time. This wraps `std::time::Instant`
//! with the millisecond-granular API the rest of the crate expects, instead
//! of threading raw `Instant`/`Duration` through every signature.

use std::fmt;
use std::time::{Duration as StdDuration, Instant as StdInstant};

/// A point in monotonic time, expressed as milliseconds since an unspecified
/// epoch (the first call to [`Instant::now`] in the process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant {
    millis: i64,
}

impl Instant {
    pub fn now() -> Instant {
        let epoch = EPOCH.get_or_init(StdInstant::now);
        Instant {
            millis: epoch.elapsed().as_millis() as i64,
        }
    }

    pub const fn from_millis(millis: i64) -> Instant {
        Instant { millis }
    }

    pub const fn from_secs(secs: i64) -> Instant {
        Instant {
            millis: secs * 1000,
        }
    }

    pub const fn total_millis(&self) -> i64 {
        self.millis
    }

    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_millis((self.millis - earlier.millis).max(0) as u64)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:03}s", self.millis / 1000, self.millis % 1000)
    }
}

use std::sync::OnceLock;
static EPOCH: OnceLock<StdInstant> = OnceLock::new();

/// A span of time, expressed in whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration {
    millis: u64,
}

impl Duration {
    pub const fn from_millis(millis: u64) -> Duration {
        Duration { millis }
    }

    pub const fn from_secs(secs: u64) -> Duration {
        Duration {
            millis: secs * 1000,
        }
    }

    pub const fn millis(&self) -> u64 {
        self.millis
    }

    pub const fn secs(&self) -> u64 {
        self.millis / 1000
    }

    pub fn as_std(&self) -> StdDuration {
        StdDuration::from_millis(self.millis)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ms", self.millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_orders_monotonically() {
        let a = Instant::from_millis(10);
        let b = Instant::from_millis(20);
        assert!(a < b);
        assert_eq!(b.saturating_duration_since(a), Duration::from_millis(10));
        assert_eq!(a.saturating_duration_since(b), Duration::from_millis(0));
    }

    #[test]
    fn now_is_monotonic() {
        let a = Instant::now();
        std::thread::sleep(StdDuration::from_millis(2));
        let b = Instant::now();
        assert!(b >= a);
    }
}
