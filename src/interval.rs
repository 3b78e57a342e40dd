//! Poll intervals for the inspection loop.

use std::time::Duration;

/// Time until the next inspection tick.
///
/// Every part of a tick may ask for an earlier re-run; the loop adopts the
/// smallest interval requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval(Duration);

/// Maximum time between pod inspections if nothing else happens.
pub const MAX_POD_INSPECTOR_INTERVAL: Interval = Interval::from_secs(3600);
/// Interval used when something is expected to change soon.
pub const RECHECK_SOON_INTERVAL: Interval = Interval::from_secs(1);
/// Interval used right after finalizers have been removed.
pub const FINALIZER_REMOVED_INTERVAL: Interval = Interval::from_millis(500);
/// Interval used while finalizers are still pending.
pub const RECHECK_FINALIZER_INTERVAL: Interval = Interval::from_secs(10);

impl Interval {
    /// Create an interval from seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Create an interval from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Returns the smaller of the two intervals.
    #[must_use]
    pub fn reduce_to(self, other: Interval) -> Interval {
        self.min(other)
    }

    /// The interval as a [`Duration`].
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for Interval {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_to_keeps_smallest() {
        let interval = MAX_POD_INSPECTOR_INTERVAL
            .reduce_to(RECHECK_FINALIZER_INTERVAL)
            .reduce_to(RECHECK_SOON_INTERVAL)
            .reduce_to(RECHECK_FINALIZER_INTERVAL);

        assert_eq!(interval, RECHECK_SOON_INTERVAL);
    }

    #[test]
    fn test_finalizer_removed_is_shortest() {
        assert!(FINALIZER_REMOVED_INTERVAL < RECHECK_SOON_INTERVAL);
        assert_eq!(FINALIZER_REMOVED_INTERVAL.as_duration(), Duration::from_millis(500));
    }
}
