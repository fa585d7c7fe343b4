use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Logical batch time in milliseconds since the stream's zero time.
///
/// Ticks happen at `k * batch_duration` for `k >= 1`; a batch stamped `T`
/// covers the records that arrived in `[T - batch_duration, T)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Time(u64);

impl Time {
    pub const ZERO: Time = Time(0);

    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub const fn millis(self) -> u64 {
        self.0
    }

    /// True when this time falls on a boundary of `interval` counted from zero.
    /// Zero itself is never a boundary.
    pub fn is_boundary(self, interval: Duration) -> bool {
        let step = duration_millis(interval);
        step > 0 && self.0 > 0 && self.0.is_multiple_of(step)
    }

    /// `self - d`, clamped at zero.
    pub fn saturating_sub(self, d: Duration) -> Time {
        Time(self.0.saturating_sub(duration_millis(d)))
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, d: Duration) -> Time {
        Time(self.0.saturating_add(duration_millis(d)))
    }
}

impl Sub<Duration> for Time {
    type Output = Time;

    fn sub(self, d: Duration) -> Time {
        self.saturating_sub(d)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ms", self.0)
    }
}

/// Whole milliseconds in `d`, saturating.
pub fn duration_millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// True when `d` has no sub-millisecond remainder.
pub fn is_whole_millis(d: Duration) -> bool {
    d.subsec_nanos().is_multiple_of(1_000_000)
}

/// True when `d` is a positive whole multiple of `base`, compared exactly.
pub fn is_multiple_of(d: Duration, base: Duration) -> bool {
    let (d, base) = (d.as_nanos(), base.as_nanos());
    d > 0 && base > 0 && d.is_multiple_of(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries() {
        let half = Duration::from_millis(500);
        assert!(!Time::ZERO.is_boundary(half));
        assert!(Time::from_millis(500).is_boundary(half));
        assert!(Time::from_millis(1500).is_boundary(half));
        assert!(!Time::from_millis(1500).is_boundary(Duration::from_secs(1)));
        assert!(!Time::from_millis(1000).is_boundary(Duration::ZERO));
    }

    #[test]
    fn arithmetic_saturates_at_zero() {
        let t = Time::from_millis(500);
        assert_eq!(t - Duration::from_secs(1), Time::ZERO);
        assert_eq!(t + Duration::from_millis(250), Time::from_millis(750));
    }

    #[test]
    fn multiples() {
        let base = Duration::from_millis(500);
        assert!(is_multiple_of(Duration::from_millis(1500), base));
        assert!(!is_multiple_of(Duration::from_millis(100), base));
        assert!(!is_multiple_of(Duration::ZERO, base));
        assert!(!is_multiple_of(Duration::from_micros(1_500_250), base));
        assert!(is_whole_millis(Duration::from_millis(1500)));
        assert!(!is_whole_millis(Duration::from_micros(500_700)));
    }
}
