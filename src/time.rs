/// Instants and extents as the engine stores them.
///
/// Keys need a fixed-width, byte-sortable time representation, so internally
/// the engine works with `(seconds, nanos)` pairs rather than `chrono` types.
/// `chrono` stays at the API boundary: callers convert with
/// [`Time::from_datetime`] / [`Time::to_datetime`].
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Nanoseconds per second; `nanos` is always strictly below this.
pub const NANOS_PER_SEC: u32 = 1_000_000_000;

/// An instant with nanosecond precision.
///
/// Ordering is derived field-by-field (seconds, then nanos), which matches
/// chronological order. The full `i64` seconds range is representable, wider
/// than what `chrono` accepts; out-of-range instants simply don't convert
/// back to `DateTime`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Time {
    /// Seconds since the Unix epoch (may be negative).
    pub seconds: i64,
    /// Nanoseconds within the second, `0..NANOS_PER_SEC`.
    pub nanos: u32,
}

impl Time {
    /// The earliest representable instant.
    pub const MIN: Time = Time {
        seconds: i64::MIN,
        nanos: 0,
    };

    /// The latest representable instant. Also used as the sentinel
    /// result-time bucket meaning "result time equals phenomenon time".
    pub const MAX: Time = Time {
        seconds: i64::MAX,
        nanos: NANOS_PER_SEC - 1,
    };

    /// Create an instant, normalizing nanosecond overflow into seconds.
    pub fn new(seconds: i64, nanos: u32) -> Self {
        let extra = (nanos / NANOS_PER_SEC) as i64;
        Self {
            seconds: seconds.saturating_add(extra),
            nanos: nanos % NANOS_PER_SEC,
        }
    }

    /// Whole seconds only.
    pub fn from_seconds(seconds: i64) -> Self {
        Self { seconds, nanos: 0 }
    }

    /// The current instant.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert from a `chrono` timestamp.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            seconds: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos() % NANOS_PER_SEC,
        }
    }

    /// Convert to a `chrono` timestamp, if within `chrono`'s range.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.seconds, self.nanos)
    }
}

impl From<DateTime<Utc>> for Time {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}s+{}ns", self.seconds, self.nanos),
        }
    }
}

/// A closed time interval `[begin, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeExtent {
    /// Inclusive start.
    pub begin: Time,
    /// Inclusive end.
    pub end: Time,
}

impl TimeExtent {
    /// Create an extent; `begin` and `end` are swapped if reversed.
    pub fn new(begin: Time, end: Time) -> Self {
        if begin <= end {
            Self { begin, end }
        } else {
            Self {
                begin: end,
                end: begin,
            }
        }
    }

    /// A degenerate extent covering a single instant.
    pub fn instant(t: Time) -> Self {
        Self { begin: t, end: t }
    }

    /// The unbounded extent.
    pub fn all() -> Self {
        Self {
            begin: Time::MIN,
            end: Time::MAX,
        }
    }

    /// Whether `t` lies within this extent.
    pub fn contains(&self, t: Time) -> bool {
        self.begin <= t && t <= self.end
    }

    /// Whether two extents overlap.
    pub fn intersects(&self, other: &TimeExtent) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }

    /// Grow this extent to cover `t`.
    pub fn expand(&mut self, t: Time) {
        if t < self.begin {
            self.begin = t;
        }
        if t > self.end {
            self.end = t;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_chronological() {
        let a = Time::new(10, 500);
        let b = Time::new(10, 501);
        let c = Time::new(11, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(Time::MIN < a);
        assert!(c < Time::MAX);
    }

    #[test]
    fn test_normalization() {
        let t = Time::new(5, 2_500_000_000);
        assert_eq!(t.seconds, 7);
        assert_eq!(t.nanos, 500_000_000);
    }

    #[test]
    fn test_datetime_round_trip() {
        let now = Utc::now();
        let t = Time::from_datetime(now);
        let back = t.to_datetime().unwrap();
        assert_eq!(back.timestamp(), now.timestamp());
        assert_eq!(back.timestamp_subsec_nanos(), now.timestamp_subsec_nanos());
    }

    #[test]
    fn test_extent_contains_and_intersects() {
        let e = TimeExtent::new(Time::from_seconds(10), Time::from_seconds(20));
        assert!(e.contains(Time::from_seconds(10)));
        assert!(e.contains(Time::from_seconds(20)));
        assert!(!e.contains(Time::from_seconds(21)));

        let other = TimeExtent::new(Time::from_seconds(20), Time::from_seconds(30));
        assert!(e.intersects(&other));
        let disjoint = TimeExtent::new(Time::from_seconds(21), Time::from_seconds(30));
        assert!(!e.intersects(&disjoint));
    }

    #[test]
    fn test_extent_swaps_reversed_bounds() {
        let e = TimeExtent::new(Time::from_seconds(20), Time::from_seconds(10));
        assert_eq!(e.begin, Time::from_seconds(10));
        assert_eq!(e.end, Time::from_seconds(20));
    }

    #[test]
    fn test_expand() {
        let mut e = TimeExtent::instant(Time::from_seconds(10));
        e.expand(Time::from_seconds(5));
        e.expand(Time::from_seconds(15));
        assert_eq!(e.begin, Time::from_seconds(5));
        assert_eq!(e.end, Time::from_seconds(15));
    }
}
