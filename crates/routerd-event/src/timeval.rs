//! `TimeVal` - (seconds, microseconds) time value
//!
//! The canonical time representation of the control plane. Values are
//! always normalized so the microsecond part lies in `[0, 1_000_000)`,
//! which keeps ordering lexicographic on `(sec, usec)`.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Rem, Sub, SubAssign};
use std::time::Duration;

/// Microseconds per second.
pub const ONE_MILLION: i64 = 1_000_000;

/// A second/microsecond pair with normalized microseconds.
///
/// Arithmetic saturates nowhere: the control plane never manipulates
/// times anywhere near the `i64` second range except for the
/// distinguished [`TimeVal::MAXIMUM`] sentinel, which must only be
/// compared against, never added to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeVal {
    sec: i64,
    usec: i32,
}

impl TimeVal {
    /// The zero time value.
    pub const ZERO: TimeVal = TimeVal { sec: 0, usec: 0 };

    /// The largest representable time value. Used as "no timer pending".
    pub const MAXIMUM: TimeVal = TimeVal {
        sec: i64::MAX,
        usec: (ONE_MILLION - 1) as i32,
    };

    /// Create a normalized value from seconds and microseconds.
    pub fn new(sec: i64, usec: i64) -> TimeVal {
        let mut t = TimeVal {
            sec: sec + usec.div_euclid(ONE_MILLION),
            usec: usec.rem_euclid(ONE_MILLION) as i32,
        };
        // div_euclid already borrowed from sec for negative usec
        if t.usec as i64 >= ONE_MILLION {
            t.sec += 1;
            t.usec -= ONE_MILLION as i32;
        }
        t
    }

    /// Whole-second constructor.
    #[inline]
    pub const fn from_secs(sec: i64) -> TimeVal {
        TimeVal { sec, usec: 0 }
    }

    /// Millisecond constructor.
    #[inline]
    pub fn from_millis(ms: i64) -> TimeVal {
        TimeVal::new(ms / 1_000, (ms % 1_000) * 1_000)
    }

    /// Microsecond constructor.
    #[inline]
    pub fn from_micros(us: i64) -> TimeVal {
        TimeVal::new(0, us)
    }

    /// The seconds component.
    #[inline]
    pub const fn sec(&self) -> i64 {
        self.sec
    }

    /// The microseconds component, in `[0, 1_000_000)`.
    #[inline]
    pub const fn usec(&self) -> i32 {
        self.usec
    }

    /// Total value in whole milliseconds, rounding toward zero.
    #[inline]
    pub fn as_millis(&self) -> i64 {
        self.sec * 1_000 + (self.usec / 1_000) as i64
    }

    /// Convert to floating-point seconds.
    #[inline]
    pub fn to_f64(&self) -> f64 {
        self.sec as f64 + self.usec as f64 * 1.0e-6
    }

    /// Convert from floating-point seconds.
    pub fn from_f64(d: f64) -> TimeVal {
        let sec = d.trunc() as i64;
        let usec = ((d - d.trunc()) * 1.0e6).round() as i64;
        TimeVal::new(sec, usec)
    }

    /// Difference `self - other` clamped at zero.
    pub fn saturating_sub(&self, other: &TimeVal) -> TimeVal {
        if self <= other {
            TimeVal::ZERO
        } else {
            *self - *other
        }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == TimeVal::ZERO
    }
}

impl Add for TimeVal {
    type Output = TimeVal;

    fn add(self, rhs: TimeVal) -> TimeVal {
        TimeVal::new(self.sec + rhs.sec, (self.usec + rhs.usec) as i64)
    }
}

impl AddAssign for TimeVal {
    fn add_assign(&mut self, rhs: TimeVal) {
        *self = *self + rhs;
    }
}

impl Sub for TimeVal {
    type Output = TimeVal;

    fn sub(self, rhs: TimeVal) -> TimeVal {
        TimeVal::new(self.sec - rhs.sec, (self.usec - rhs.usec) as i64)
    }
}

impl SubAssign for TimeVal {
    fn sub_assign(&mut self, rhs: TimeVal) {
        *self = *self - rhs;
    }
}

impl Mul<u32> for TimeVal {
    type Output = TimeVal;

    fn mul(self, n: u32) -> TimeVal {
        let n = n as i64;
        TimeVal::new(self.sec * n, self.usec as i64 * n)
    }
}

impl Div<u32> for TimeVal {
    type Output = TimeVal;

    fn div(self, n: u32) -> TimeVal {
        let n = n as i64;
        let total_usec = self.sec * ONE_MILLION + self.usec as i64;
        TimeVal::new(0, total_usec / n)
    }
}

impl Rem for TimeVal {
    type Output = TimeVal;

    fn rem(self, rhs: TimeVal) -> TimeVal {
        let a = self.sec * ONE_MILLION + self.usec as i64;
        let b = rhs.sec * ONE_MILLION + rhs.usec as i64;
        TimeVal::new(0, a.rem_euclid(b))
    }
}

impl From<Duration> for TimeVal {
    fn from(d: Duration) -> TimeVal {
        TimeVal::new(d.as_secs() as i64, d.subsec_micros() as i64)
    }
}

impl TryFrom<TimeVal> for Duration {
    type Error = ();

    /// Fails on negative values; `MAXIMUM` converts to `Duration::MAX`.
    fn try_from(t: TimeVal) -> Result<Duration, ()> {
        if t == TimeVal::MAXIMUM {
            return Ok(Duration::MAX);
        }
        if t.sec < 0 {
            return Err(());
        }
        Ok(Duration::new(t.sec as u64, (t.usec as u32) * 1_000))
    }
}

impl fmt::Display for TimeVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        let t = TimeVal::new(1, 2_500_000);
        assert_eq!(t.sec(), 3);
        assert_eq!(t.usec(), 500_000);

        let t = TimeVal::new(1, -300_000);
        assert_eq!(t.sec(), 0);
        assert_eq!(t.usec(), 700_000);
    }

    #[test]
    fn test_ordering_lexicographic() {
        let a = TimeVal::new(1, 999_999);
        let b = TimeVal::new(2, 0);
        assert!(a < b);
        assert!(TimeVal::ZERO < a);
        assert!(b < TimeVal::MAXIMUM);
    }

    #[test]
    fn test_add_sub_roundtrip() {
        let a = TimeVal::new(5, 400_000);
        let b = TimeVal::new(2, 700_000);
        let sum = a + b;
        assert_eq!(sum, TimeVal::new(8, 100_000));
        assert_eq!(sum - b, a);
    }

    #[test]
    fn test_mul_div() {
        let t = TimeVal::from_millis(250);
        assert_eq!(t * 4, TimeVal::from_secs(1));
        assert_eq!(TimeVal::from_secs(1) / 4, t);
    }

    #[test]
    fn test_rem() {
        let t = TimeVal::from_millis(85);
        let p = TimeVal::from_millis(20);
        assert_eq!(t % p, TimeVal::from_millis(5));
    }

    #[test]
    fn test_saturating_sub() {
        let a = TimeVal::from_millis(50);
        let b = TimeVal::from_millis(100);
        assert_eq!(a.saturating_sub(&b), TimeVal::ZERO);
        assert_eq!(b.saturating_sub(&a), TimeVal::from_millis(50));
    }

    #[test]
    fn test_duration_conversions() {
        let d = Duration::from_micros(1_234_567);
        let t = TimeVal::from(d);
        assert_eq!(t.sec(), 1);
        assert_eq!(t.usec(), 234_567);
        assert_eq!(Duration::try_from(t).unwrap(), d);
    }

    #[test]
    fn test_f64_conversions() {
        let t = TimeVal::new(2, 500_000);
        assert!((t.to_f64() - 2.5).abs() < 1e-9);
        assert_eq!(TimeVal::from_f64(2.5), t);
    }
}
