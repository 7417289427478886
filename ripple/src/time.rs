//! Time APIs for calculating with points in time and durations.
//!
//! These APIs are made for the Link Layer and are not meant to be general-purpose. The APIs here
//! have microsecond resolution and use 32-bit arithmetic wherever possible.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A duration with microsecond resolution.
///
/// This can represent a maximum duration of about 1 hour. Arithmetic saturates instead of
/// wrapping, so a timing budget that goes negative ends up as zero.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(u32);

impl Duration {
    /// The zero-length duration.
    pub const ZERO: Self = Duration(0);

    /// The duration of the interframe spacing between BLE packets.
    pub const T_IFS: Self = Duration(150);

    /// Creates a [`Duration`] from a number of microseconds.
    pub const fn from_micros(micros: u32) -> Self {
        Duration(micros)
    }

    /// Creates a [`Duration`] representing the given number of milliseconds.
    pub fn from_millis(millis: u16) -> Self {
        Duration(u32::from(millis) * 1_000)
    }

    /// Creates a [`Duration`] representing a number of seconds.
    pub fn from_secs(secs: u16) -> Self {
        Duration(u32::from(secs) * 1_000_000)
    }

    /// Creates a [`Duration`] from a count of 1.25 ms units, the unit of connection intervals and
    /// transmit window offsets.
    pub fn from_units_1250(units: u16) -> Self {
        Duration(u32::from(units) * 1_250)
    }

    /// Creates a [`Duration`] from a count of 10 ms units, the unit of supervision timeouts.
    pub fn from_units_10ms(units: u16) -> Self {
        Duration(u32::from(units) * 10_000)
    }

    /// Returns the number of whole seconds that fit in `self`.
    pub fn whole_secs(&self) -> u32 {
        self.0 / 1_000_000
    }

    /// Returns the number of whole milliseconds that fit in `self`.
    pub fn whole_millis(&self) -> u32 {
        self.0 / 1_000
    }

    /// Returns the number of microseconds represented by `self`.
    pub fn as_micros(&self) -> u32 {
        self.0
    }

    /// Returns the fractional part of microseconds in `self`.
    pub fn subsec_micros(&self) -> u32 {
        self.0 % 1_000_000
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

fn fmt_micros(micros: u32, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if micros >= 1_000_000 {
        let (secs, subsec_micros) = (micros / 1_000_000, micros % 1_000_000);
        if subsec_micros == 0 {
            write!(f, "{}s", secs)
        } else {
            write!(f, "{}.{:06}s", secs, subsec_micros)
        }
    } else if micros >= 1000 {
        let (millis, submilli_micros) = (micros / 1000, micros % 1000);
        if submilli_micros == 0 {
            write!(f, "{}ms", millis)
        } else {
            write!(f, "{}.{:03}ms", millis, submilli_micros)
        }
    } else {
        write!(f, "{}µs", micros)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_micros(self.0, f)
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_micros(self.0, f)
    }
}

/// A point in time, relative to an unspecfied epoch.
///
/// This has microsecond resolution and may wrap around after >1 hour. Apart from the wraparound, it
/// is monotonic.
///
/// `Instant`s are handed to the controller by the [`Scheduler`] glue. Mixing `Instant`s that come
/// from different time bases causes unspecified results.
///
/// [`Scheduler`]: ../ticker/trait.Scheduler.html
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Instant(u32);

impl Instant {
    /// The maximum time between two `Instant`s that can be handled by [`Instant::duration_since`].
    pub const MAX_TIME_BETWEEN: Duration = Duration(1_000_000 * 60 * 5); // 5 minutes

    /// Creates an `Instant` from raw microseconds since an arbitrary implementation-defined
    /// reference point.
    pub fn from_raw_micros(micros: u32) -> Self {
        Instant(micros)
    }

    /// Returns the raw value from which this `Instant` was created.
    pub fn raw_micros(&self) -> u32 {
        self.0
    }

    /// Calculates the duration of time that has passed between `earlier` and `self`.
    ///
    /// Calling this method when the `Instant`s are further apart than
    /// [`Instant::MAX_TIME_BETWEEN`] is an error and may panic in debug builds.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        let micros_passed = self.0.wrapping_sub(earlier.0);
        debug_assert!(
            micros_passed <= Self::MAX_TIME_BETWEEN.0,
            "{}µs between instants {} and {}",
            micros_passed,
            earlier,
            self
        );

        Duration(micros_passed)
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.duration_since(rhs)
    }
}

/// A [`Duration`] can be added to an [`Instant`], moving the [`Instant`] forwards in time.
impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0.wrapping_add(d.as_micros()))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

/// A [`Duration`] can be subtracted from an [`Instant`], moving the [`Instant`] backwards in time.
impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, d: Duration) -> Self {
        Instant(self.0.wrapping_sub(d.as_micros()))
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, d: Duration) {
        *self = *self - d;
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_micros(self.0, f)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_micros(self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units() {
        assert_eq!(Duration::from_units_1250(30).as_micros(), 37_500);
        assert_eq!(Duration::from_units_10ms(100), Duration::from_secs(1));
        assert_eq!(Duration::from_millis(3) - Duration::from_secs(1), Duration::ZERO);
    }

    #[test]
    fn display() {
        assert_eq!(Duration::from_micros(150).to_string(), "150µs");
        assert_eq!(Duration::from_units_1250(30).to_string(), "37.500ms");
        assert_eq!(Duration::from_secs(4).to_string(), "4s");
    }

    #[test]
    fn instant_wraps() {
        let early = Instant::from_raw_micros(u32::max_value() - 9);
        let late = early + Duration::from_micros(20);
        assert_eq!(late.raw_micros(), 10);
        assert_eq!(late - early, Duration::from_micros(20));
    }
}
