//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Delay requests in native 100-nanosecond ticks
//!
//! A [`DelayInterval`] carries the exact encoding the NT kernel expects for a wait:
//! a signed 64-bit count of 100ns ticks where the sign selects the mode.
//!
//! ```text
//! raw < 0   relative delay of |raw| * 100ns
//! raw == 0  immediate (returns promptly on every backend)
//! raw > 0   absolute deadline, ticks since 1601-01-01 UTC
//! ```
//!
//! Constructors validate the conversion from higher-level time types and never clamp:
//! a value that does not fit is reported as [`DelayError::InvalidParameter`].
//! Relative conversions round up to the next whole tick so a delay never undershoots.
//!
//! # Example
//!
//! ```rust
//! use precise_delay::interval::{DelayInterval, IntervalKind};
//! use std::time::Duration;
//!
//! let interval = DelayInterval::relative(Duration::from_micros(250)).unwrap();
//! assert_eq!(interval.as_raw(), -2_500);
//! assert_eq!(interval.kind(), IntervalKind::Relative);
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::delay::DelayError;

/// Nanoseconds per native tick
pub const NANOS_PER_TICK: u64 = 100;

/// Native ticks per second
pub const TICKS_PER_SEC: u64 = 10_000_000;

/// Ticks between the NT epoch (1601-01-01) and the Unix epoch (1970-01-01)
pub const UNIX_EPOCH_TICKS: i64 = 116_444_736_000_000_000;

/// Interpretation of a raw interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntervalKind {
    /// Wait for a span of time measured from the call
    Relative,
    /// Wait until a point in NT system time
    Absolute,
}

/// A single delay request in native 100ns ticks
///
/// Holds no resources. Build one right before the call and hand it to
/// [`PreciseDelay::delay`](crate::delay::PreciseDelay::delay).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DelayInterval {
    raw: i64,
}

impl DelayInterval {
    /// The immediate interval
    pub const ZERO: Self = Self { raw: 0 };

    /// Relative delay of `duration`, rounded up to whole ticks
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::InvalidParameter`] if the tick count overflows `i64`.
    pub fn relative(duration: Duration) -> Result<Self, DelayError> {
        let ticks = duration.as_nanos().div_ceil(u128::from(NANOS_PER_TICK));
        let ticks = i64::try_from(ticks).map_err(|_| {
            DelayError::InvalidParameter(format!("relative delay of {duration:?} overflows 100ns ticks"))
        })?;

        Ok(Self { raw: -ticks })
    }

    /// Relative delay of `nanos` nanoseconds, rounded up to whole ticks
    ///
    /// Every `u64` nanosecond count fits, but the conversion is still checked.
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::InvalidParameter`] if the tick count overflows `i64`.
    pub fn relative_nanos(nanos: u64) -> Result<Self, DelayError> {
        let ticks = nanos.div_ceil(NANOS_PER_TICK);
        let ticks = i64::try_from(ticks).map_err(|_| {
            DelayError::InvalidParameter(format!("relative delay of {nanos}ns overflows 100ns ticks"))
        })?;

        Ok(Self { raw: -ticks })
    }

    /// Absolute deadline in ticks since 1601-01-01 UTC
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::InvalidParameter`] for negative tick values, which
    /// would be read as a relative delay.
    pub fn absolute_ticks(ticks: i64) -> Result<Self, DelayError> {
        if ticks < 0 {
            return Err(DelayError::InvalidParameter(format!(
                "absolute deadline must be non-negative, got {ticks}"
            )));
        }

        Ok(Self { raw: ticks })
    }

    /// Absolute deadline at `deadline`
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::InvalidParameter`] if `deadline` predates the NT
    /// epoch or does not fit in `i64` ticks.
    pub fn absolute(deadline: SystemTime) -> Result<Self, DelayError> {
        let ticks = system_time_to_ticks(deadline).ok_or_else(|| {
            DelayError::InvalidParameter(format!("deadline {deadline:?} is outside the NT time range"))
        })?;

        Self::absolute_ticks(ticks)
    }

    /// Wraps a raw native value without validation
    #[must_use]
    pub const fn from_raw(raw: i64) -> Self {
        Self { raw }
    }

    /// The raw native encoding
    #[must_use]
    pub const fn as_raw(self) -> i64 {
        self.raw
    }

    /// Whether this is a relative delay or an absolute deadline
    ///
    /// Zero reports [`IntervalKind::Relative`].
    #[must_use]
    pub const fn kind(self) -> IntervalKind {
        if self.raw > 0 { IntervalKind::Absolute } else { IntervalKind::Relative }
    }

    /// True for relative delays (including zero)
    #[must_use]
    pub const fn is_relative(self) -> bool {
        self.raw <= 0
    }

    /// True for absolute deadlines
    #[must_use]
    pub const fn is_absolute(self) -> bool {
        self.raw > 0
    }

    /// Time still owed at `now`
    ///
    /// Relative delays ignore `now`. Absolute deadlines in the past yield zero.
    #[must_use]
    pub fn remaining(self, now: SystemTime) -> Duration {
        match self.kind() {
            IntervalKind::Relative => ticks_to_duration(self.raw.unsigned_abs()),
            IntervalKind::Absolute => {
                // Times past the representable range are treated as already due
                let Some(now_ticks) = system_time_to_ticks(now) else {
                    return Duration::ZERO;
                };
                ticks_to_duration(self.raw.saturating_sub(now_ticks).max(0).unsigned_abs())
            },
        }
    }
}

/// Converts a tick count to a [`Duration`] without overflowing nanoseconds
#[must_use]
pub fn ticks_to_duration(ticks: u64) -> Duration {
    let secs = ticks / TICKS_PER_SEC;
    #[allow(clippy::cast_possible_truncation)]
    let sub_nanos = ((ticks % TICKS_PER_SEC) * NANOS_PER_TICK) as u32;
    Duration::new(secs, sub_nanos)
}

/// Ticks since the NT epoch for `time`, or `None` if out of range
fn system_time_to_ticks(time: SystemTime) -> Option<i64> {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => {
            let ticks = since.as_nanos().div_ceil(u128::from(NANOS_PER_TICK));
            i64::try_from(ticks).ok()?.checked_add(UNIX_EPOCH_TICKS)
        },
        Err(before) => {
            let ticks = before.duration().as_nanos() / u128::from(NANOS_PER_TICK);
            let ticks = UNIX_EPOCH_TICKS.checked_sub(i64::try_from(ticks).ok()?)?;
            (ticks >= 0).then_some(ticks)
        },
    }
}
