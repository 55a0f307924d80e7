#![allow(unsafe_code)] // clock_nanosleep requires unsafe

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Linux delay via clock_nanosleep on CLOCK_MONOTONIC
use libc::{CLOCK_MONOTONIC, EINTR, EINVAL, TIMER_ABSTIME, clock_gettime, clock_nanosleep, timespec};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{Calibratable, CallProbe, DelayError, PreciseDelay, owed, sample_granularity};
use crate::config::DelayConfig;
use crate::interval::DelayInterval;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Linux delay provider using `clock_nanosleep`
#[derive(Debug)]
pub struct LinuxDelay {
    // Samples per calibration run
    calibration_samples: usize,
    // Calibrated granularity (ns)
    granularity_ns: AtomicU64,
}

impl LinuxDelay {
    /// Creates a new Linux delay provider
    ///
    /// # Errors
    ///
    /// Returns an error if `CLOCK_MONOTONIC` cannot be read.
    pub fn new(config: &DelayConfig) -> Result<Self, DelayError> {
        // Verify the monotonic clock
        monotonic_now()?;

        Ok(Self {
            calibration_samples: config.calibration_samples,
            granularity_ns: AtomicU64::new(0),
        })
    }

    // Native wait without tracing or metrics
    #[inline]
    #[allow(clippy::unused_self)]
    fn delay_raw(&self, interval: DelayInterval, alertable: bool) -> Result<(), DelayError> {
        let wait = owed(interval);
        if wait.is_zero() {
            std::thread::yield_now();
            return Ok(());
        }

        // Sleeping to a fixed deadline keeps resumed waits from drifting
        let deadline = deadline_after(wait)?;

        loop {
            // SAFETY: deadline is a valid timespec; remain is unused with TIMER_ABSTIME
            let ret = unsafe {
                clock_nanosleep(CLOCK_MONOTONIC, TIMER_ABSTIME, &deadline, std::ptr::null_mut())
            };

            match ret {
                0 => return Ok(()),
                EINTR if alertable => return Ok(()),
                EINTR => {},
                EINVAL => {
                    return Err(DelayError::InvalidParameter(format!(
                        "clock_nanosleep rejected interval {}",
                        interval.as_raw()
                    )));
                },
                errno => return Err(DelayError::NativeFailure { status: i64::from(errno) }),
            }
        }
    }
}

// Current CLOCK_MONOTONIC reading
fn monotonic_now() -> Result<timespec, DelayError> {
    let mut ts = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    // SAFETY: Valid timespec and clock ID
    let ret = unsafe { clock_gettime(CLOCK_MONOTONIC, &mut ts) };

    if ret == 0 {
        Ok(ts)
    } else {
        Err(DelayError::SystemCallFailed(std::io::Error::last_os_error()))
    }
}

// Monotonic deadline `wait` from now
fn deadline_after(wait: Duration) -> Result<timespec, DelayError> {
    let now = monotonic_now()?;
    add_to_timespec(now, wait).ok_or_else(|| {
        DelayError::InvalidParameter(format!("deadline {wait:?} from now overflows timespec"))
    })
}

#[allow(clippy::cast_possible_wrap, clippy::useless_conversion)]
fn add_to_timespec(base: timespec, wait: Duration) -> Option<timespec> {
    let secs = libc::time_t::try_from(wait.as_secs()).ok()?;
    let mut tv_sec = base.tv_sec.checked_add(secs)?;
    let mut tv_nsec = i64::from(base.tv_nsec) + i64::from(wait.subsec_nanos());

    if tv_nsec >= NANOS_PER_SEC {
        tv_sec = tv_sec.checked_add(1)?;
        tv_nsec -= NANOS_PER_SEC;
    }

    Some(timespec {
        tv_sec,
        tv_nsec: tv_nsec as _,
    })
}

impl PreciseDelay for LinuxDelay {
    #[inline]
    fn delay(&self, interval: DelayInterval, alertable: bool) -> Result<(), DelayError> {
        let probe = CallProbe::start(self.platform_name(), interval, alertable);
        let result = self.delay_raw(interval, alertable);
        probe.finish(&result);
        result
    }

    #[inline]
    fn calibrated_granularity_ns(&self) -> u64 {
        self.granularity_ns.load(Ordering::Relaxed)
    }

    fn platform_name(&self) -> &'static str {
        "Linux (clock_nanosleep)"
    }
}

impl Calibratable for LinuxDelay {
    fn calibrate(&mut self) -> Result<(), DelayError> {
        let granularity = self.measure_granularity()?;
        self.granularity_ns.store(granularity, Ordering::Relaxed);
        Ok(())
    }

    fn measure_granularity(&self) -> Result<u64, DelayError> {
        let minimal = DelayInterval::from_raw(-1);
        sample_granularity(self.calibration_samples, || self.delay_raw(minimal, false))
    }
}
