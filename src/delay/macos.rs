#![allow(unsafe_code)] /* Mach kernel APIs require unsafe */

/**
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

/* macOS delay via mach_wait_until */

use mach2::kern_return::{KERN_ABORTED, KERN_SUCCESS};
use mach2::mach_time::{mach_absolute_time, mach_timebase_info, mach_timebase_info_data_t, mach_wait_until};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{Calibratable, CallProbe, DelayError, PreciseDelay, owed, sample_granularity};
use crate::config::DelayConfig;
use crate::interval::DelayInterval;

/// macOS delay provider using `mach_wait_until`
#[derive(Debug)]
pub struct MacOsDelay {
    /// Mach timebase numerator (absolute units to ns)
    numer: u32,
    /// Mach timebase denominator
    denom: u32,
    /// Samples per calibration run
    calibration_samples: usize,
    /// Calibrated granularity in nanoseconds
    granularity_ns: AtomicU64,
}

impl MacOsDelay {
    /// Creates a new macOS delay provider
    ///
    /// # Errors
    ///
    /// Returns an error if `mach_timebase_info` fails or reports a zero ratio.
    pub fn new(config: &DelayConfig) -> Result<Self, DelayError> {
        let mut info = mach_timebase_info_data_t { numer: 0, denom: 0 };

        // SAFETY: info is a valid, writable timebase struct
        let kr = unsafe { mach_timebase_info(&mut info) };

        if kr != KERN_SUCCESS {
            return Err(DelayError::SystemCallFailed(std::io::Error::other(format!(
                "mach_timebase_info failed with kern_return: {kr}"
            ))));
        }

        if info.numer == 0 || info.denom == 0 {
            return Err(DelayError::SystemCallFailed(std::io::Error::other(
                "mach_timebase_info returned a zero ratio",
            )));
        }

        Ok(Self {
            numer: info.numer,
            denom: info.denom,
            calibration_samples: config.calibration_samples,
            granularity_ns: AtomicU64::new(0),
        })
    }

    /// Converts a wait to Mach absolute time units, rounding up
    fn to_mach_units(&self, wait: Duration) -> Option<u64> {
        let units = (wait.as_nanos() * u128::from(self.denom)).div_ceil(u128::from(self.numer));
        u64::try_from(units).ok()
    }

    /// Native wait without tracing or metrics
    #[inline]
    fn delay_raw(&self, interval: DelayInterval, alertable: bool) -> Result<(), DelayError> {
        let wait = owed(interval);
        if wait.is_zero() {
            std::thread::yield_now();
            return Ok(());
        }

        // SAFETY: mach_absolute_time has no preconditions
        let now = unsafe { mach_absolute_time() };
        let deadline = self
            .to_mach_units(wait)
            .and_then(|units| now.checked_add(units))
            .ok_or_else(|| {
                DelayError::InvalidParameter(format!("deadline {wait:?} from now overflows Mach time"))
            })?;

        loop {
            // SAFETY: mach_wait_until takes a plain deadline value
            let kr = unsafe { mach_wait_until(deadline) };

            match kr {
                KERN_SUCCESS => return Ok(()),
                KERN_ABORTED if alertable => return Ok(()),
                KERN_ABORTED => {},
                other => return Err(DelayError::NativeFailure { status: i64::from(other) }),
            }
        }
    }
}

impl PreciseDelay for MacOsDelay {
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
        "macOS (mach_wait_until)"
    }
}

impl Calibratable for MacOsDelay {
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
