#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Portable delay using std::thread::sleep (tick-bound, not sub-tick)
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Calibratable, CallProbe, DelayError, PreciseDelay, owed, sample_granularity};
use crate::config::DelayConfig;
use crate::interval::DelayInterval;

/// Portable delay provider using `std::thread::sleep`
///
/// WARNING: Resolution is bounded by the scheduler tick! This provider is never chosen
/// by [`create_precise_delay`](super::create_precise_delay); embedders build it
/// explicitly as a fallback or as a baseline for comparison. `std::thread::sleep`
/// cannot be interrupted, so the alertable flag has no effect.
#[derive(Debug)]
pub struct PortableDelay {
    /// Samples per calibration run
    calibration_samples: usize,
    /// Calibrated granularity in nanoseconds
    granularity_ns: AtomicU64,
    /// Whether we've logged a warning about using the portable path
    warned: Once,
}

impl PortableDelay {
    /// Creates a new portable provider
    #[must_use]
    pub fn new(config: &DelayConfig) -> Self {
        Self {
            calibration_samples: config.calibration_samples,
            granularity_ns: AtomicU64::new(0),
            warned: Once::new(),
        }
    }

    /// Logs a warning about tick-bound resolution (once)
    fn warn_once(&self) {
        self.warned.call_once(|| {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Using portable std::thread::sleep delay. \
                Resolution is bounded by the scheduler tick."
            );

            // Also log to stderr if tracing is not available
            #[cfg(not(feature = "tracing"))]
            eprintln!(
                "WARNING: Using portable std::thread::sleep delay. \
                Resolution is bounded by the scheduler tick."
            );
        });
    }

    #[inline]
    #[allow(clippy::unused_self)]
    fn delay_raw(&self, interval: DelayInterval) {
        let wait = owed(interval);
        if wait.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(wait);
        }
    }
}

impl PreciseDelay for PortableDelay {
    #[inline]
    fn delay(&self, interval: DelayInterval, alertable: bool) -> Result<(), DelayError> {
        self.warn_once();

        let probe = CallProbe::start(self.platform_name(), interval, alertable);
        self.delay_raw(interval);
        let result = Ok(());
        probe.finish(&result);
        result
    }

    #[inline]
    fn calibrated_granularity_ns(&self) -> u64 {
        self.granularity_ns.load(Ordering::Relaxed)
    }

    fn platform_name(&self) -> &'static str {
        "Portable (std::thread::sleep - WARNING: tick-bound resolution)"
    }

    fn is_native(&self) -> bool {
        false
    }
}

impl Calibratable for PortableDelay {
    fn calibrate(&mut self) -> Result<(), DelayError> {
        let granularity = self.measure_granularity()?;
        self.granularity_ns.store(granularity, Ordering::Relaxed);
        Ok(())
    }

    fn measure_granularity(&self) -> Result<u64, DelayError> {
        let minimal = DelayInterval::from_raw(-1);
        sample_granularity(self.calibration_samples, || {
            self.delay_raw(minimal);
            Ok(())
        })
    }
}

impl Default for PortableDelay {
    fn default() -> Self {
        Self::new(&DelayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_portable_delay_measurement() {
        let provider = PortableDelay::default();

        let requested = Duration::from_millis(1);
        let start = Instant::now();
        provider.delay_for(requested, false).expect("delay failed");

        assert!(start.elapsed() >= requested, "Delay undershot: {:?}", start.elapsed());
    }

    #[test]
    fn test_alertable_has_no_effect() {
        let provider = PortableDelay::default();

        let start = Instant::now();
        provider.delay_for(Duration::from_millis(1), true).expect("delay failed");
        assert!(start.elapsed() >= Duration::from_millis(1));
    }

    #[test]
    fn test_calibration() {
        let mut provider = PortableDelay::default();

        assert_eq!(provider.calibrated_granularity_ns(), 0);
        provider.calibrate().expect("Calibration failed");
        assert!(provider.calibrated_granularity_ns() > 0);
    }

    #[test]
    fn test_platform_name() {
        let provider = PortableDelay::default();
        assert!(provider.platform_name().contains("Portable"));
        assert!(provider.platform_name().contains("WARNING"));
        assert!(!provider.is_native());
        assert!(!provider.info().native);
    }
}
