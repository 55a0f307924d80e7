//! Native high-resolution thread delay
//!
//! This module suspends the calling thread through the operating system's lowest-level
//! wait primitive instead of the tick-quantized portable sleep. Each platform backend
//! implements the [`PreciseDelay`] capability; the `unsafe` foreign calls live only in
//! the backend modules.
//!
//! # Platform Support
//!
//! - **Windows**: `ntdll!NtDelayExecution`, resolved at runtime and probed once per process
//! - **Linux**: `clock_nanosleep(CLOCK_MONOTONIC, TIMER_ABSTIME)`
//! - **macOS**: `mach_wait_until` on the Mach absolute clock
//! - **Portable**: `std::thread::sleep`, exported for comparison and embedder fallbacks only
//!
//! [`create_precise_delay`] never falls back to the portable provider. If the native
//! entry point is missing the error is returned to the caller, who decides what to do.
//!
//! # Alertable Waits
//!
//! An alertable wait may return early when the OS delivers an asynchronous event to
//! the waiting thread (a user APC on Windows, a signal on Unix). A non-alertable wait
//! always runs the full duration. In both cases the result is `Ok(())`.
//!
//! # Example
//!
//! ```rust
//! use precise_delay::delay::create_precise_delay;
//! use std::time::{Duration, Instant};
//!
//! let provider = create_precise_delay().unwrap();
//! let start = Instant::now();
//! provider.delay_for(Duration::from_micros(500), false).unwrap();
//! assert!(start.elapsed() >= Duration::from_micros(500));
//! ```

use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;

use crate::config::DelayConfig;
use crate::interval::DelayInterval;

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
mod portable;
#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "linux")]
pub use linux::LinuxDelay;
#[cfg(target_os = "macos")]
pub use macos::MacOsDelay;
pub use portable::PortableDelay;
#[cfg(target_os = "windows")]
pub use windows::WindowsDelay;

/// Errors reported by delay providers
#[derive(Debug, Error)]
pub enum DelayError {
    /// Native entry point could not be resolved on this OS build
    #[error("Native delay primitive unavailable: {0}")]
    Unavailable(&'static str),

    /// No native backend exists for this target
    #[error("Platform not supported: {0}")]
    PlatformNotSupported(String),

    /// Request cannot be encoded or was rejected by the platform
    #[error("Invalid delay parameter: {0}")]
    InvalidParameter(String),

    /// Native call returned a status this crate does not interpret
    #[error("Native delay call failed with status {status:#x}")]
    NativeFailure {
        /// Raw status value (NTSTATUS, errno or kern_return_t)
        status: i64,
    },

    /// Auxiliary system call failed
    #[error("System call failed: {0}")]
    SystemCallFailed(#[from] std::io::Error),

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DelayError {
    /// Short label for metrics and logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DelayError::Unavailable(_) => "unavailable",
            DelayError::PlatformNotSupported(_) => "platform_not_supported",
            DelayError::InvalidParameter(_) => "invalid_parameter",
            DelayError::NativeFailure { .. } => "native_failure",
            DelayError::SystemCallFailed(_) => "system_call_failed",
            DelayError::InvalidConfig(_) => "invalid_config",
        }
    }

    /// Copy of a cached error, for the process-wide provider slot
    fn replay(&self) -> Self {
        match self {
            DelayError::Unavailable(symbol) => DelayError::Unavailable(symbol),
            DelayError::PlatformNotSupported(os) => DelayError::PlatformNotSupported(os.clone()),
            DelayError::InvalidParameter(msg) => DelayError::InvalidParameter(msg.clone()),
            DelayError::NativeFailure { status } => DelayError::NativeFailure { status: *status },
            DelayError::SystemCallFailed(err) => {
                DelayError::SystemCallFailed(std::io::Error::new(err.kind(), err.to_string()))
            },
            DelayError::InvalidConfig(msg) => DelayError::InvalidConfig(msg.clone()),
        }
    }
}

/// Capability to suspend the calling thread with sub-tick precision
///
/// Implementations hold no per-call state and may be shared across threads. Each call
/// blocks only the calling thread.
pub trait PreciseDelay: Send + Sync {
    /// Suspends the calling thread for `interval`
    ///
    /// Negative intervals are relative, positive ones are absolute NT deadlines and
    /// zero returns promptly. See [`DelayInterval`].
    ///
    /// # Errors
    ///
    /// - [`DelayError::InvalidParameter`] if the platform rejects the interval
    /// - [`DelayError::NativeFailure`] for any other native failure status
    fn delay(&self, interval: DelayInterval, alertable: bool) -> Result<(), DelayError>;

    /// Suspends the calling thread for a relative `duration`
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::InvalidParameter`] if `duration` overflows the native
    /// encoding, otherwise the errors of [`PreciseDelay::delay`].
    fn delay_for(&self, duration: Duration, alertable: bool) -> Result<(), DelayError> {
        self.delay(DelayInterval::relative(duration)?, alertable)
    }

    /// Median elapsed time of a minimal delay, or 0 before calibration
    fn calibrated_granularity_ns(&self) -> u64;

    /// Name of the backing primitive
    fn platform_name(&self) -> &'static str;

    /// Whether this provider uses a native sub-tick primitive
    fn is_native(&self) -> bool {
        true
    }

    /// Summary of this provider
    fn info(&self) -> DelayInfo {
        DelayInfo {
            platform: self.platform_name().to_string(),
            granularity_ns: self.calibrated_granularity_ns(),
            native: self.is_native(),
        }
    }
}

/// Providers that can measure their own achievable granularity
pub trait Calibratable {
    /// Measures the granularity and stores it for
    /// [`PreciseDelay::calibrated_granularity_ns`]
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a sample delay.
    fn calibrate(&mut self) -> Result<(), DelayError>;

    /// Measures the granularity without storing it
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a sample delay.
    fn measure_granularity(&self) -> Result<u64, DelayError>;
}

/// Information about a delay provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayInfo {
    /// Platform name
    pub platform: String,
    /// Calibrated granularity in nanoseconds
    pub granularity_ns: u64,
    /// Whether the provider uses a native sub-tick primitive
    pub native: bool,
}

impl fmt::Display for DelayInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Delay[{}: granularity={}ns, native={}]",
            self.platform, self.granularity_ns, self.native
        )
    }
}

/// Creates the native delay provider for this platform with the default config
///
/// # Errors
///
/// See [`create_precise_delay_with`].
pub fn create_precise_delay() -> Result<Box<dyn PreciseDelay>, DelayError> {
    create_precise_delay_with(&DelayConfig::default())
}

/// Creates the native delay provider for this platform
///
/// The backend is chosen at compile time. There is no fallback: a missing native
/// entry point is reported, not papered over.
///
/// # Errors
///
/// - [`DelayError::InvalidConfig`] if `config` fails validation
/// - [`DelayError::Unavailable`] if the native symbol cannot be resolved
/// - [`DelayError::PlatformNotSupported`] on targets without a native backend
/// - any error raised while calibrating
pub fn create_precise_delay_with(config: &DelayConfig) -> Result<Box<dyn PreciseDelay>, DelayError> {
    config.validate()?;

    #[cfg(target_os = "windows")]
    {
        prepare(WindowsDelay::new(config)?, config)
    }

    #[cfg(target_os = "linux")]
    {
        prepare(LinuxDelay::new(config)?, config)
    }

    #[cfg(target_os = "macos")]
    {
        prepare(MacOsDelay::new(config)?, config)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        #[cfg(feature = "tracing")]
        tracing::warn!(os = std::env::consts::OS, "No native delay primitive for this target");

        Err(DelayError::PlatformNotSupported(std::env::consts::OS.to_string()))
    }
}

#[cfg(any(target_os = "linux", target_os = "windows", target_os = "macos"))]
fn prepare<T>(mut provider: T, config: &DelayConfig) -> Result<Box<dyn PreciseDelay>, DelayError>
where
    T: PreciseDelay + Calibratable + 'static,
{
    if config.calibrate_on_create {
        provider.calibrate()?;
    }

    #[cfg(feature = "tracing")]
    tracing::info!(
        platform = provider.platform_name(),
        granularity_ns = provider.calibrated_granularity_ns(),
        "Precise delay provider ready"
    );

    Ok(Box::new(provider))
}

/// Provider and config shared by the crate-level helpers
pub(crate) struct Installed {
    pub(crate) provider: Box<dyn PreciseDelay>,
    pub(crate) config: DelayConfig,
}

static INSTALLED: OnceLock<Result<Installed, DelayError>> = OnceLock::new();

pub(crate) fn installed() -> Result<&'static Installed, DelayError> {
    INSTALLED
        .get_or_init(|| build_installed(DelayConfig::default()))
        .as_ref()
        .map_err(DelayError::replay)
}

fn build_installed(config: DelayConfig) -> Result<Installed, DelayError> {
    let provider = create_precise_delay_with(&config)?;
    Ok(Installed { provider, config })
}

/// The process-wide provider, created on first use with the default config
///
/// The outcome is cached, including failure, so the native symbol is probed at most once.
///
/// # Errors
///
/// The error from the first creation attempt, replayed on every call.
pub fn global() -> Result<&'static dyn PreciseDelay, DelayError> {
    installed().map(|installed| &*installed.provider)
}

/// Installs the process-wide provider with `config`
///
/// Must run before the first call to [`global`] or the crate-level helpers.
///
/// # Errors
///
/// - [`DelayError::InvalidConfig`] if a provider is already installed
/// - any error from [`create_precise_delay_with`]
pub fn install_global(config: DelayConfig) -> Result<(), DelayError> {
    if INSTALLED.get().is_some() {
        return Err(DelayError::InvalidConfig(
            "global delay provider already initialized".to_string(),
        ));
    }

    let installed = build_installed(config)?;
    INSTALLED.set(Ok(installed)).map_err(|_| {
        DelayError::InvalidConfig("global delay provider already initialized".to_string())
    })
}

/// Per-call tracing and metrics around a native delay
#[cfg_attr(not(any(feature = "tracing", feature = "metrics")), allow(dead_code))]
pub(crate) struct CallProbe {
    platform: &'static str,
    interval: DelayInterval,
    #[cfg(feature = "metrics")]
    started: Instant,
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
impl CallProbe {
    #[inline]
    pub(crate) fn start(platform: &'static str, interval: DelayInterval, alertable: bool) -> Self {
        #[cfg(feature = "tracing")]
        tracing::trace!(platform, raw = interval.as_raw(), alertable, "Delay requested");

        Self {
            platform,
            interval,
            #[cfg(feature = "metrics")]
            started: Instant::now(),
        }
    }

    #[inline]
    pub(crate) fn finish(self, result: &Result<(), DelayError>) {
        #[cfg(feature = "metrics")]
        counter!("precise_delay_calls_total", "platform" => self.platform).increment(1);

        match result {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                {
                    if self.interval.is_relative() {
                        let requested = crate::interval::ticks_to_duration(self.interval.as_raw().unsigned_abs());
                        let overshoot = self.started.elapsed().saturating_sub(requested);
                        histogram!("precise_delay_overshoot_ns", "platform" => self.platform)
                            .record(overshoot.as_nanos() as f64);
                    }
                }
            },
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    platform = self.platform,
                    raw = self.interval.as_raw(),
                    error = %err,
                    "Delay failed"
                );

                #[cfg(feature = "metrics")]
                counter!("precise_delay_errors_total", "platform" => self.platform, "kind" => err.kind())
                    .increment(1);
            },
        }
    }
}

/// Wait still owed for `interval`, reading the wall clock only for absolute deadlines
pub(crate) fn owed(interval: DelayInterval) -> Duration {
    if interval.is_absolute() {
        interval.remaining(SystemTime::now())
    } else {
        interval.remaining(SystemTime::UNIX_EPOCH)
    }
}

/// Median elapsed time over `samples` runs of `one`
pub(crate) fn sample_granularity<F>(samples: usize, mut one: F) -> Result<u64, DelayError>
where
    F: FnMut() -> Result<(), DelayError>,
{
    let mut elapsed = Vec::with_capacity(samples);

    for _ in 0..samples {
        let start = Instant::now();
        one()?;
        elapsed.push(u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX));
    }

    elapsed.sort_unstable();
    Ok(median_of_sorted(&elapsed))
}

/// Calculates the median of a sorted slice
fn median_of_sorted(values: &[u64]) -> u64 {
    let len = values.len();
    if len == 0 {
        return 0;
    }

    if len % 2 == 0 {
        let (low, high) = (values[len / 2 - 1], values[len / 2]);
        low + (high - low) / 2
    } else {
        values[len / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_calculation() {
        assert_eq!(median_of_sorted(&[]), 0);
        assert_eq!(median_of_sorted(&[5]), 5);
        assert_eq!(median_of_sorted(&[1, 2]), 1); // 1.5 rounds down
        assert_eq!(median_of_sorted(&[1, 2, 3]), 2);
        assert_eq!(median_of_sorted(&[1, 3]), 2);
        assert_eq!(median_of_sorted(&[u64::MAX, u64::MAX]), u64::MAX);
    }

    #[test]
    fn test_sample_granularity_propagates_errors() {
        let mut calls = 0;
        let result = sample_granularity(10, || {
            calls += 1;
            if calls == 3 { Err(DelayError::NativeFailure { status: 7 }) } else { Ok(()) }
        });

        assert!(matches!(result, Err(DelayError::NativeFailure { status: 7 })));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_error_replay_preserves_variant() {
        let original = DelayError::Unavailable("ntdll!NtDelayExecution");
        assert!(matches!(original.replay(), DelayError::Unavailable("ntdll!NtDelayExecution")));

        let io = DelayError::SystemCallFailed(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        match io.replay() {
            DelayError::SystemCallFailed(err) => assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied),
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn test_native_failure_display_is_hex() {
        let err = DelayError::NativeFailure { status: 0xC000_0005 };
        assert_eq!(err.to_string(), "Native delay call failed with status 0xc0000005");
        assert_eq!(err.kind(), "native_failure");
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_call_probe_metrics() {
        use metrics_util::debugging::{DebugValue, DebuggingRecorder};

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let interval = DelayInterval::from_raw(-10);
            CallProbe::start("Test", interval, false).finish(&Ok(()));
            CallProbe::start("Test", interval, true)
                .finish(&Err(DelayError::NativeFailure { status: 7 }));
        });

        let mut calls = 0;
        let mut native_failures = 0;
        let mut overshoot_samples = 0;
        for (key, _, _, value) in snapshotter.snapshot().into_vec() {
            let key = key.key();
            match (key.name(), value) {
                ("precise_delay_calls_total", DebugValue::Counter(n)) => calls += n,
                ("precise_delay_errors_total", DebugValue::Counter(n)) => {
                    assert!(key.labels().any(|l| l.key() == "kind" && l.value() == "native_failure"));
                    native_failures += n;
                },
                ("precise_delay_overshoot_ns", DebugValue::Histogram(samples)) => {
                    overshoot_samples += samples.len();
                },
                _ => {},
            }
        }

        // Failed calls are still calls
        assert_eq!(calls, 2);
        assert_eq!(native_failures, 1);
        assert_eq!(overshoot_samples, 1);
    }

    #[test]
    fn test_info_display() {
        let info = DelayInfo {
            platform: "Test".to_string(),
            granularity_ns: 1500,
            native: true,
        };
        assert_eq!(info.to_string(), "Delay[Test: granularity=1500ns, native=true]");
    }

    #[cfg(any(target_os = "linux", target_os = "windows", target_os = "macos"))]
    #[test]
    fn test_create_native_provider() {
        let provider = create_precise_delay().expect("native provider");

        assert!(provider.is_native());
        assert!(!provider.platform_name().is_empty());
        assert!(provider.calibrated_granularity_ns() > 0, "default config calibrates");
    }

    #[cfg(any(target_os = "linux", target_os = "windows", target_os = "macos"))]
    #[test]
    fn test_uncalibrated_provider() {
        let config = DelayConfig {
            calibrate_on_create: false,
            ..DelayConfig::default()
        };
        let provider = create_precise_delay_with(&config).expect("native provider");
        assert_eq!(provider.calibrated_granularity_ns(), 0);
    }

    #[test]
    fn test_invalid_config_rejected_before_probe() {
        let config = DelayConfig {
            calibration_samples: 0,
            ..DelayConfig::default()
        };
        assert!(matches!(create_precise_delay_with(&config), Err(DelayError::InvalidConfig(_))));
    }

    #[cfg(any(target_os = "linux", target_os = "windows", target_os = "macos"))]
    #[test]
    fn test_global_is_cached() {
        let first = global().expect("global provider") as *const dyn PreciseDelay as *const ();
        let second = global().expect("global provider") as *const dyn PreciseDelay as *const ();
        assert_eq!(first, second);
        assert!(install_global(DelayConfig::default()).is_err());
    }
}
