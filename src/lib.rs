//! Precise-Delay: Sub-Millisecond Thread Delay
//!
//! This library suspends the calling thread through the operating system's native
//! high-resolution wait primitive, bypassing the portable sleep whose resolution is
//! quantized to the scheduler tick (commonly 1-15ms).
//!
//! # Features
//!
//! - **Native Wait**: `NtDelayExecution` on Windows, `clock_nanosleep` on Linux,
//!   `mach_wait_until` on macOS
//! - **Probe Once**: native entry points are resolved once per process and cached
//! - **Never Undershoots**: requests round up to the next 100ns tick
//! - **Alertable Waits**: optional early return on OS-delivered asynchronous events
//!
//! # Optional Features
//!
//! - `tracing`: probe, provider and per-call events via `tracing`
//! - `metrics`: call, error and overshoot metrics via `metrics`
//!
//! # Example
//!
//! ```rust
//! use std::time::{Duration, Instant};
//!
//! let start = Instant::now();
//! precise_delay::sleep(Duration::from_micros(750)).unwrap();
//! assert!(start.elapsed() >= Duration::from_micros(750));
//!
//! // Relative delay in nanoseconds, alertable
//! precise_delay::sleep_ns(250_000, true).unwrap();
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Native high-resolution thread delay
/// Provider configuration
pub mod config;
/// Platform delay providers
pub mod delay;
/// Native 100ns delay requests
pub mod interval;

use std::time::Duration;

// Public API exports
pub use config::{ConfigProfile, DelayConfig, DelayConfigBuilder};
pub use delay::{
    Calibratable, DelayError, DelayInfo, PortableDelay, PreciseDelay, create_precise_delay,
    create_precise_delay_with, global, install_global,
};
pub use interval::{DelayInterval, IntervalKind};

/// Delays the current thread for `nanos` nanoseconds using the process-wide provider
///
/// Relative only. Rounds up to whole 100ns ticks.
///
/// # Errors
///
/// - [`DelayError::InvalidParameter`] if the delay exceeds the configured `max_delay`
/// - the cached error if the native primitive is unavailable
/// - errors from [`PreciseDelay::delay`]
pub fn sleep_ns(nanos: u64, alertable: bool) -> Result<(), DelayError> {
    let installed = delay::installed()?;
    installed.config.check_limit(Duration::from_nanos(nanos))?;
    installed
        .provider
        .delay(DelayInterval::relative_nanos(nanos)?, alertable)
}

/// Delays the current thread for `duration` using the process-wide provider
///
/// Uses the configured `default_alertable` flag (non-alertable by default).
///
/// # Errors
///
/// As [`sleep_ns`], plus [`DelayError::InvalidParameter`] if `duration` overflows
/// the native encoding.
pub fn sleep(duration: Duration) -> Result<(), DelayError> {
    let installed = delay::installed()?;
    installed.config.check_limit(duration)?;
    installed
        .provider
        .delay(DelayInterval::relative(duration)?, installed.config.default_alertable)
}

/// Issues a raw dual-mode request through the process-wide provider
///
/// Use this for absolute deadlines; [`sleep`] and [`sleep_ns`] cover relative delays.
///
/// # Errors
///
/// As [`sleep_ns`].
pub fn delay(interval: DelayInterval, alertable: bool) -> Result<(), DelayError> {
    let installed = delay::installed()?;
    if interval.is_relative() {
        installed
            .config
            .check_limit(crate::interval::ticks_to_duration(interval.as_raw().unsigned_abs()))?;
    }
    installed.provider.delay(interval, alertable)
}
