//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Provider configuration
//!
//! [`DelayConfig`] controls how a provider is built by
//! [`create_precise_delay_with`](crate::delay::create_precise_delay_with) and how the
//! process-wide helpers in the crate root treat requests.

use std::time::Duration;

use crate::delay::DelayError;

/// Upper bound on calibration samples
pub const MAX_CALIBRATION_SAMPLES: usize = 10_000;

/// Default number of calibration samples
pub const DEFAULT_CALIBRATION_SAMPLES: usize = 32;

/// Delay provider configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayConfig {
    /// Measure the achievable granularity when the provider is created
    pub calibrate_on_create: bool,

    /// Minimal delays issued per calibration run
    pub calibration_samples: usize,

    /// Largest relative delay accepted by the crate-level helpers
    pub max_delay: Option<Duration>,

    /// Alertable flag used by [`crate::sleep`]
    pub default_alertable: bool,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            calibrate_on_create: true,
            calibration_samples: DEFAULT_CALIBRATION_SAMPLES,
            max_delay: None,
            default_alertable: false,
        }
    }
}

impl DelayConfig {
    /// Starts a builder from the default configuration
    #[must_use]
    pub fn builder() -> DelayConfigBuilder {
        DelayConfigBuilder::default()
    }

    /// Checks the configuration for values no provider can honor
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::InvalidConfig`] describing the first bad field.
    pub fn validate(&self) -> Result<(), DelayError> {
        if self.calibration_samples == 0 {
            return Err(DelayError::InvalidConfig(
                "calibration_samples must be greater than 0".to_string(),
            ));
        }

        if self.calibration_samples > MAX_CALIBRATION_SAMPLES {
            return Err(DelayError::InvalidConfig(format!(
                "calibration_samples must be at most {MAX_CALIBRATION_SAMPLES}, got {}",
                self.calibration_samples
            )));
        }

        if self.max_delay == Some(Duration::ZERO) {
            return Err(DelayError::InvalidConfig(
                "max_delay must be greater than zero when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Rejects relative delays longer than `max_delay`
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::InvalidParameter`] when the limit is exceeded.
    pub fn check_limit(&self, requested: Duration) -> Result<(), DelayError> {
        match self.max_delay {
            Some(limit) if requested > limit => Err(DelayError::InvalidParameter(format!(
                "requested delay {requested:?} exceeds configured max_delay {limit:?}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Builder for [`DelayConfig`]
///
/// ```rust
/// use precise_delay::config::DelayConfig;
/// use std::time::Duration;
///
/// let config = DelayConfig::builder()
///     .calibration_samples(64)
///     .max_delay(Duration::from_secs(1))
///     .build()
///     .unwrap();
/// assert_eq!(config.calibration_samples, 64);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DelayConfigBuilder {
    config: DelayConfig,
}

impl DelayConfigBuilder {
    /// Calibrate on provider creation
    pub fn calibrate_on_create(mut self, enabled: bool) -> Self {
        self.config.calibrate_on_create = enabled;
        self
    }

    /// Number of minimal delays per calibration run
    pub fn calibration_samples(mut self, samples: usize) -> Self {
        self.config.calibration_samples = samples;
        self
    }

    /// Cap relative delays accepted by the crate-level helpers
    pub fn max_delay(mut self, limit: Duration) -> Self {
        self.config.max_delay = Some(limit);
        self
    }

    /// Alertable flag for [`crate::sleep`]
    pub fn default_alertable(mut self, alertable: bool) -> Self {
        self.config.default_alertable = alertable;
        self
    }

    /// Validates and returns the configuration
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::InvalidConfig`] if validation fails.
    pub fn build(self) -> Result<DelayConfig, DelayError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Predefined configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigProfile {
    /// Longer calibration for a tighter granularity estimate
    LowLatency,

    /// The default configuration
    Balanced,

    /// No calibration; providers are ready immediately
    Minimal,
}

impl ConfigProfile {
    /// Creates a [`DelayConfig`] for this profile
    #[must_use]
    pub fn create_config(self) -> DelayConfig {
        match self {
            ConfigProfile::LowLatency => DelayConfig {
                calibration_samples: 256,
                ..DelayConfig::default()
            },
            ConfigProfile::Balanced => DelayConfig::default(),
            ConfigProfile::Minimal => DelayConfig {
                calibrate_on_create: false,
                ..DelayConfig::default()
            },
        }
    }
}
