//! Live dispatch settings
//!
//! Settings are read fresh by the caller for every invocation and passed in by
//! reference; the engine never mutates them.
//!
//! ```ron
//! DispatchSettings(
//!     batch_limit: 500,
//!     max_active_workers: 2,
//!     throttle_interval_micros: 0,
//!     environment: Production,
//! )
//! ```

use std::{fmt, time::Duration};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Longest lock lifetime accepted, one week
const MAX_LOCK_TTL_SECS: u64 = 7 * 24 * 60 * 60;

const fn default_lock_ttl() -> u64 {
    1800 // 30 minutes
}

const fn default_true() -> bool {
    true
}

/// Deployment environment the engine runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Environment {
    #[default]
    Production,
    Staging,
    Development,
}

impl Environment {
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Production => "Production",
            Self::Staging => "Staging",
            Self::Development => "Development",
        })
    }
}

/// Settings consulted by a single dispatch invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Maximum recipients sent by one invocation, shared across the campaigns
    /// it serves (0 = unbounded)
    #[serde(default)]
    pub batch_limit: usize,

    /// Maximum number of workers actively sending at once (0 = unbounded)
    #[serde(default)]
    pub max_active_workers: usize,

    /// Pause between two consecutive sends, in microseconds
    #[serde(default)]
    pub throttle_interval_micros: u64,

    /// Environment the engine is deployed in
    #[serde(default)]
    pub environment: Environment,

    /// Explicit opt-in to send from a non-production environment
    #[serde(default)]
    pub allow_non_production: bool,

    /// Whether the outbound mail backend is switched on at all
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub outbound_enabled: bool,

    /// Lifetime of data and worker-slot locks, in seconds. Queue claims older
    /// than this are considered abandoned and may be claimed again.
    ///
    /// Default: 1800 seconds (30 minutes)
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Extra time a worker keeps its slot after sending, in seconds
    ///
    /// Only useful to observe contention between concurrent workers.
    #[serde(default)]
    pub lock_hold_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_limit: 0,
            max_active_workers: 0,
            throttle_interval_micros: 0,
            environment: Environment::default(),
            allow_non_production: false,
            outbound_enabled: true,
            lock_ttl_secs: default_lock_ttl(),
            lock_hold_secs: 0,
        }
    }
}

impl DispatchSettings {
    /// Parse settings from RON text and validate them
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid RON for these settings or
    /// the resulting values fail [`DispatchSettings::validate`].
    pub fn from_ron(text: &str) -> Result<Self, SettingsError> {
        let settings: Self = ron::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the settings for caller misuse
    ///
    /// # Errors
    ///
    /// Returns an error if the lock lifetime is zero or too long, or if the
    /// lock hold would outlive the lock itself.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.lock_ttl_secs == 0 {
            return Err(SettingsError::ZeroLockTtl);
        }

        if self.lock_ttl_secs > MAX_LOCK_TTL_SECS {
            return Err(SettingsError::LockTtlTooLong {
                ttl: self.lock_ttl_secs,
                max: MAX_LOCK_TTL_SECS,
            });
        }

        if self.lock_hold_secs >= self.lock_ttl_secs {
            return Err(SettingsError::HoldOutlivesLock {
                hold: self.lock_hold_secs,
                ttl: self.lock_ttl_secs,
            });
        }

        Ok(())
    }

    /// Per-invocation budget, `None` when unbounded
    #[must_use]
    pub const fn batch_budget(&self) -> Option<usize> {
        if self.batch_limit == 0 {
            None
        } else {
            Some(self.batch_limit)
        }
    }

    /// Lock lifetime as a calendar duration
    #[must_use]
    pub fn lock_ttl(&self) -> TimeDelta {
        i64::try_from(self.lock_ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    /// Delay between sends, `None` when no pacing is configured
    #[must_use]
    pub const fn throttle_interval(&self) -> Option<Duration> {
        if self.throttle_interval_micros == 0 {
            None
        } else {
            Some(Duration::from_micros(self.throttle_interval_micros))
        }
    }

    /// How long to keep the worker slot after sending
    #[must_use]
    pub const fn lock_hold(&self) -> Option<Duration> {
        if self.lock_hold_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.lock_hold_secs))
        }
    }

    /// Settings recorded on a campaign when it is scheduled
    #[must_use]
    pub const fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            environment: self.environment,
            batch_limit: self.batch_limit,
            max_active_workers: self.max_active_workers,
            throttle_interval_micros: self.throttle_interval_micros,
        }
    }
}

/// Copy of the settings in force when a campaign was scheduled
///
/// Informational only: dispatch always uses the live settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub environment: Environment,
    pub batch_limit: usize,
    pub max_active_workers: usize,
    pub throttle_interval_micros: u64,
}
