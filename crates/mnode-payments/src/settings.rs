//! Charge timing and pricing configuration

use crate::balance_tracker::PerTimeAmountCalculator;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rejected payment configuration
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("charge period must be greater than zero")]
    ZeroChargePeriod,

    #[error("promise wait timeout must be greater than zero")]
    ZeroWaitTimeout,

    #[error("promise wait timeout ({timeout:?}) exceeds the charge period ({period:?})")]
    WaitTimeoutTooLong { timeout: Duration, period: Duration },
}

/// Timing of the provider charge cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeSettings {
    /// Time between two balance messages
    pub charge_period: Duration,
    /// How long a balance message waits for its promise
    pub promise_wait_timeout: Duration,
    /// How much missed-promise time is tolerated before giving up
    pub missed_promise_leeway: Duration,
    /// Grace period before the first balance message
    pub first_charge_delay: Duration,
}

impl Default for ChargeSettings {
    fn default() -> Self {
        Self {
            charge_period: Duration::from_secs(60),
            promise_wait_timeout: Duration::from_secs(30),
            missed_promise_leeway: Duration::ZERO,
            first_charge_delay: Duration::from_secs(1),
        }
    }
}

impl ChargeSettings {
    /// Consecutive missed promises that end the session, at least 1
    pub fn max_missed_promises(&self) -> u32 {
        if self.charge_period.is_zero() {
            return 1;
        }
        let ratio = self.missed_promise_leeway.as_secs_f64() / self.charge_period.as_secs_f64();
        // saturating float to int cast
        (ratio.round() as u32).max(1)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.charge_period.is_zero() {
            return Err(SettingsError::ZeroChargePeriod);
        }
        if self.promise_wait_timeout.is_zero() {
            return Err(SettingsError::ZeroWaitTimeout);
        }
        if self.promise_wait_timeout > self.charge_period {
            return Err(SettingsError::WaitTimeoutTooLong {
                timeout: self.promise_wait_timeout,
                period: self.charge_period,
            });
        }
        Ok(())
    }
}

/// `[payments]` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentsConfig {
    pub charge_period_secs: u64,
    pub promise_wait_timeout_secs: u64,
    /// 0 makes the first missed promise fatal
    pub missed_promise_leeway_secs: u64,
    pub price_per_minute: u64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            charge_period_secs: 60,
            promise_wait_timeout_secs: 30,
            missed_promise_leeway_secs: 0,
            price_per_minute: 100,
        }
    }
}

impl PaymentsConfig {
    /// Validated charge cycle timing
    pub fn charge_settings(&self) -> Result<ChargeSettings, SettingsError> {
        let settings = ChargeSettings {
            charge_period: Duration::from_secs(self.charge_period_secs),
            promise_wait_timeout: Duration::from_secs(self.promise_wait_timeout_secs),
            missed_promise_leeway: Duration::from_secs(self.missed_promise_leeway_secs),
            ..ChargeSettings::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Price per minute of service
    pub fn amount_calculator(&self) -> PerTimeAmountCalculator {
        PerTimeAmountCalculator::new(self.price_per_minute, Duration::from_secs(60))
    }
}
