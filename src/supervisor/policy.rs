//! Alert threshold policy
//!
//! Pure decisions on whether an event is worth an operator's attention.
//! The 1h cadence is held to looser thresholds than 4h/8h.

use chrono::Duration;

use crate::config::AlertPolicyConfig;
use crate::domain::{BatchResult, Cadence, VerificationResult};

#[derive(Debug, Clone)]
pub struct AlertPolicy {
    config: AlertPolicyConfig,
}

impl AlertPolicy {
    pub fn new(config: AlertPolicyConfig) -> Self {
        Self { config }
    }

    /// (success-rate threshold, problematic-count threshold)
    pub fn thresholds(&self, cadence: Cadence) -> (f64, usize) {
        if cadence.is_high_frequency() {
            (
                self.config.hourly_alert_threshold,
                self.config.hourly_alert_count_threshold,
            )
        } else {
            (
                self.config.default_alert_threshold,
                self.config.default_alert_count_threshold,
            )
        }
    }

    /// Something is problematic and either threshold trips
    pub fn should_alert_verification(&self, result: &VerificationResult) -> bool {
        let problematic = result.problematic_count();
        if problematic == 0 {
            return false;
        }
        let (rate_threshold, count_threshold) = self.thresholds(result.cadence);
        result.success_rate < rate_threshold || problematic > count_threshold
    }

    /// 4h/8h results are always reported; 1h only below the report ratio
    pub fn should_report_cycle(&self, cadence: Cadence, result: &BatchResult) -> bool {
        if !cadence.is_high_frequency() {
            return true;
        }
        (result.success_count() as f64) < self.config.hourly_report_ratio * result.total_count as f64
    }

    /// 1h start notices only go out on every Nth hour
    pub fn should_announce_cycle_start(&self, cadence: Cadence, trigger_hour: u32) -> bool {
        if !cadence.is_high_frequency() {
            return true;
        }
        let every = self.config.hourly_start_every_hours.max(1);
        trigger_hour % every == 0
    }

    /// Minimum spacing of verification infrastructure alerts, if any
    pub fn error_throttle(&self, cadence: Cadence) -> Option<Duration> {
        cadence
            .is_high_frequency()
            .then(|| Duration::hours(self.config.hourly_error_throttle_hours))
    }
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self::new(AlertPolicyConfig::default())
    }
}
