//! Delay schedule between failed dial attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::RtmConfig;

/// Exponential backoff capped at `ceiling`, with up to `jitter` of each
/// delay shaved off at random so clients that lost the same server do not
/// redial in lockstep.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    ceiling: Duration,
    factor: f64,
    jitter: f64,
}

impl Backoff {
    pub(crate) fn from_config(config: &RtmConfig) -> Self {
        Self {
            initial: config.reconnect_initial_delay,
            ceiling: config.reconnect_max_delay,
            factor: config.reconnect_backoff_factor,
            jitter: config.reconnect_jitter,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let problem = if self.initial.is_zero() || self.ceiling.is_zero() {
            "Reconnect delays must be > 0"
        } else if self.ceiling < self.initial {
            "Max reconnect delay must be >= initial reconnect delay"
        } else if !(self.factor.is_finite() && self.factor >= 1.0) {
            "Backoff factor must be >= 1.0"
        } else if !(0.0..=1.0).contains(&self.jitter) {
            "Jitter must be between 0.0 and 1.0"
        } else {
            return Ok(());
        };
        Err(problem.to_string())
    }

    /// Delay to wait after the failed attempt number `attempt` (zero-based).
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nominal = (self.initial.as_secs_f64() * self.factor.powi(exponent))
            .min(self.ceiling.as_secs_f64());
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(nominal);
        }
        let cut = rand::rng().random_range(0.0..=self.jitter);
        Duration::from_secs_f64(nominal * (1.0 - cut))
    }
}
