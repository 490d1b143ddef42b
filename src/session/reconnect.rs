//! Auto-reconnect backoff.

use rand::Rng;
use std::time::Duration;
use wagate_core::config::ReconnectConfig;

/// Exponential backoff with symmetric jitter and a failure budget.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Fraction of the delay added or removed at random, 0.0..=1.0.
    pub jitter: f64,
    /// Consecutive failed attempts before the session enters `error`.
    pub max_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            initial: Duration::from_millis(cfg.initial_delay_ms),
            max: Duration::from_millis(cfg.max_delay_ms.max(cfg.initial_delay_ms)),
            jitter: cfg.jitter.clamp(0.0, 1.0),
            max_failures: cfg.max_failures.max(1),
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay before reconnect attempt `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let secs = self.initial.as_secs_f64() * 2f64.powi(exp);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Delay before reconnect attempt `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        if self.jitter <= 0.0 || base <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let range = base * self.jitter;
        let offset = rand::thread_rng().gen_range(-range..=range);
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    /// Whether `failures` consecutive failures exhaust the budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_failures
    }
}
