use std::time::Duration;

use rand::Rng;

/// Default first reconnect delay.
pub const RECONNECT_BASE: Duration = Duration::from_millis(500);

/// Default delay ceiling (before jitter).
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Reconnect backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
	pub base: Duration,
	pub max: Duration,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			base: RECONNECT_BASE,
			max: RECONNECT_MAX,
		}
	}
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)` capped at `max`, then
/// spread by a ±10% jitter window.
pub fn reconnect_delay(attempt: u32, cfg: &BackoffConfig) -> Duration {
	let base_ms = cfg.base.as_millis().min(u64::MAX as u128) as u64;
	let max_ms = cfg.max.as_millis().min(u64::MAX as u128) as u64;
	let pow = 2u64.saturating_pow(attempt.saturating_sub(1).min(16));
	let delay_ms = (base_ms.saturating_mul(pow)).min(max_ms);
	let jitter_window = (delay_ms / 10).max(1);
	let mut rng = rand::rng();
	let jitter_offset = rng.random_range(0..=(jitter_window * 2));
	let final_ms = delay_ms.saturating_sub(jitter_window).saturating_add(jitter_offset);
	Duration::from_millis(final_ms)
}
