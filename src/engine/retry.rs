use rand::Rng;
use std::time::Duration;

use crate::config::RetrySettings;
use crate::model::SyncError;

/// Exponential backoff with a cap and optional jitter, gated by an error
/// code allowlist.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	settings: RetrySettings,
}

impl RetryPolicy {
	pub fn new(settings: RetrySettings) -> Self {
		Self { settings }
	}

	pub fn max_attempts(&self) -> u32 {
		self.settings.max_attempts
	}

	/// Whether this error is eligible for retry at all. Attempt budgeting is
	/// the caller's concern.
	pub fn is_retryable(&self, error: &SyncError) -> bool {
		error.recoverable
			&& self
				.settings
				.retryable_errors
				.iter()
				.any(|code| code == &error.code)
	}

	/// Delay before re-attempting, for a 1-based attempt counter:
	/// `base * multiplier^(attempt-1)`, capped, plus up to 25% jitter.
	pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1);
		let raw = self.settings.base_delay_ms as f64
			* self.settings.backoff_multiplier.powi(exponent as i32);
		let capped = raw.min(self.settings.max_delay_ms as f64) as u64;

		let with_jitter = if self.settings.jitter_enabled && capped > 0 {
			// Jitter spreads retries out to avoid thundering-herd retries
			// against a recovering target.
			let max_jitter = capped / 4;
			capped + rand::thread_rng().gen_range(0..=max_jitter)
		} else {
			capped
		};

		Duration::from_millis(with_jitter)
	}
}

impl From<RetrySettings> for RetryPolicy {
	fn from(settings: RetrySettings) -> Self {
		Self::new(settings)
	}
}
