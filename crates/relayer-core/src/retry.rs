//! Bounded retry with exponential backoff.

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use relayer_chain::ChainError;
use relayer_config::RetryConfig;
use relayer_types::CorrelationId;
use std::future::Future;
use thiserror::Error;
use tracing::warn;

/// Why a retried operation gave up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
	#[error("permanent failure: {0}")]
	Permanent(ChainError),
	#[error("retry budget exhausted: {0}")]
	Exhausted(ChainError),
}

impl RetryError {
	pub fn into_inner(self) -> ChainError {
		match self {
			RetryError::Permanent(e) | RetryError::Exhausted(e) => e,
		}
	}
}

/// Retries transient chain failures against a per-id attempt budget.
///
/// Every failure, transient or not, consumes one attempt. Delays grow by
/// `multiplier` with up to `jitter` randomization in either direction and are
/// capped at `max_delay`.
pub struct RetryCoordinator {
	policy: RetryConfig,
}

impl RetryCoordinator {
	pub fn new(policy: RetryConfig) -> Self {
		Self { policy }
	}

	pub fn max_attempts(&self) -> u32 {
		self.policy.max_attempts
	}

	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(self.policy.base_delay())
			.with_multiplier(self.policy.multiplier)
			.with_randomization_factor(self.policy.jitter)
			.with_max_interval(self.policy.max_delay())
			.with_max_elapsed_time(None)
			.build()
	}

	/// Runs `op` until it succeeds, fails permanently or the budget runs out.
	///
	/// `attempts` is the id's consumed budget and is incremented in place.
	pub async fn run<T, F, Fut>(
		&self,
		id: CorrelationId,
		operation: &'static str,
		attempts: &mut u32,
		mut op: F,
	) -> Result<T, RetryError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, ChainError>>,
	{
		let mut backoff = self.backoff();

		loop {
			let error = match op().await {
				Ok(value) => return Ok(value),
				Err(e) => e,
			};
			*attempts += 1;

			if !error.is_retryable() {
				return Err(RetryError::Permanent(error));
			}
			if *attempts >= self.policy.max_attempts {
				return Err(RetryError::Exhausted(error));
			}

			let delay = backoff
				.next_backoff()
				.unwrap_or_else(|| self.policy.max_delay());
			warn!(
				correlation_id = %id,
				operation,
				attempt = *attempts,
				max_attempts = self.policy.max_attempts,
				retry_in = ?delay,
				error = %error,
				"Transient failure, retrying"
			);
			tokio::time::sleep(delay).await;
		}
	}
}
