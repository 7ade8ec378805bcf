//! Readiness queries against the settlement contract.

use relayer_chain::{ChainError, ChainService};
use relayer_types::CorrelationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
	Ready,
	NotReady,
}

/// Asks the settlement contract whether every leg of an order is complete.
///
/// A not-ready answer is a normal outcome, not an error. Errors keep the
/// chain classification: transport problems are retryable, a reverting
/// read call is not.
pub struct ReadinessChecker {
	chain: ChainService,
}

impl ReadinessChecker {
	pub fn new(chain: ChainService) -> Self {
		Self { chain }
	}

	pub async fn check(&self, id: CorrelationId) -> Result<Readiness, ChainError> {
		let ready = self.chain.check_ready(id).await?;
		tracing::debug!(correlation_id = %id, ready, "Readiness query answered");
		Ok(if ready {
			Readiness::Ready
		} else {
			Readiness::NotReady
		})
	}
}
