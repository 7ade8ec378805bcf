//! Finalize transaction submission.

use crate::retry::{RetryCoordinator, RetryError};
use relayer_chain::{ChainError, ChainService};
use relayer_config::SubmissionConfig;
use relayer_types::{CorrelationId, TransactionHash};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
	/// Our finalize transaction was mined successfully.
	Completed(TransactionHash),
	/// Someone else finalized the order first.
	AlreadyDone,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
	#[error(transparent)]
	Failed(#[from] RetryError),
	#[error("finalize transaction {0} reverted on-chain")]
	Reverted(TransactionHash),
	#[error("no receipt for finalize transaction {0}")]
	ReceiptTimeout(TransactionHash),
}

enum Dispatch {
	AlreadyDone,
	Sent(TransactionHash),
}

/// Simulates, sends and confirms the finalize call for one order.
pub struct CompletionSubmitter {
	chain: ChainService,
	retry: Arc<RetryCoordinator>,
	already_done_markers: Vec<String>,
	receipt_timeout: Duration,
	receipt_poll_interval: Duration,
}

impl CompletionSubmitter {
	pub fn new(chain: ChainService, retry: Arc<RetryCoordinator>, config: &SubmissionConfig) -> Self {
		Self {
			chain,
			retry,
			already_done_markers: config
				.already_done_markers
				.iter()
				.map(|marker| marker.to_lowercase())
				.collect(),
			receipt_timeout: config.receipt_timeout(),
			receipt_poll_interval: config.receipt_poll_interval(),
		}
	}

	/// Whether a revert reason says the order is finalized already.
	pub fn is_already_done(&self, reason: &str) -> bool {
		let reason = reason.to_lowercase();
		self.already_done_markers
			.iter()
			.any(|marker| reason.contains(marker.as_str()))
	}

	async fn dispatch(&self, id: CorrelationId) -> Result<Dispatch, ChainError> {
		// Gas estimation during send re-executes the call, so a race lost
		// after a clean simulation still surfaces as a revert here.
		let sent = match self.chain.simulate_finalize(id).await {
			Ok(()) => self.chain.send_finalize(id).await,
			Err(e) => Err(e),
		};

		match sent {
			Ok(hash) => Ok(Dispatch::Sent(hash)),
			Err(ChainError::Revert(reason)) if self.is_already_done(&reason) => {
				info!(correlation_id = %id, reason = %reason, "Order already finalized");
				Ok(Dispatch::AlreadyDone)
			}
			Err(e) => Err(e),
		}
	}

	/// Finalizes `id`, calling `on_sent` with the transaction hash before the
	/// receipt is awaited.
	///
	/// `pending` is a transaction sent by an earlier run. It is awaited first
	/// and a new one is only sent once the node has forgotten it. Transient
	/// failures before a transaction is out are retried against `attempts`.
	/// Once it is out the outcome is only classified: a missing receipt is
	/// reported as [`SubmitError::ReceiptTimeout`] since the transaction may
	/// still be mined.
	pub async fn submit<F, Fut>(
		&self,
		id: CorrelationId,
		pending: Option<TransactionHash>,
		attempts: &mut u32,
		on_sent: F,
	) -> Result<SubmitOutcome, SubmitError>
	where
		F: FnOnce(TransactionHash) -> Fut,
		Fut: Future<Output = ()>,
	{
		if let Some(hash) = pending {
			let outcome = self.confirm(id, hash.clone()).await;
			let unconfirmed = matches!(outcome, Err(SubmitError::ReceiptTimeout(_)));
			if !unconfirmed || !self.is_dropped(&hash).await {
				return outcome;
			}
			warn!(correlation_id = %id, tx_hash = %hash, "Earlier finalize transaction dropped, resubmitting");
		}

		let hash = match self
			.retry
			.run(id, "submit", attempts, || self.dispatch(id))
			.await?
		{
			Dispatch::AlreadyDone => return Ok(SubmitOutcome::AlreadyDone),
			Dispatch::Sent(hash) => hash,
		};

		on_sent(hash.clone()).await;
		self.confirm(id, hash).await
	}

	async fn confirm(
		&self,
		id: CorrelationId,
		hash: TransactionHash,
	) -> Result<SubmitOutcome, SubmitError> {
		match self
			.chain
			.wait_for_receipt(&hash, self.receipt_timeout, self.receipt_poll_interval)
			.await
		{
			Ok(receipt) if receipt.success => Ok(SubmitOutcome::Completed(hash)),
			Ok(_) => Err(SubmitError::Reverted(hash)),
			Err(e) => {
				warn!(correlation_id = %id, tx_hash = %hash, error = %e, "Finalize transaction unconfirmed");
				Err(SubmitError::ReceiptTimeout(hash))
			}
		}
	}

	/// Only a definite "unknown" from the node counts; lookup errors keep
	/// the transaction pending.
	async fn is_dropped(&self, hash: &TransactionHash) -> bool {
		matches!(self.chain.transaction_known(hash).await, Ok(false))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mock::{MockChain, Script};
	use relayer_config::RetryConfig;
	use std::sync::Mutex;

	fn submitter(chain: &Arc<MockChain>) -> CompletionSubmitter {
		CompletionSubmitter::new(
			chain.service(),
			Arc::new(RetryCoordinator::new(RetryConfig::default())),
			&SubmissionConfig::default(),
		)
	}

	#[test]
	fn test_marker_matching_is_case_insensitive() {
		let chain = MockChain::new();
		let submitter = submitter(&chain);
		assert!(submitter.is_already_done("execution reverted: Request Already Processed"));
		assert!(!submitter.is_already_done("execution reverted: legs incomplete"));
		assert!(!submitter.is_already_done("execution reverted: request not processed yet"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_completed_records_hash_before_receipt() {
		let chain = MockChain::new();
		let submitter = submitter(&chain);
		let recorded = Arc::new(Mutex::new(None));
		let mut attempts = 0;

		let outcome = submitter
			.submit(CorrelationId::from(1), None, &mut attempts, |hash| {
				let recorded = recorded.clone();
				async move {
					*recorded.lock().unwrap() = Some(hash);
				}
			})
			.await
			.unwrap();

		let recorded = recorded.lock().unwrap().clone().unwrap();
		assert_eq!(outcome, SubmitOutcome::Completed(recorded));
		assert_eq!(chain.sends(1), 1);
		assert_eq!(attempts, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_already_finalized_is_not_an_error() {
		let chain = MockChain::new();
		chain.finalize(2);
		let mut attempts = 0;

		let outcome = submitter(&chain)
			.submit(CorrelationId::from(2), None, &mut attempts, |_| async {})
			.await;

		assert_eq!(outcome, Ok(SubmitOutcome::AlreadyDone));
		assert_eq!(chain.sends(2), 0);
		assert_eq!(attempts, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_other_simulation_revert_is_permanent() {
		let chain = MockChain::new();
		chain.script(
			3,
			Script {
				simulate_error: Some(ChainError::Revert("execution reverted: legs incomplete".into())),
				..Script::default()
			},
		);
		let mut attempts = 0;

		let outcome = submitter(&chain)
			.submit(CorrelationId::from(3), None, &mut attempts, |_| async {})
			.await;

		assert!(matches!(
			outcome,
			Err(SubmitError::Failed(RetryError::Permanent(ChainError::Revert(_))))
		));
		assert_eq!(chain.sends(3), 0);
		assert_eq!(attempts, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_receipt_outcomes() {
		let chain = MockChain::new();
		chain.script(
			4,
			Script {
				receipt_reverts: 1,
				..Script::default()
			},
		);
		let submitter = submitter(&chain);
		let mut attempts = 0;

		assert!(matches!(
			submitter
				.submit(CorrelationId::from(4), None, &mut attempts, |_| async {})
				.await,
			Err(SubmitError::Reverted(_))
		));

		chain.set_mining(false);
		assert!(matches!(
			submitter
				.submit(CorrelationId::from(5), None, &mut attempts, |_| async {})
				.await,
			Err(SubmitError::ReceiptTimeout(_))
		));
	}

	#[tokio::test(start_paused = true)]
	async fn test_pending_transaction_is_awaited_not_resent() {
		let chain = MockChain::new();
		chain.set_mining(false);
		let submitter = submitter(&chain);
		let id = CorrelationId::from(7);
		let mut attempts = 0;

		let Err(SubmitError::ReceiptTimeout(hash)) =
			submitter.submit(id, None, &mut attempts, |_| async {}).await
		else {
			panic!("expected the first transaction to stay pending");
		};

		// Still in the mempool: wait again instead of sending a second one
		assert_eq!(
			submitter
				.submit(id, Some(hash.clone()), &mut attempts, |_| async {})
				.await,
			Err(SubmitError::ReceiptTimeout(hash.clone()))
		);
		assert_eq!(chain.sends(7), 1);

		chain.set_mining(true);
		assert_eq!(
			submitter
				.submit(id, Some(hash.clone()), &mut attempts, |_| async {})
				.await,
			Ok(SubmitOutcome::Completed(hash))
		);
		assert_eq!(chain.sends(7), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_dropped_transaction_is_resent() {
		let chain = MockChain::new();
		chain.set_mining(false);
		let submitter = submitter(&chain);
		let id = CorrelationId::from(8);
		let mut attempts = 0;

		let Err(SubmitError::ReceiptTimeout(dropped)) =
			submitter.submit(id, None, &mut attempts, |_| async {}).await
		else {
			panic!("expected the first transaction to stay pending");
		};
		chain.drop_pending();
		chain.set_mining(true);

		let outcome = submitter
			.submit(id, Some(dropped.clone()), &mut attempts, |_| async {})
			.await
			.unwrap();
		assert!(matches!(outcome, SubmitOutcome::Completed(ref hash) if *hash != dropped));
		assert_eq!(chain.sends(8), 2);
	}
}
