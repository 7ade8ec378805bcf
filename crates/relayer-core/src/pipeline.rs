//! Per-id processing: readiness check, submission and the state transitions
//! between them.

use crate::checker::{Readiness, ReadinessChecker};
use crate::correlator::{Correlator, Phase};
use crate::retry::RetryCoordinator;
use crate::submitter::{CompletionSubmitter, SubmitError, SubmitOutcome};
use relayer_chain::ChainError;
use relayer_storage::StorageService;
use relayer_types::{
	CorrelationId, EventBus, OrderState, OrderStatus, RelayerEvent, TransactionHash,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Storage namespace holding one [`OrderState`] per correlation id.
pub const ORDERS_NAMESPACE: &str = "orders";

pub(crate) struct Pipeline {
	pub(crate) correlator: Correlator,
	checker: ReadinessChecker,
	submitter: CompletionSubmitter,
	retry: Arc<RetryCoordinator>,
	storage: Arc<StorageService>,
	event_bus: EventBus,
	dedup_window: Duration,
}

impl Pipeline {
	pub(crate) fn new(
		checker: ReadinessChecker,
		submitter: CompletionSubmitter,
		retry: Arc<RetryCoordinator>,
		storage: Arc<StorageService>,
		event_bus: EventBus,
		dedup_window: Duration,
	) -> Self {
		Self {
			correlator: Correlator::new(retry.max_attempts()),
			checker,
			submitter,
			retry,
			storage,
			event_bus,
			dedup_window,
		}
	}

	pub(crate) fn publish(&self, event: RelayerEvent) {
		// No subscribers is not an error
		let _ = self.event_bus.publish(event);
	}

	/// Writes `state` through to storage.
	///
	/// Terminal states expire after the dedup window. A failed write is
	/// logged and processing continues; the in-memory state stays
	/// authoritative for this process.
	pub(crate) async fn persist(&self, state: &OrderState) {
		let ttl = state.status.is_terminal().then_some(self.dedup_window);
		if let Err(e) = self
			.storage
			.store_with_ttl(
				ORDERS_NAMESPACE,
				&state.correlation_id.to_string(),
				state,
				ttl,
			)
			.await
		{
			warn!(correlation_id = %state.correlation_id, error = %e, "Failed to persist order state");
		}
	}

	async fn transition<F>(&self, id: CorrelationId, change: F) -> Option<OrderState>
	where
		F: FnOnce(&mut OrderState),
	{
		let state = self.correlator.update(&id, change)?;
		self.persist(&state).await;
		Some(state)
	}

	fn attempts(&self, id: CorrelationId) -> u32 {
		self.correlator
			.get(&id)
			.map(|state| state.attempts)
			.unwrap_or(0)
	}

	/// Drives a claimed id until it rests in a non-in-flight state or is left
	/// `submitting` for reconciliation.
	pub(crate) async fn process(&self, id: CorrelationId, phase: Phase) {
		let mut next = Some(phase);
		while let Some(phase) = next {
			next = match phase {
				Phase::Check => self.check(id).await,
				Phase::Submit => self.submit(id).await,
			};
		}
	}

	async fn check(&self, id: CorrelationId) -> Option<Phase> {
		let mut attempts = self.attempts(id);
		let result = self
			.retry
			.run(id, "check", &mut attempts, || self.checker.check(id))
			.await;

		match result {
			Ok(readiness) => {
				let ready = readiness == Readiness::Ready;
				self.transition(id, |state| {
					state.attempts = attempts;
					state.checks += 1;
					state.transition(if ready {
						OrderStatus::Ready
					} else {
						OrderStatus::Seen
					});
				})
				.await;

				info!(correlation_id = %id, ready, "Check result");
				self.publish(RelayerEvent::CheckResult {
					correlation_id: id,
					ready,
				});
				ready.then_some(Phase::Submit)
			}
			Err(e) => {
				self.fail(id, attempts, e.into_inner()).await;
				None
			}
		}
	}

	async fn submit(&self, id: CorrelationId) -> Option<Phase> {
		let state = self
			.transition(id, |state| state.transition(OrderStatus::Submitting))
			.await;
		let (mut attempts, pending) = state
			.map(|state| (state.attempts, state.tx_hash))
			.unwrap_or_default();
		if let Some(hash) = &pending {
			info!(correlation_id = %id, tx_hash = %hash, "Awaiting earlier finalize transaction");
		}

		let result = self
			.submitter
			.submit(id, pending, &mut attempts, |hash| self.record_sent(id, hash))
			.await;

		match result {
			Ok(SubmitOutcome::Completed(hash)) => {
				self.finish(id, attempts, OrderStatus::Completed, Some(hash))
					.await;
				None
			}
			Ok(SubmitOutcome::AlreadyDone) => {
				self.finish(id, attempts, OrderStatus::AlreadyDone, None)
					.await;
				None
			}
			Err(SubmitError::Reverted(hash)) => {
				attempts += 1;
				let error = ChainError::Revert(format!("finalize transaction {} reverted", hash));
				if attempts >= self.retry.max_attempts() {
					self.transition(id, |state| state.tx_hash = None).await;
					self.fail(id, attempts, error).await;
					return None;
				}

				warn!(correlation_id = %id, tx_hash = %hash, attempts, "Finalize transaction reverted, re-checking");
				self.transition(id, |state| {
					state.attempts = attempts;
					state.tx_hash = None;
					state.last_error = Some(error.to_string());
					state.transition(OrderStatus::Checking);
				})
				.await;
				Some(Phase::Check)
			}
			Err(SubmitError::ReceiptTimeout(hash)) => {
				// The transaction may still land; reconciliation settles it.
				let state = self
					.transition(id, |state| {
						state.attempts = attempts;
						state.last_error = Some(format!("no receipt for {}", hash));
					})
					.await;
				warn!(correlation_id = %id, tx_hash = %hash, "Order left submitting");
				self.publish(RelayerEvent::SubmissionResult {
					correlation_id: id,
					status: state.map_or(OrderStatus::Submitting, |s| s.status),
					tx_hash: Some(hash),
				});
				None
			}
			Err(SubmitError::Failed(e)) => {
				self.fail(id, attempts, e.into_inner()).await;
				None
			}
		}
	}

	async fn record_sent(&self, id: CorrelationId, hash: TransactionHash) {
		let recorded = hash.clone();
		self.transition(id, move |state| state.tx_hash = Some(recorded))
			.await;
		info!(correlation_id = %id, tx_hash = %hash, "Submission sent");
		self.publish(RelayerEvent::SubmissionSent {
			correlation_id: id,
			tx_hash: hash,
		});
	}

	async fn finish(
		&self,
		id: CorrelationId,
		attempts: u32,
		status: OrderStatus,
		hash: Option<TransactionHash>,
	) {
		let state = self
			.transition(id, |state| {
				state.attempts = attempts;
				state.last_error = None;
				if hash.is_some() {
					state.tx_hash = hash;
				}
				state.transition(status);
			})
			.await;
		let tx_hash = state.and_then(|state| state.tx_hash);

		info!(
			correlation_id = %id,
			status = %status,
			tx_hash = ?tx_hash.as_ref().map(|hash| hash.to_string()),
			"Submission result"
		);
		self.publish(RelayerEvent::SubmissionResult {
			correlation_id: id,
			status,
			tx_hash,
		});
	}

	/// Parks `id` as failed until an operator resets it.
	///
	/// The stored attempt count is raised to the budget so that neither a
	/// later event nor a restart resumes an order that failed permanently.
	async fn fail(&self, id: CorrelationId, attempts: u32, error: ChainError) {
		let message = error.to_string();
		let recorded = message.clone();
		let exhausted = attempts.max(self.retry.max_attempts());
		self.transition(id, move |state| {
			state.attempts = exhausted;
			state.last_error = Some(recorded);
			state.transition(OrderStatus::Failed);
		})
		.await;

		error!(
			correlation_id = %id,
			attempts,
			retryable = error.is_retryable(),
			error = %message,
			"Terminal failure"
		);
		self.publish(RelayerEvent::TerminalFailure {
			correlation_id: id,
			attempts,
			error: message,
		});
	}
}
