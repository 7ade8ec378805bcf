//! Chain client for the settlement relayer.
//!
//! [`ChainInterface`] is the only way the relayer talks to a node: log
//! retrieval for the subscriber, the settlement contract's readiness query,
//! and simulation, submission and receipt lookup of the finalize call.
//! [`ChainService`] wraps an implementation with call timeouts and receipt
//! polling so that every operation is bounded.

use async_trait::async_trait;
use relayer_types::{ConfigSchema, CorrelationId, RawLog, TransactionHash, TransactionReceipt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub use alloy::primitives::{Address, B256};

pub mod implementations {
	pub mod alloy;
}

/// Errors returned by the chain client.
///
/// The variant carries the retry classification: infrastructure problems
/// are transient, reverts and configuration problems are not.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
	#[error("Network error: {0}")]
	Network(String),
	#[error("Timed out: {0}")]
	Timeout(String),
	#[error("Malformed response: {0}")]
	Decode(String),
	#[error("Execution reverted: {0}")]
	Revert(String),
	#[error("Configuration error: {0}")]
	Config(String),
}

impl ChainError {
	/// Whether retrying the same call may succeed.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			ChainError::Network(_) | ChainError::Timeout(_) | ChainError::Decode(_)
		)
	}
}

/// Log filter for one contract and one event signature over a block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
	pub address: Address,
	pub event_signature: B256,
	pub from_block: u64,
	pub to_block: u64,
}

#[async_trait]
pub trait ChainInterface: Send + Sync {
	/// Returns the configuration schema for this implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Latest block known to the node.
	async fn block_number(&self) -> Result<u64, ChainError>;

	/// Logs matching `query`, in chain order.
	async fn get_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, ChainError>;

	/// Read-only query: are all legs of the order complete?
	async fn check_ready(&self, id: CorrelationId) -> Result<bool, ChainError>;

	/// Dry-runs the finalize call from the relayer account.
	///
	/// Returns `ChainError::Revert` with the node's reason if it would revert.
	async fn simulate_finalize(&self, id: CorrelationId) -> Result<(), ChainError>;

	/// Signs and broadcasts the finalize transaction.
	async fn send_finalize(&self, id: CorrelationId) -> Result<TransactionHash, ChainError>;

	/// Receipt of a mined transaction, `None` while it is pending.
	async fn get_receipt(
		&self,
		hash: &TransactionHash,
	) -> Result<Option<TransactionReceipt>, ChainError>;

	/// Whether the node still knows `hash`, mined or pending.
	///
	/// `false` means the transaction was dropped and it is safe to send
	/// again. Clients that cannot tell report every transaction as known.
	async fn transaction_known(&self, _hash: &TransactionHash) -> Result<bool, ChainError> {
		Ok(true)
	}
}

/// Bounded access to a [`ChainInterface`].
#[derive(Clone)]
pub struct ChainService {
	client: Arc<dyn ChainInterface>,
	call_timeout: Duration,
}

impl ChainService {
	pub fn new(client: Arc<dyn ChainInterface>, call_timeout: Duration) -> Self {
		Self {
			client,
			call_timeout,
		}
	}

	async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, ChainError>
	where
		F: Future<Output = Result<T, ChainError>>,
	{
		tokio::time::timeout(self.call_timeout, call)
			.await
			.map_err(|_| {
				ChainError::Timeout(format!(
					"{} did not complete within {:?}",
					operation, self.call_timeout
				))
			})?
	}

	pub async fn block_number(&self) -> Result<u64, ChainError> {
		self.bounded("block_number", self.client.block_number())
			.await
	}

	pub async fn get_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, ChainError> {
		self.bounded("get_logs", self.client.get_logs(query)).await
	}

	pub async fn check_ready(&self, id: CorrelationId) -> Result<bool, ChainError> {
		self.bounded("check_ready", self.client.check_ready(id))
			.await
	}

	pub async fn simulate_finalize(&self, id: CorrelationId) -> Result<(), ChainError> {
		self.bounded("simulate_finalize", self.client.simulate_finalize(id))
			.await
	}

	pub async fn send_finalize(&self, id: CorrelationId) -> Result<TransactionHash, ChainError> {
		self.bounded("send_finalize", self.client.send_finalize(id))
			.await
	}

	pub async fn transaction_known(&self, hash: &TransactionHash) -> Result<bool, ChainError> {
		self.bounded("transaction_known", self.client.transaction_known(hash))
			.await
	}

	/// Polls for the receipt of `hash` until it is mined or `timeout` elapses.
	///
	/// Transient lookup failures are tolerated until the deadline; the
	/// transaction may well be mined while the node is flaky.
	pub async fn wait_for_receipt(
		&self,
		hash: &TransactionHash,
		timeout: Duration,
		poll_interval: Duration,
	) -> Result<TransactionReceipt, ChainError> {
		let deadline = tokio::time::Instant::now() + timeout;

		loop {
			match self
				.bounded("get_receipt", self.client.get_receipt(hash))
				.await
			{
				Ok(Some(receipt)) => return Ok(receipt),
				Ok(None) => {
					debug!(tx_hash = %hash.truncated(), "Transaction not yet mined");
				}
				Err(e) if e.is_retryable() => {
					debug!(tx_hash = %hash.truncated(), error = %e, "Receipt lookup failed");
				}
				Err(e) => return Err(e),
			}

			if tokio::time::Instant::now() + poll_interval > deadline {
				return Err(ChainError::Timeout(format!(
					"No receipt for {} after {:?}",
					hash, timeout
				)));
			}
			tokio::time::sleep(poll_interval).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use relayer_types::ValidationError;
	use std::sync::Mutex;

	struct ReceiptOnly {
		responses: Mutex<Vec<Result<Option<TransactionReceipt>, ChainError>>>,
	}

	struct NoSchema;

	impl ConfigSchema for NoSchema {
		fn validate(&self, _config: &toml::Value) -> Result<(), ValidationError> {
			Ok(())
		}
	}

	#[async_trait]
	impl ChainInterface for ReceiptOnly {
		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			Box::new(NoSchema)
		}
		async fn block_number(&self) -> Result<u64, ChainError> {
			std::future::pending().await
		}
		async fn get_logs(&self, _query: &LogQuery) -> Result<Vec<RawLog>, ChainError> {
			Ok(vec![])
		}
		async fn check_ready(&self, _id: CorrelationId) -> Result<bool, ChainError> {
			Ok(true)
		}
		async fn simulate_finalize(&self, _id: CorrelationId) -> Result<(), ChainError> {
			Ok(())
		}
		async fn send_finalize(&self, _id: CorrelationId) -> Result<TransactionHash, ChainError> {
			Ok(TransactionHash(vec![1; 32]))
		}
		async fn get_receipt(
			&self,
			_hash: &TransactionHash,
		) -> Result<Option<TransactionReceipt>, ChainError> {
			let mut responses = self.responses.lock().unwrap();
			if responses.is_empty() {
				Ok(None)
			} else {
				responses.remove(0)
			}
		}
	}

	fn service(responses: Vec<Result<Option<TransactionReceipt>, ChainError>>) -> ChainService {
		ChainService::new(
			Arc::new(ReceiptOnly {
				responses: Mutex::new(responses),
			}),
			Duration::from_secs(5),
		)
	}

	fn receipt() -> TransactionReceipt {
		TransactionReceipt {
			hash: TransactionHash(vec![1; 32]),
			block_number: 12,
			success: true,
		}
	}

	#[test]
	fn test_retry_classification() {
		assert!(ChainError::Network("reset".into()).is_retryable());
		assert!(ChainError::Timeout("slow".into()).is_retryable());
		assert!(ChainError::Decode("garbage".into()).is_retryable());
		assert!(!ChainError::Revert("nope".into()).is_retryable());
		assert!(!ChainError::Config("bad".into()).is_retryable());
	}

	#[tokio::test(start_paused = true)]
	async fn test_wait_for_receipt_tolerates_transient_errors() {
		let service = service(vec![
			Ok(None),
			Err(ChainError::Network("connection reset".into())),
			Ok(Some(receipt())),
		]);

		let result = service
			.wait_for_receipt(
				&TransactionHash(vec![1; 32]),
				Duration::from_secs(60),
				Duration::from_secs(1),
			)
			.await;
		assert_eq!(result, Ok(receipt()));
	}

	#[tokio::test(start_paused = true)]
	async fn test_wait_for_receipt_times_out() {
		let service = service(vec![]);
		let result = service
			.wait_for_receipt(
				&TransactionHash(vec![1; 32]),
				Duration::from_secs(10),
				Duration::from_secs(3),
			)
			.await;
		assert!(matches!(result, Err(ChainError::Timeout(_))));
	}

	#[tokio::test(start_paused = true)]
	async fn test_calls_are_bounded() {
		let service = service(vec![]);
		assert!(matches!(
			service.block_number().await,
			Err(ChainError::Timeout(_))
		));
	}

	#[tokio::test]
	async fn test_transactions_are_known_by_default() {
		let known = service(vec![])
			.transaction_known(&TransactionHash(vec![1; 32]))
			.await;
		assert_eq!(known, Ok(true));
	}
}
