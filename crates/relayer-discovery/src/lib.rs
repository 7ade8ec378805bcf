//! Event subscription for the settlement relayer.
//!
//! [`LogSubscriber`] polls one contract for one event signature and turns
//! every matching log into an [`OrderEvent`]. It keeps a `(block, log_index)`
//! cursor so that a failed poll resumes exactly where the last one stopped.
//! The cursor is written to storage after every scanned range, so a restart
//! picks up the logs emitted while the relayer was down: logs may be
//! delivered twice across restarts but are never skipped.

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use relayer_chain::{ChainService, LogQuery, B256};
use relayer_config::{SourceConfig, StartBlock};
use relayer_storage::{StorageError, StorageService};
use relayer_types::OrderEvent;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

mod decode;

pub use decode::{decode_log, event_topic};

#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("Connection error: {0}")]
	Connection(String),
	#[error("Decode error: {0}")]
	Decode(String),
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
	#[error("Already monitoring")]
	AlreadyMonitoring,
	#[error("Event receiver dropped")]
	ChannelClosed,
}

/// Storage namespace holding the scan position per contract and event.
pub const CURSOR_NAMESPACE: &str = "cursor";

/// Upper bound between reconnect attempts.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Progress through the log stream.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ScanState {
	/// First block not yet fully scanned; `None` until the first poll.
	next_block: Option<u64>,
	/// Position of the last delivered log.
	cursor: Option<(u64, u64)>,
}

struct Scanner {
	chain: ChainService,
	config: SourceConfig,
	topic0: B256,
	storage: Arc<StorageService>,
	state: Mutex<ScanState>,
}

impl Scanner {
	fn cursor_key(&self) -> String {
		format!("{}-{}", self.config.address, self.topic0)
	}

	/// Stored position from an earlier run, if any.
	async fn load(&self) -> Result<Option<ScanState>, DiscoveryError> {
		match self
			.storage
			.retrieve(CURSOR_NAMESPACE, &self.cursor_key())
			.await
		{
			Ok(state) => Ok(Some(state)),
			Err(StorageError::NotFound) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	async fn save(&self, state: &ScanState) {
		if let Err(e) = self
			.storage
			.store(CURSOR_NAMESPACE, &self.cursor_key(), state)
			.await
		{
			warn!(error = %e, "Failed to persist scan cursor");
		}
	}

	/// Scans every block up to the confirmed head and forwards new events.
	///
	/// Progress made before an error is kept, so the next call resumes from
	/// the first unscanned range.
	async fn poll(&self, sender: &mpsc::UnboundedSender<OrderEvent>) -> Result<usize, DiscoveryError> {
		let head = self
			.chain
			.block_number()
			.await
			.map_err(|e| DiscoveryError::Connection(e.to_string()))?;
		let safe_head = head.saturating_sub(self.config.confirmations);

		let start = match self.config.start_block {
			StartBlock::Latest => safe_head + 1,
			StartBlock::Number(n) => n,
		};
		let mut state = self.state.lock().await;
		if state.next_block.is_none() {
			match self.load().await? {
				Some(stored) => {
					info!(next_block = ?stored.next_block, "Resuming log scan from stored cursor");
					*state = stored;
				}
				None => {
					state.next_block = Some(start);
					self.save(&state).await;
				}
			}
		}
		let mut from_block = state.next_block.unwrap_or(start);
		let mut delivered = 0;

		while from_block <= safe_head {
			let to_block = safe_head.min(from_block + self.config.max_block_range - 1);
			let query = LogQuery {
				address: self.config.address,
				event_signature: self.topic0,
				from_block,
				to_block,
			};

			let logs = self
				.chain
				.get_logs(&query)
				.await
				.map_err(|e| DiscoveryError::Connection(e.to_string()))?;

			let mut events = Vec::with_capacity(logs.len());
			for log in logs {
				match decode_log(log, self.config.correlation_id) {
					Ok(event) => events.push(event),
					Err(e) => warn!(from_block, to_block, error = %e, "Skipping undecodable log"),
				}
			}
			events.sort_by_key(OrderEvent::position);

			for event in events {
				if state.cursor.is_some_and(|cursor| event.position() <= cursor) {
					continue;
				}
				let position = event.position();
				sender
					.send(event)
					.map_err(|_| DiscoveryError::ChannelClosed)?;
				state.cursor = Some(position);
				delivered += 1;
			}

			debug!(from_block, to_block, "Scanned block range");
			from_block = to_block + 1;
			state.next_block = Some(from_block);
			self.save(&state).await;
		}

		Ok(delivered)
	}
}

/// Polling subscriber for the configured contract event.
pub struct LogSubscriber {
	scanner: Arc<Scanner>,
	is_monitoring: Arc<AtomicBool>,
	stop_signal: Mutex<Option<mpsc::Sender<()>>>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl LogSubscriber {
	/// `storage` keeps the scan position across restarts; a stored position
	/// takes precedence over the configured start block.
	pub fn new(chain: ChainService, config: SourceConfig, storage: Arc<StorageService>) -> Self {
		let topic0 = event_topic(&config.event_signature);
		Self {
			scanner: Arc::new(Scanner {
				chain,
				config,
				topic0,
				storage,
				state: Mutex::new(ScanState::default()),
			}),
			is_monitoring: Arc::new(AtomicBool::new(false)),
			stop_signal: Mutex::new(None),
			task: Mutex::new(None),
		}
	}

	/// Starts polling in the background and forwards events to `sender`.
	///
	/// Restarting after [`stop_monitoring`](Self::stop_monitoring) resumes
	/// from the last delivered position.
	pub async fn start_monitoring(
		&self,
		sender: mpsc::UnboundedSender<OrderEvent>,
	) -> Result<(), DiscoveryError> {
		if self.is_monitoring.swap(true, Ordering::SeqCst) {
			return Err(DiscoveryError::AlreadyMonitoring);
		}

		let (stop_tx, stop_rx) = mpsc::channel(1);
		*self.stop_signal.lock().await = Some(stop_tx);

		let scanner = self.scanner.clone();
		let is_monitoring = self.is_monitoring.clone();
		let handle = tokio::spawn(async move {
			monitoring_loop(scanner, sender, stop_rx).await;
			is_monitoring.store(false, Ordering::SeqCst);
		});
		*self.task.lock().await = Some(handle);

		info!(
			address = %self.scanner.config.address,
			event = %self.scanner.config.event_signature,
			"Started event subscription"
		);
		Ok(())
	}

	/// Convenience wrapper returning the event sequence as a stream.
	pub async fn stream(&self) -> Result<UnboundedReceiverStream<OrderEvent>, DiscoveryError> {
		let (sender, receiver) = mpsc::unbounded_channel();
		self.start_monitoring(sender).await?;
		Ok(UnboundedReceiverStream::new(receiver))
	}

	/// Stops polling and waits for the background task to finish.
	pub async fn stop_monitoring(&self) -> Result<(), DiscoveryError> {
		if let Some(stop_tx) = self.stop_signal.lock().await.take() {
			let _ = stop_tx.send(()).await;
		}
		if let Some(handle) = self.task.lock().await.take() {
			let _ = handle.await;
		}
		self.is_monitoring.store(false, Ordering::SeqCst);
		Ok(())
	}
}

fn reconnect_backoff(initial: Duration) -> ExponentialBackoff {
	ExponentialBackoffBuilder::new()
		.with_initial_interval(initial)
		.with_multiplier(2.0)
		.with_randomization_factor(0.2)
		.with_max_interval(MAX_RECONNECT_DELAY)
		.with_max_elapsed_time(None)
		.build()
}

async fn monitoring_loop(
	scanner: Arc<Scanner>,
	sender: mpsc::UnboundedSender<OrderEvent>,
	mut stop_rx: mpsc::Receiver<()>,
) {
	let poll_interval = scanner.config.poll_interval();
	let mut backoff = reconnect_backoff(poll_interval);
	let mut delay = Duration::ZERO;

	loop {
		tokio::select! {
			_ = tokio::time::sleep(delay) => {}
			_ = stop_rx.recv() => break,
		}

		match scanner.poll(&sender).await {
			Ok(delivered) => {
				if delivered > 0 {
					debug!(delivered, "Delivered order events");
				}
				backoff.reset();
				delay = poll_interval;
			}
			Err(DiscoveryError::ChannelClosed) => {
				info!("Event receiver dropped, stopping subscription");
				break;
			}
			Err(e) => {
				delay = backoff.next_backoff().unwrap_or(MAX_RECONNECT_DELAY);
				warn!(error = %e, retry_in = ?delay, "Log polling failed, retrying");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use alloy::primitives::U256;
	use async_trait::async_trait;
	use relayer_chain::{Address, ChainError, ChainInterface};
	use relayer_config::CorrelationIdLocation;
	use relayer_storage::implementations::memory;
	use relayer_types::{
		ConfigSchema, CorrelationId, RawLog, TransactionHash, TransactionReceipt, ValidationError,
	};
	use std::sync::atomic::AtomicU64;
	use std::sync::Mutex as StdMutex;
	use tokio_stream::StreamExt;

	const SIGNATURE: &str = "OrderFulfilled(uint256,address)";

	struct NoSchema;

	impl ConfigSchema for NoSchema {
		fn validate(&self, _config: &toml::Value) -> Result<(), ValidationError> {
			Ok(())
		}
	}

	/// Node with a fixed set of logs and a programmable failure budget.
	#[derive(Default)]
	struct LogNode {
		head: AtomicU64,
		logs: StdMutex<Vec<RawLog>>,
		failures_left: AtomicU64,
		queries: StdMutex<Vec<(u64, u64)>>,
	}

	impl LogNode {
		fn push(&self, block: u64, index: u64, id: u64) {
			self.logs.lock().unwrap().push(RawLog {
				topics: vec![event_topic(SIGNATURE), B256::from(U256::from(id))],
				data: vec![],
				block_number: Some(block),
				log_index: Some(index),
				transaction_hash: None,
			});
		}
	}

	#[async_trait]
	impl ChainInterface for LogNode {
		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			Box::new(NoSchema)
		}
		async fn block_number(&self) -> Result<u64, ChainError> {
			Ok(self.head.load(Ordering::SeqCst))
		}
		async fn get_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, ChainError> {
			if self.failures_left.load(Ordering::SeqCst) > 0 {
				self.failures_left.fetch_sub(1, Ordering::SeqCst);
				return Err(ChainError::Network("connection refused".into()));
			}
			self.queries
				.lock()
				.unwrap()
				.push((query.from_block, query.to_block));
			Ok(self
				.logs
				.lock()
				.unwrap()
				.iter()
				.filter(|log| {
					let block = log.block_number.unwrap_or_default();
					block >= query.from_block && block <= query.to_block
				})
				.cloned()
				.collect())
		}
		async fn check_ready(&self, _id: CorrelationId) -> Result<bool, ChainError> {
			unreachable!()
		}
		async fn simulate_finalize(&self, _id: CorrelationId) -> Result<(), ChainError> {
			unreachable!()
		}
		async fn send_finalize(&self, _id: CorrelationId) -> Result<TransactionHash, ChainError> {
			unreachable!()
		}
		async fn get_receipt(
			&self,
			_hash: &TransactionHash,
		) -> Result<Option<TransactionReceipt>, ChainError> {
			unreachable!()
		}
	}

	fn source(start_block: StartBlock, confirmations: u64, max_block_range: u64) -> SourceConfig {
		SourceConfig {
			address: Address::repeat_byte(0x11),
			event_signature: SIGNATURE.to_string(),
			start_block,
			poll_interval_secs: 1,
			confirmations,
			max_block_range,
			correlation_id: CorrelationIdLocation::Topic(1),
		}
	}

	fn storage() -> Arc<StorageService> {
		Arc::new(StorageService::new(memory::create_storage(
			&toml::Value::Table(Default::default()),
		)))
	}

	fn subscriber_with(
		node: Arc<LogNode>,
		config: SourceConfig,
		storage: Arc<StorageService>,
	) -> LogSubscriber {
		LogSubscriber::new(ChainService::new(node, Duration::from_secs(5)), config, storage)
	}

	fn subscriber(node: Arc<LogNode>, config: SourceConfig) -> LogSubscriber {
		subscriber_with(node, config, storage())
	}

	fn drain(receiver: &mut mpsc::UnboundedReceiver<OrderEvent>) -> Vec<u64> {
		let mut ids = Vec::new();
		while let Ok(event) = receiver.try_recv() {
			ids.push(event.correlation_id.as_u256().to::<u64>());
		}
		ids
	}

	#[tokio::test]
	async fn test_scans_in_bounded_ranges_and_orders_events() {
		let node = Arc::new(LogNode::default());
		node.head.store(25, Ordering::SeqCst);
		node.push(12, 1, 3);
		node.push(12, 0, 2);
		node.push(7, 4, 1);
		node.push(25, 0, 4);

		let subscriber = subscriber(node.clone(), source(StartBlock::Number(5), 0, 10));
		let (tx, mut rx) = mpsc::unbounded_channel();

		assert_eq!(subscriber.scanner.poll(&tx).await.unwrap(), 4);
		assert_eq!(drain(&mut rx), vec![1, 2, 3, 4]);
		assert_eq!(
			*node.queries.lock().unwrap(),
			vec![(5, 14), (15, 24), (25, 25)]
		);

		// Nothing new: no ranges to scan, nothing re-emitted
		assert_eq!(subscriber.scanner.poll(&tx).await.unwrap(), 0);
		assert_eq!(node.queries.lock().unwrap().len(), 3);
	}

	#[tokio::test]
	async fn test_confirmations_lag_behind_head() {
		let node = Arc::new(LogNode::default());
		node.head.store(20, Ordering::SeqCst);
		node.push(15, 0, 1);
		node.push(16, 0, 2);

		let subscriber = subscriber(node.clone(), source(StartBlock::Number(10), 5, 100));
		let (tx, mut rx) = mpsc::unbounded_channel();

		subscriber.scanner.poll(&tx).await.unwrap();
		assert_eq!(drain(&mut rx), vec![1]);

		node.head.store(21, Ordering::SeqCst);
		subscriber.scanner.poll(&tx).await.unwrap();
		assert_eq!(drain(&mut rx), vec![2]);
	}

	#[tokio::test]
	async fn test_latest_start_ignores_history() {
		let node = Arc::new(LogNode::default());
		node.head.store(50, Ordering::SeqCst);
		node.push(50, 0, 1);

		let subscriber = subscriber(node.clone(), source(StartBlock::Latest, 0, 100));
		let (tx, mut rx) = mpsc::unbounded_channel();

		subscriber.scanner.poll(&tx).await.unwrap();
		assert!(drain(&mut rx).is_empty());

		node.push(51, 0, 2);
		node.head.store(51, Ordering::SeqCst);
		subscriber.scanner.poll(&tx).await.unwrap();
		assert_eq!(drain(&mut rx), vec![2]);
	}

	#[tokio::test]
	async fn test_restart_resumes_from_stored_cursor() {
		let node = Arc::new(LogNode::default());
		let storage = storage();
		node.head.store(10, Ordering::SeqCst);
		node.push(8, 0, 1);
		let (tx, mut rx) = mpsc::unbounded_channel();

		let first = subscriber_with(node.clone(), source(StartBlock::Latest, 0, 100), storage.clone());
		first.scanner.poll(&tx).await.unwrap();
		assert!(drain(&mut rx).is_empty());

		node.push(11, 0, 2);
		node.head.store(11, Ordering::SeqCst);
		first.scanner.poll(&tx).await.unwrap();
		assert_eq!(drain(&mut rx), vec![2]);
		drop(first);

		// Emitted while the relayer was down
		node.push(12, 0, 3);
		node.push(14, 1, 4);
		node.head.store(15, Ordering::SeqCst);

		let second = subscriber_with(node.clone(), source(StartBlock::Latest, 0, 100), storage.clone());
		second.scanner.poll(&tx).await.unwrap();
		assert_eq!(drain(&mut rx), vec![3, 4]);

		let stored: ScanState = storage
			.retrieve(CURSOR_NAMESPACE, &second.scanner.cursor_key())
			.await
			.unwrap();
		assert_eq!(
			stored,
			ScanState {
				next_block: Some(16),
				cursor: Some((14, 1)),
			}
		);
	}

	#[tokio::test]
	async fn test_undecodable_log_is_skipped() {
		let node = Arc::new(LogNode::default());
		node.head.store(3, Ordering::SeqCst);
		node.push(1, 0, 1);
		node.logs.lock().unwrap().push(RawLog {
			topics: vec![event_topic(SIGNATURE)],
			data: vec![],
			block_number: Some(2),
			log_index: Some(0),
			transaction_hash: None,
		});
		node.push(3, 0, 3);

		let subscriber = subscriber(node, source(StartBlock::Number(0), 0, 100));
		let (tx, mut rx) = mpsc::unbounded_channel();
		subscriber.scanner.poll(&tx).await.unwrap();
		assert_eq!(drain(&mut rx), vec![1, 3]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_monitoring_survives_connection_failures() {
		let node = Arc::new(LogNode::default());
		node.head.store(10, Ordering::SeqCst);
		node.push(4, 0, 1);
		node.push(9, 0, 2);
		node.failures_left.store(3, Ordering::SeqCst);

		let subscriber = subscriber(node.clone(), source(StartBlock::Number(0), 0, 5));
		let mut stream = subscriber.stream().await.unwrap();
		assert!(matches!(
			subscriber.start_monitoring(mpsc::unbounded_channel().0).await,
			Err(DiscoveryError::AlreadyMonitoring)
		));

		let first = tokio::time::timeout(Duration::from_secs(120), stream.next())
			.await
			.unwrap()
			.unwrap();
		let second = tokio::time::timeout(Duration::from_secs(120), stream.next())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(first.correlation_id, CorrelationId::from(1));
		assert_eq!(second.correlation_id, CorrelationId::from(2));

		subscriber.stop_monitoring().await.unwrap();
		assert!(!subscriber.is_monitoring.load(Ordering::SeqCst));
	}
}
