//! Scriptable in-memory chain used by the relayer-core tests.

use async_trait::async_trait;
use relayer_chain::{ChainError, ChainInterface, ChainService, LogQuery};
use relayer_types::{
	ConfigSchema, CorrelationId, RawLog, TransactionHash, TransactionReceipt, ValidationError,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const ALREADY_PROCESSED: &str = "execution reverted: request already processed";

/// Per-id behaviour of the settlement contract.
#[derive(Clone)]
pub struct Script {
	/// Answers consumed in order before falling back to `check_default`.
	pub checks: VecDeque<Result<bool, ChainError>>,
	pub check_default: Result<bool, ChainError>,
	pub simulate_error: Option<ChainError>,
	/// Mined finalize transactions revert this many times before succeeding.
	pub receipt_reverts: u32,
}

impl Default for Script {
	fn default() -> Self {
		Self {
			checks: VecDeque::new(),
			check_default: Ok(true),
			simulate_error: None,
			receipt_reverts: 0,
		}
	}
}

struct NoSchema;

impl ConfigSchema for NoSchema {
	fn validate(&self, _config: &toml::Value) -> Result<(), ValidationError> {
		Ok(())
	}
}

pub struct MockChain {
	scripts: Mutex<HashMap<CorrelationId, Script>>,
	finalized: Mutex<HashSet<CorrelationId>>,
	/// Known transactions; the contract is finalized once a successful one is mined.
	receipts: Mutex<HashMap<TransactionHash, (CorrelationId, bool)>>,
	sent: Mutex<Vec<CorrelationId>>,
	check_calls: Mutex<Vec<(CorrelationId, Instant)>>,
	check_delay: Mutex<Duration>,
	mining: AtomicBool,
}

impl Default for MockChain {
	fn default() -> Self {
		Self {
			scripts: Mutex::new(HashMap::new()),
			finalized: Mutex::new(HashSet::new()),
			receipts: Mutex::new(HashMap::new()),
			sent: Mutex::new(Vec::new()),
			check_calls: Mutex::new(Vec::new()),
			check_delay: Mutex::new(Duration::ZERO),
			mining: AtomicBool::new(true),
		}
	}
}

impl MockChain {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn service(self: &Arc<Self>) -> ChainService {
		ChainService::new(self.clone(), Duration::from_secs(30))
	}

	pub fn script(&self, id: u64, script: Script) {
		self.scripts
			.lock()
			.unwrap()
			.insert(CorrelationId::from(id), script);
	}

	pub fn finalize(&self, id: u64) {
		self.finalized
			.lock()
			.unwrap()
			.insert(CorrelationId::from(id));
	}

	pub fn set_check_delay(&self, delay: Duration) {
		*self.check_delay.lock().unwrap() = delay;
	}

	/// Stops (or resumes) producing receipts for sent transactions.
	pub fn set_mining(&self, mining: bool) {
		self.mining.store(mining, Ordering::SeqCst);
	}

	/// Evicts every unmined transaction from the mempool.
	pub fn drop_pending(&self) {
		self.receipts.lock().unwrap().clear();
	}

	pub fn sends(&self, id: u64) -> usize {
		self.sent
			.lock()
			.unwrap()
			.iter()
			.filter(|sent| **sent == CorrelationId::from(id))
			.count()
	}

	pub fn check_times(&self, id: u64) -> Vec<Instant> {
		self.check_calls
			.lock()
			.unwrap()
			.iter()
			.filter(|(called, _)| *called == CorrelationId::from(id))
			.map(|(_, at)| *at)
			.collect()
	}

	fn script_for(&self, id: CorrelationId) -> Script {
		self.scripts
			.lock()
			.unwrap()
			.get(&id)
			.cloned()
			.unwrap_or_default()
	}
}

#[async_trait]
impl ChainInterface for MockChain {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(NoSchema)
	}

	async fn block_number(&self) -> Result<u64, ChainError> {
		Ok(0)
	}

	async fn get_logs(&self, _query: &LogQuery) -> Result<Vec<RawLog>, ChainError> {
		Ok(Vec::new())
	}

	async fn check_ready(&self, id: CorrelationId) -> Result<bool, ChainError> {
		self.check_calls.lock().unwrap().push((id, Instant::now()));

		let delay = *self.check_delay.lock().unwrap();
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}

		let mut scripts = self.scripts.lock().unwrap();
		let script = scripts.entry(id).or_default();
		script
			.checks
			.pop_front()
			.unwrap_or_else(|| script.check_default.clone())
	}

	async fn simulate_finalize(&self, id: CorrelationId) -> Result<(), ChainError> {
		if self.finalized.lock().unwrap().contains(&id) {
			return Err(ChainError::Revert(ALREADY_PROCESSED.to_string()));
		}
		match self.script_for(id).simulate_error {
			Some(error) => Err(error),
			None => Ok(()),
		}
	}

	async fn send_finalize(&self, id: CorrelationId) -> Result<TransactionHash, ChainError> {
		let nonce = {
			let mut sent = self.sent.lock().unwrap();
			sent.push(id);
			sent.len() as u64
		};

		let success = {
			let mut scripts = self.scripts.lock().unwrap();
			let script = scripts.entry(id).or_default();
			if script.receipt_reverts > 0 {
				script.receipt_reverts -= 1;
				false
			} else {
				true
			}
		};
		let mut hash = id.as_u256().to_be_bytes::<32>().to_vec();
		hash[..8].copy_from_slice(&nonce.to_be_bytes());
		let hash = TransactionHash(hash);
		self.receipts
			.lock()
			.unwrap()
			.insert(hash.clone(), (id, success));
		Ok(hash)
	}

	async fn get_receipt(
		&self,
		hash: &TransactionHash,
	) -> Result<Option<TransactionReceipt>, ChainError> {
		if !self.mining.load(Ordering::SeqCst) {
			return Ok(None);
		}
		let Some((id, success)) = self.receipts.lock().unwrap().get(hash).copied() else {
			return Ok(None);
		};
		if success {
			self.finalize(id.as_u256().to::<u64>());
		}
		Ok(Some(TransactionReceipt {
			hash: hash.clone(),
			block_number: 1,
			success,
		}))
	}

	async fn transaction_known(&self, hash: &TransactionHash) -> Result<bool, ChainError> {
		Ok(self.receipts.lock().unwrap().contains_key(hash))
	}
}
