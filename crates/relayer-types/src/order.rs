//! Order types for the settlement relayer.
//!
//! This module defines the decoded event record handed from the subscriber
//! to the correlator, and the relayer-local view of one order's settlement
//! progress.

use alloy::primitives::{B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TransactionHash;

/// Identifier connecting an emitted event to the multi-leg order it belongs to.
///
/// Stored as a 256-bit word so that both numeric nonces (`uint256`) and
/// `bytes32` identifiers fit without loss. Displayed in decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub U256);

impl CorrelationId {
	/// Interprets a 32-byte word (an indexed topic or an ABI data word) as an id.
	pub fn from_word(word: B256) -> Self {
		Self(U256::from_be_bytes(word.0))
	}

	/// Returns the id as an ABI `uint256` argument.
	pub fn as_u256(&self) -> U256 {
		self.0
	}
}

impl From<u64> for CorrelationId {
	fn from(value: u64) -> Self {
		Self(U256::from(value))
	}
}

impl fmt::Display for CorrelationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for CorrelationId {
	type Err = String;

	/// Accepts decimal or `0x`-prefixed hexadecimal.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let value = match s.strip_prefix("0x") {
			Some(hex_digits) => U256::from_str_radix(hex_digits, 16),
			None => U256::from_str_radix(s, 10),
		}
		.map_err(|e| format!("Invalid correlation id '{}': {}", s, e))?;
		Ok(Self(value))
	}
}

/// Undecoded log payload, kept opaque apart from correlation id extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
	/// Log topics, the first one being the event signature hash.
	pub topics: Vec<B256>,
	/// ABI-encoded non-indexed event arguments.
	pub data: Vec<u8>,
	/// Block the log was emitted in, if the node reported it.
	pub block_number: Option<u64>,
	/// Position of the log within its block, if the node reported it.
	pub log_index: Option<u64>,
	/// Transaction that emitted the log, if the node reported it.
	pub transaction_hash: Option<B256>,
}

/// One decoded log entry for the watched event.
///
/// Created by the subscriber and discarded once the correlator has observed
/// it; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderEvent {
	/// The order this event belongs to.
	pub correlation_id: CorrelationId,
	/// Block the event was emitted in.
	pub emitted_at_block: u64,
	/// Position of the event within its block.
	pub log_index: u64,
	/// Transaction that emitted the event, when known.
	pub transaction_hash: Option<TransactionHash>,
	/// The original log.
	pub raw: RawLog,
}

impl OrderEvent {
	/// Chain position used for ordering and resume cursors.
	pub fn position(&self) -> (u64, u64) {
		(self.emitted_at_block, self.log_index)
	}
}

/// Progress of one correlation id through the relayer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderStatus {
	/// Observed; the last readiness check (if any) reported not ready.
	Seen,
	/// A readiness query is in flight.
	Checking,
	/// The contract reported all legs complete.
	Ready,
	/// The finalize transaction is being simulated, sent or confirmed.
	Submitting,
	/// The finalize transaction was confirmed by this relayer.
	Completed,
	/// The relayer gave up on this id for now.
	Failed,
	/// Someone else finalized the order first.
	AlreadyDone,
}

impl OrderStatus {
	/// Terminal states never trigger further work.
	pub fn is_terminal(&self) -> bool {
		matches!(self, OrderStatus::Completed | OrderStatus::AlreadyDone)
	}

	/// States that mark an operation as running for the id.
	pub fn is_in_flight(&self) -> bool {
		matches!(
			self,
			OrderStatus::Checking | OrderStatus::Ready | OrderStatus::Submitting
		)
	}
}

impl fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let label = match self {
			OrderStatus::Seen => "seen",
			OrderStatus::Checking => "checking",
			OrderStatus::Ready => "ready",
			OrderStatus::Submitting => "submitting",
			OrderStatus::Completed => "completed",
			OrderStatus::Failed => "failed",
			OrderStatus::AlreadyDone => "already-done",
		};
		f.write_str(label)
	}
}

/// Relayer-local view of one order's settlement progress.
///
/// This is a cache of what the relayer has done, not the source of truth:
/// the settlement contract owns the authoritative fill state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderState {
	/// The order this state tracks.
	pub correlation_id: CorrelationId,
	/// Current position in the state machine.
	pub status: OrderStatus,
	/// Retry budget consumed by failed check or submission attempts.
	pub attempts: u32,
	/// Number of readiness queries issued, including not-ready results.
	pub checks: u32,
	/// Most recent failure detail.
	pub last_error: Option<String>,
	/// Finalize transaction, once one has been sent.
	pub tx_hash: Option<TransactionHash>,
	/// Unix timestamp (seconds) of the last transition.
	pub updated_at: i64,
}

impl OrderState {
	/// Creates the state for a freshly observed id.
	pub fn new(correlation_id: CorrelationId) -> Self {
		Self {
			correlation_id,
			status: OrderStatus::Seen,
			attempts: 0,
			checks: 0,
			last_error: None,
			tx_hash: None,
			updated_at: chrono::Utc::now().timestamp(),
		}
	}

	/// Moves to `status` and refreshes the transition timestamp.
	pub fn transition(&mut self, status: OrderStatus) {
		self.status = status;
		self.updated_at = chrono::Utc::now().timestamp();
	}

	/// Whether a failed id still has retry budget left.
	pub fn has_budget(&self, max_attempts: u32) -> bool {
		self.attempts < max_attempts
	}
}
