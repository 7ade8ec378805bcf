//! Configuration types for the relayer.

use relayer_types::Address;
use serde::Deserialize;
use std::time::Duration;

/// Complete relayer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	/// Process-level settings
	pub relayer: RelayerSettings,
	/// The watched contract and event
	pub source: SourceConfig,
	/// Retry budget and backoff for transient failures
	#[serde(default)]
	pub retry: RetryConfig,
	/// Finalize transaction handling
	#[serde(default)]
	pub submission: SubmissionConfig,
	/// Order state persistence
	pub storage: PluginConfig,
	/// Signing account
	pub account: PluginConfig,
	/// Node connectivity and settlement contract
	pub chain: PluginConfig,
}

/// Selects an implementation and carries its raw configuration table.
///
/// The table is validated by the implementation's own schema.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
	pub backend: String,
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

fn empty_table() -> toml::Value {
	toml::Value::Table(toml::Table::new())
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerSettings {
	#[serde(default = "default_name")]
	pub name: String,
	#[serde(default = "default_log_level")]
	pub log_level: String,
	/// Upper bound on ids being checked or submitted at the same time
	#[serde(default = "default_max_concurrency")]
	pub max_concurrency: usize,
	/// How long terminal ids are remembered before eviction
	#[serde(default = "default_dedup_window_secs")]
	pub dedup_window_secs: u64,
	/// How often terminal ids older than the window are evicted
	#[serde(default = "default_prune_interval_secs")]
	pub prune_interval_secs: u64,
	/// Re-check not-ready ids on this interval; disabled when unset
	#[serde(default)]
	pub repoll_interval_secs: Option<u64>,
	/// Bound on every individual node call
	#[serde(default = "default_call_timeout_secs")]
	pub call_timeout_secs: u64,
	/// How long in-flight work may drain on shutdown
	#[serde(default = "default_shutdown_timeout_secs")]
	pub shutdown_timeout_secs: u64,
}

impl RelayerSettings {
	pub fn dedup_window(&self) -> Duration {
		Duration::from_secs(self.dedup_window_secs)
	}

	pub fn prune_interval(&self) -> Duration {
		Duration::from_secs(self.prune_interval_secs)
	}

	pub fn repoll_interval(&self) -> Option<Duration> {
		self.repoll_interval_secs.map(Duration::from_secs)
	}

	pub fn call_timeout(&self) -> Duration {
		Duration::from_secs(self.call_timeout_secs)
	}

	pub fn shutdown_timeout(&self) -> Duration {
		Duration::from_secs(self.shutdown_timeout_secs)
	}
}

fn default_name() -> String {
	"index-relayer".to_string()
}

fn default_log_level() -> String {
	"info".to_string()
}

fn default_max_concurrency() -> usize {
	16
}

fn default_dedup_window_secs() -> u64 {
	86_400
}

fn default_prune_interval_secs() -> u64 {
	300
}

fn default_call_timeout_secs() -> u64 {
	15
}

fn default_shutdown_timeout_secs() -> u64 {
	30
}

/// Where the block scan starts on process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawStartBlock")]
pub enum StartBlock {
	Latest,
	Number(u64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStartBlock {
	Number(u64),
	Tag(String),
}

impl TryFrom<RawStartBlock> for StartBlock {
	type Error = String;

	fn try_from(raw: RawStartBlock) -> Result<Self, Self::Error> {
		match raw {
			RawStartBlock::Number(n) => Ok(StartBlock::Number(n)),
			RawStartBlock::Tag(tag) if tag == "latest" => Ok(StartBlock::Latest),
			RawStartBlock::Tag(tag) => Err(format!(
				"start_block must be \"latest\" or a block number, got \"{}\"",
				tag
			)),
		}
	}
}

/// Where the correlation id sits in the watched log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationIdLocation {
	/// Indexed argument; topic 0 is the event signature.
	Topic(usize),
	/// 32-byte word of the non-indexed data.
	DataWord(usize),
}

impl Default for CorrelationIdLocation {
	fn default() -> Self {
		CorrelationIdLocation::Topic(1)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
	/// Contract emitting the event
	pub address: Address,
	/// Canonical event signature, e.g. `OrderFulfilled(uint256,address)`
	pub event_signature: String,
	#[serde(default = "default_start_block")]
	pub start_block: StartBlock,
	#[serde(default = "default_poll_interval_secs")]
	pub poll_interval_secs: u64,
	/// Blocks to stay behind the head
	#[serde(default)]
	pub confirmations: u64,
	/// Largest block span requested in one log query
	#[serde(default = "default_max_block_range")]
	pub max_block_range: u64,
	#[serde(default)]
	pub correlation_id: CorrelationIdLocation,
}

impl SourceConfig {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_secs(self.poll_interval_secs)
	}
}

fn default_start_block() -> StartBlock {
	StartBlock::Latest
}

fn default_poll_interval_secs() -> u64 {
	3
}

fn default_max_block_range() -> u64 {
	1_000
}

/// Retry budget and backoff shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
	pub max_attempts: u32,
	pub base_delay_ms: u64,
	pub multiplier: f64,
	pub max_delay_ms: u64,
	/// Fraction of each delay randomized in either direction
	pub jitter: f64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			base_delay_ms: 500,
			multiplier: 2.0,
			max_delay_ms: 60_000,
			jitter: 0.1,
		}
	}
}

impl RetryConfig {
	pub fn base_delay(&self) -> Duration {
		Duration::from_millis(self.base_delay_ms)
	}

	pub fn max_delay(&self) -> Duration {
		Duration::from_millis(self.max_delay_ms)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionConfig {
	#[serde(default = "default_receipt_timeout_secs")]
	pub receipt_timeout_secs: u64,
	#[serde(default = "default_receipt_poll_interval_ms")]
	pub receipt_poll_interval_ms: u64,
	/// Revert reason fragments meaning the order was finalized by someone else
	#[serde(default = "default_already_done_markers")]
	pub already_done_markers: Vec<String>,
}

impl Default for SubmissionConfig {
	fn default() -> Self {
		Self {
			receipt_timeout_secs: default_receipt_timeout_secs(),
			receipt_poll_interval_ms: default_receipt_poll_interval_ms(),
			already_done_markers: default_already_done_markers(),
		}
	}
}

impl SubmissionConfig {
	pub fn receipt_timeout(&self) -> Duration {
		Duration::from_secs(self.receipt_timeout_secs)
	}

	pub fn receipt_poll_interval(&self) -> Duration {
		Duration::from_millis(self.receipt_poll_interval_ms)
	}
}

fn default_receipt_timeout_secs() -> u64 {
	120
}

fn default_receipt_poll_interval_ms() -> u64 {
	2_000
}

fn default_already_done_markers() -> Vec<String> {
	vec!["already processed".to_string(), "already finalized".to_string()]
}
