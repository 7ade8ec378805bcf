//! Alloy-based chain client.
//!
//! Talks to one EVM node over HTTP. Transactions are signed by the wallet
//! handed in by the account module; the settlement contract is reached
//! through the typed `IIndexFactoryProcessor` binding below.

use crate::{ChainError, ChainInterface, LogQuery};
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::Filter;
use alloy::sol;
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;
use relayer_types::{
	ConfigSchema, CorrelationId, Field, FieldType, RawLog, Schema, TransactionHash,
	TransactionReceipt, ValidationError,
};

sol! {
	/// Settlement entry points of the index factory processor.
	#[sol(rpc)]
	interface IIndexFactoryProcessor {
		/// True once every leg of the request has been filled.
		function checkMultical(uint256 requestNonce) external view returns (bool);
		/// Finalizes the request; reverts if it is not ready or already finalized.
		function multical(uint256 requestNonce) external;
	}
}

/// JSON-RPC error code used by nodes for execution reverts.
const EXECUTION_REVERTED_CODE: i64 = 3;

pub struct AlloyChain {
	provider: DynProvider,
	contract: IIndexFactoryProcessor::IIndexFactoryProcessorInstance<DynProvider>,
	sender: Address,
}

impl AlloyChain {
	pub fn new(
		rpc_url: &str,
		chain_id: u64,
		settlement_address: Address,
		wallet: EthereumWallet,
		sender: Address,
	) -> Result<Self, ChainError> {
		let url = rpc_url
			.parse()
			.map_err(|e| ChainError::Config(format!("Invalid RPC URL: {}", e)))?;

		let provider = ProviderBuilder::new()
			.with_chain_id(chain_id)
			.wallet(wallet)
			.connect_http(url)
			.erased();
		let contract = IIndexFactoryProcessor::new(settlement_address, provider.clone());

		Ok(Self {
			provider,
			contract,
			sender,
		})
	}
}

/// Maps a JSON-RPC error response onto the retry classification.
///
/// Nodes disagree on how they report reverts: some use code 3, others only
/// say so in the message.
pub fn classify_error_response(code: i64, message: &str, reason: Option<String>) -> ChainError {
	if code == EXECUTION_REVERTED_CODE || message.to_lowercase().contains("revert") {
		match reason {
			Some(reason) if !message.contains(&reason) => {
				ChainError::Revert(format!("{}: {}", message, reason))
			}
			_ => ChainError::Revert(message.to_string()),
		}
	} else {
		ChainError::Network(format!("RPC error {}: {}", code, message))
	}
}

fn transport_error(err: RpcError<TransportErrorKind>) -> ChainError {
	match err {
		RpcError::ErrorResp(payload) => {
			let reason = payload
				.as_revert_data()
				.and_then(|data| alloy::sol_types::decode_revert_reason(&data));
			classify_error_response(payload.code, &payload.message, reason)
		}
		RpcError::DeserError { err, .. } => ChainError::Decode(err.to_string()),
		other => ChainError::Network(other.to_string()),
	}
}

fn contract_error(err: alloy::contract::Error) -> ChainError {
	match err {
		alloy::contract::Error::TransportError(e) => transport_error(e),
		other => ChainError::Decode(other.to_string()),
	}
}

pub struct AlloyChainSchema;

impl ConfigSchema for AlloyChainSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![
				Field::new("rpc_url", FieldType::Url),
				Field::new(
					"chain_id",
					FieldType::Integer {
						min: Some(1),
						max: None,
					},
				),
				Field::new("settlement_address", FieldType::Address),
			],
			vec![],
		);

		schema.validate(config)
	}
}

#[async_trait]
impl ChainInterface for AlloyChain {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(AlloyChainSchema)
	}

	async fn block_number(&self) -> Result<u64, ChainError> {
		self.provider
			.get_block_number()
			.await
			.map_err(transport_error)
	}

	async fn get_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, ChainError> {
		let filter = Filter::new()
			.address(query.address)
			.event_signature(query.event_signature)
			.from_block(query.from_block)
			.to_block(query.to_block);

		let logs = self
			.provider
			.get_logs(&filter)
			.await
			.map_err(transport_error)?;

		Ok(logs
			.into_iter()
			.map(|log| RawLog {
				topics: log.topics().to_vec(),
				data: log.data().data.to_vec(),
				block_number: log.block_number,
				log_index: log.log_index,
				transaction_hash: log.transaction_hash,
			})
			.collect())
	}

	async fn check_ready(&self, id: CorrelationId) -> Result<bool, ChainError> {
		self.contract
			.checkMultical(id.as_u256())
			.call()
			.await
			.map_err(contract_error)
	}

	async fn simulate_finalize(&self, id: CorrelationId) -> Result<(), ChainError> {
		self.contract
			.multical(id.as_u256())
			.from(self.sender)
			.call()
			.await
			.map(|_| ())
			.map_err(contract_error)
	}

	async fn send_finalize(&self, id: CorrelationId) -> Result<TransactionHash, ChainError> {
		let pending = self
			.contract
			.multical(id.as_u256())
			.from(self.sender)
			.send()
			.await
			.map_err(contract_error)?;

		let tx_hash = TransactionHash(pending.tx_hash().0.to_vec());
		tracing::info!(correlation_id = %id, tx_hash = %tx_hash.truncated(), "Submitted finalize transaction");
		Ok(tx_hash)
	}

	async fn get_receipt(
		&self,
		hash: &TransactionHash,
	) -> Result<Option<TransactionReceipt>, ChainError> {
		let receipt = self
			.provider
			.get_transaction_receipt(tx_hash(hash)?)
			.await
			.map_err(transport_error)?;

		Ok(receipt.map(|receipt| TransactionReceipt {
			hash: TransactionHash(receipt.transaction_hash.0.to_vec()),
			block_number: receipt.block_number.unwrap_or(0),
			success: receipt.status(),
		}))
	}

	async fn transaction_known(&self, hash: &TransactionHash) -> Result<bool, ChainError> {
		let transaction = self
			.provider
			.get_transaction_by_hash(tx_hash(hash)?)
			.await
			.map_err(transport_error)?;
		Ok(transaction.is_some())
	}
}

fn tx_hash(hash: &TransactionHash) -> Result<B256, ChainError> {
	if hash.0.len() != 32 {
		return Err(ChainError::Decode(format!("Malformed transaction hash {}", hash)));
	}
	Ok(B256::from_slice(&hash.0))
}

/// Creates the alloy chain client from the `[chain]` table.
///
/// Required configuration parameters:
/// - `rpc_url`: HTTP RPC endpoint
/// - `chain_id`: chain the relayer signs for
/// - `settlement_address`: index factory processor contract
pub fn create_chain(
	config: &toml::Value,
	wallet: EthereumWallet,
	sender: Address,
) -> Result<Box<dyn ChainInterface>, ChainError> {
	AlloyChainSchema
		.validate(config)
		.map_err(|e| ChainError::Config(e.to_string()))?;

	let rpc_url = config
		.get("rpc_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| ChainError::Config("rpc_url is required".to_string()))?;
	let chain_id = config
		.get("chain_id")
		.and_then(|v| v.as_integer())
		.ok_or_else(|| ChainError::Config("chain_id is required".to_string()))? as u64;
	let settlement_address = config
		.get("settlement_address")
		.and_then(|v| v.as_str())
		.ok_or_else(|| ChainError::Config("settlement_address is required".to_string()))?
		.parse::<Address>()
		.map_err(|e| ChainError::Config(format!("Invalid settlement_address: {}", e)))?;

	Ok(Box::new(AlloyChain::new(
		rpc_url,
		chain_id,
		settlement_address,
		wallet,
		sender,
	)?))
}
