use relayer_account::AccountError;
use relayer_chain::ChainError;
use relayer_discovery::DiscoveryError;
use relayer_storage::StorageError;
use relayer_types::CorrelationId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayerError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
	#[error("Chain error: {0}")]
	Chain(#[from] ChainError),
	#[error("Account error: {0}")]
	Account(#[from] AccountError),
	#[error("Discovery error: {0}")]
	Discovery(#[from] DiscoveryError),
	#[error("Unknown order {0}")]
	UnknownOrder(CorrelationId),
	#[error("Order {id} is {status}, only failed orders can be reset")]
	NotResettable { id: CorrelationId, status: String },
}
