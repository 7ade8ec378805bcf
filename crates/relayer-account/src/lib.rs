//! Signing account for the settlement relayer.
//!
//! The relayer signs exactly one kind of transaction (the finalize call), so
//! an account only has to expose its address and a wallet the chain client
//! can attach to its provider. The key is loaded once at startup and passed
//! in explicitly rather than living in process-global state.

use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use relayer_types::ConfigSchema;
use thiserror::Error;

pub mod implementations {
	pub mod local;
}

#[derive(Debug, Error)]
pub enum AccountError {
	#[error("Invalid key: {0}")]
	InvalidKey(String),
	#[error("Configuration error: {0}")]
	Config(String),
}

pub trait AccountInterface: Send + Sync {
	/// Returns the configuration schema for this account implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Address that pays for and signs finalize transactions.
	fn address(&self) -> Address;

	/// Wallet handed to the chain client's provider for transaction signing.
	fn wallet(&self) -> EthereumWallet;
}

pub struct AccountService {
	provider: Box<dyn AccountInterface>,
}

impl AccountService {
	pub fn new(provider: Box<dyn AccountInterface>) -> Self {
		Self { provider }
	}

	pub fn address(&self) -> Address {
		self.provider.address()
	}

	pub fn wallet(&self) -> EthereumWallet {
		self.provider.wallet()
	}
}
