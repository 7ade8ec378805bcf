//! Backend registry: maps the `backend` names accepted in configuration to
//! their factories and configuration schemas.

use relayer_account::implementations::local::{self, LocalWalletSchema};
use relayer_chain::implementations::alloy::{self, AlloyChainSchema};
use relayer_config::{Config, PluginConfig};
use relayer_core::RelayerBuilder;
use relayer_storage::implementations::{file, memory};
use relayer_types::{ConfigSchema, ValidationError};
use std::sync::Arc;

struct NoConfig;

impl ConfigSchema for NoConfig {
	fn validate(&self, _config: &toml::Value) -> Result<(), ValidationError> {
		Ok(())
	}
}

/// Registers every built-in backend on `builder`.
pub fn register(builder: RelayerBuilder) -> RelayerBuilder {
	builder
		.with_storage_factory("file", file::create_storage)
		.with_storage_factory("memory", memory::create_storage)
		.with_account_factory("local", local::create_account)
		.with_chain_factory("alloy", |config, account| {
			alloy::create_chain(config, account.wallet(), account.address()).map(Arc::from)
		})
}

fn schema(kind: &str, plugin: &PluginConfig) -> Result<Box<dyn ConfigSchema>, String> {
	let schema: Box<dyn ConfigSchema> = match (kind, plugin.backend.as_str()) {
		("storage", "file") => Box::new(file::FileStorageSchema),
		("storage", "memory") => Box::new(NoConfig),
		("account", "local") => Box::new(LocalWalletSchema),
		("chain", "alloy") => Box::new(AlloyChainSchema),
		(kind, backend) => return Err(format!("Unknown {} backend '{}'", kind, backend)),
	};
	Ok(schema)
}

/// Checks every plugin section against the schema of its backend.
pub fn validate_plugins(config: &Config) -> Result<(), String> {
	for (kind, plugin) in [
		("storage", &config.storage),
		("account", &config.account),
		("chain", &config.chain),
	] {
		schema(kind, plugin)?
			.validate(&plugin.config)
			.map_err(|e| format!("[{}] {}: {}", kind, plugin.backend, e))?;
	}
	Ok(())
}
