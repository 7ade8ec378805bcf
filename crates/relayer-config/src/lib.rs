//! Configuration loading for the settlement relayer.
//!
//! The configuration is a TOML file. `${VAR}` references are replaced with
//! environment variables before parsing so that secrets such as the signing
//! key never have to live in the file, and a few settings can be overridden
//! with `RELAYER_`-prefixed variables.

use regex::Regex;
use std::env;
use std::path::Path;
use thiserror::Error;

mod types;

pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("File not found: {0}")]
	FileNotFound(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}

/// Configuration loader with environment variable substitution.
pub struct ConfigLoader {
	file_path: Option<String>,
	env_prefix: String,
}

impl Default for ConfigLoader {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigLoader {
	pub fn new() -> Self {
		Self {
			file_path: None,
			env_prefix: "RELAYER_".to_string(),
		}
	}

	pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
		self.file_path = Some(path.as_ref().to_string_lossy().to_string());
		self
	}

	pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.env_prefix = prefix.into();
		self
	}

	pub async fn load(&self) -> Result<Config, ConfigError> {
		let file_path = self
			.file_path
			.as_ref()
			.ok_or_else(|| ConfigError::FileNotFound("No configuration file specified".to_string()))?;

		let content = match tokio::fs::read_to_string(file_path).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(ConfigError::FileNotFound(file_path.clone()))
			}
			Err(e) => return Err(e.into()),
		};

		let config = self.parse(&content)?;
		tracing::debug!(path = %file_path, "Loaded configuration");
		Ok(config)
	}

	/// Substitutes, parses, applies overrides and validates `content`.
	pub fn parse(&self, content: &str) -> Result<Config, ConfigError> {
		let substituted = substitute_env_vars(content)?;

		let mut config: Config =
			toml::from_str(&substituted).map_err(|e| ConfigError::ParseError(e.to_string()))?;

		self.apply_env_overrides(&mut config)?;
		validate_config(&config)?;

		Ok(config)
	}

	fn apply_env_overrides(&self, config: &mut Config) -> Result<(), ConfigError> {
		if let Ok(log_level) = env::var(format!("{}LOG_LEVEL", self.env_prefix)) {
			config.relayer.log_level = log_level;
		}

		if let Ok(max_concurrency) = env::var(format!("{}MAX_CONCURRENCY", self.env_prefix)) {
			config.relayer.max_concurrency = max_concurrency.parse().map_err(|e| {
				ConfigError::ValidationError(format!("Invalid max concurrency: {}", e))
			})?;
		}

		Ok(())
	}
}

fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
	let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::ParseError(e.to_string()))?;
	let mut result = content.to_string();

	for cap in re.captures_iter(content) {
		let full_match = &cap[0];
		let var_name = &cap[1];

		let env_value =
			env::var(var_name).map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;

		result = result.replace(full_match, &env_value);
	}

	Ok(result)
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
	let invalid = |message: &str| Err(ConfigError::ValidationError(message.to_string()));

	if config.relayer.max_concurrency == 0 {
		return invalid("relayer.max_concurrency must be at least 1");
	}
	if config.relayer.call_timeout_secs == 0 {
		return invalid("relayer.call_timeout_secs must be at least 1");
	}
	if config.relayer.prune_interval_secs == 0 {
		return invalid("relayer.prune_interval_secs must be at least 1");
	}
	if config.relayer.repoll_interval_secs == Some(0) {
		return invalid("relayer.repoll_interval_secs must be at least 1 when set");
	}

	let source = &config.source;
	let signature = source.event_signature.trim();
	if !(signature.contains('(') && signature.ends_with(')')) || signature.contains(' ') {
		return invalid("source.event_signature must be canonical, e.g. OrderFulfilled(uint256,address)");
	}
	if source.max_block_range == 0 {
		return invalid("source.max_block_range must be at least 1");
	}
	if source.poll_interval_secs == 0 {
		return invalid("source.poll_interval_secs must be at least 1");
	}
	if let CorrelationIdLocation::Topic(index) = source.correlation_id {
		if index == 0 || index > 3 {
			return invalid("source.correlation_id topic must be between 1 and 3");
		}
	}

	let retry = &config.retry;
	if retry.max_attempts == 0 {
		return invalid("retry.max_attempts must be at least 1");
	}
	if retry.base_delay_ms == 0 || retry.max_delay_ms < retry.base_delay_ms {
		return invalid("retry delays must satisfy 0 < base_delay_ms <= max_delay_ms");
	}
	if !(0.0..1.0).contains(&retry.jitter) {
		return invalid("retry.jitter must be in [0, 1)");
	}
	// Smallest jittered delay must exceed the largest jittered previous one.
	if retry.multiplier * (1.0 - retry.jitter) <= 1.0 + retry.jitter {
		return invalid("retry.multiplier is too small for delays to increase under jitter");
	}
	// The backoff interval is clamped to max_delay_ms before jitter is
	// applied, so the last delay must still be reachable unclamped.
	if retry.max_attempts >= 2 {
		let last_delay =
			retry.base_delay_ms as f64 * retry.multiplier.powi(retry.max_attempts as i32 - 2);
		if last_delay > retry.max_delay_ms as f64 {
			return invalid("retry.max_delay_ms caps the backoff before max_attempts is reached");
		}
	}

	let submission = &config.submission;
	if submission.receipt_timeout_secs == 0 || submission.receipt_poll_interval_ms == 0 {
		return invalid("submission receipt timeout and poll interval must be positive");
	}
	if submission
		.already_done_markers
		.iter()
		.any(|marker| marker.trim().is_empty())
	{
		return invalid("submission.already_done_markers must not contain empty entries");
	}

	Ok(())
}
