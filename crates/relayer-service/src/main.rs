use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use relayer_config::{Config, ConfigLoader};
use relayer_core::{reset_order, RelayerBuilder};
use relayer_storage::{implementations::file, StorageService};
use relayer_types::CorrelationId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod factories;

#[derive(Parser)]
#[command(name = "index-relayer")]
#[command(about = "Settlement relayer for multi-leg index orders", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,

	#[arg(short, long, value_name = "FILE", default_value = "config/relayer.toml")]
	config: PathBuf,

	/// Overrides the configured log level; `RUST_LOG` takes precedence.
	#[arg(long, env = "RELAYER_LOG_LEVEL")]
	log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
	/// Start the relayer
	Start,
	/// Validate the configuration file
	Validate,
	/// Clear a failed order so that it is checked again
	Reset {
		/// Correlation id, decimal or 0x-prefixed hex
		id: CorrelationId,
	},
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	let config = ConfigLoader::new()
		.with_file(&cli.config)
		.load()
		.await
		.with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

	setup_tracing(cli.log_level.as_deref().unwrap_or(&config.relayer.log_level))?;

	match cli.command {
		Some(Commands::Start) | None => start_relayer(config).await,
		Some(Commands::Validate) => validate_config(&cli.config, &config),
		Some(Commands::Reset { id }) => reset(config, id).await,
	}
}

async fn start_relayer(config: Config) -> Result<()> {
	factories::validate_plugins(&config).map_err(|e| anyhow!(e))?;

	info!(
		name = %config.relayer.name,
		contract = %config.source.address,
		event = %config.source.event_signature,
		"Starting relayer"
	);

	let engine = factories::register(RelayerBuilder::new(config))
		.build()
		.context("Failed to build relayer")?;
	let engine = Arc::new(engine);

	let mut runner = {
		let engine = engine.clone();
		tokio::spawn(async move { engine.run().await })
	};

	// The run loop only returns by itself on error or a closed subscription.
	let finished = tokio::select! {
		_ = shutdown_signal() => None,
		result = &mut runner => Some(result),
	};
	let result = match finished {
		Some(result) => result,
		None => {
			info!("Shutdown signal received");
			engine.shutdown();
			runner.await
		}
	};

	result
		.context("Relayer task panicked")?
		.context("Relayer stopped with an error")?;

	info!("Relayer stopped");
	Ok(())
}

fn validate_config(path: &Path, config: &Config) -> Result<()> {
	factories::validate_plugins(config).map_err(|e| anyhow!(e))?;

	info!(path = ?path, "Configuration is valid");
	info!(
		storage = %config.storage.backend,
		account = %config.account.backend,
		chain = %config.chain.backend,
		"Configured backends"
	);
	if config.relayer.repoll_interval().is_none() {
		warn!("relayer.repoll_interval_secs is unset; not-ready orders wait for the next event");
	}
	Ok(())
}

/// Offline reset; the relayer must not be running against the same storage.
async fn reset(config: Config, id: CorrelationId) -> Result<()> {
	let backend = match config.storage.backend.as_str() {
		"file" => file::create_storage(&config.storage.config),
		other => return Err(anyhow!("Offline reset needs persistent storage, not '{}'", other)),
	};
	let storage = StorageService::new(backend);

	let state = reset_order(&storage, id)
		.await
		.with_context(|| format!("Failed to reset order {}", id))?;
	info!(correlation_id = %id, status = %state.status, "Order reset");
	Ok(())
}

fn setup_tracing(log_level: &str) -> Result<()> {
	let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

	tracing_subscriber::registry()
		.with(env_filter)
		.with(tracing_subscriber::fmt::layer())
		.try_init()
		.context("Failed to initialise tracing")?;

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			warn!(error = %e, "Failed to listen for Ctrl+C");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut sigterm) => {
				sigterm.recv().await;
			}
			Err(e) => {
				warn!(error = %e, "Failed to listen for SIGTERM");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
