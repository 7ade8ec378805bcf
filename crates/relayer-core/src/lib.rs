//! Settlement relayer engine.
//!
//! The engine consumes order events from the log subscriber, hands every
//! claimed correlation id to a bounded pool of tasks that check readiness and
//! submit the finalize call, and keeps the per-id state persisted so that a
//! restart can reconcile work that was interrupted.

use correlator::{Action, Phase};
use pipeline::Pipeline;
use relayer_account::{AccountError, AccountInterface, AccountService};
use relayer_chain::{ChainError, ChainInterface, ChainService};
use relayer_config::Config;
use relayer_discovery::LogSubscriber;
use relayer_storage::{StorageInterface, StorageService};
use relayer_types::{CorrelationId, EventBus, OrderEvent, OrderState, OrderStatus, RelayerEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

pub mod checker;
pub mod correlator;
pub mod error;
mod pipeline;
pub mod retry;
pub mod submitter;

#[cfg(test)]
mod mock;

pub use error::RelayerError;
pub use pipeline::ORDERS_NAMESPACE;

use checker::ReadinessChecker;
use retry::RetryCoordinator;
use submitter::CompletionSubmitter;

pub struct RelayerEngine {
	config: Config,
	pipeline: Arc<Pipeline>,
	subscriber: LogSubscriber,
	storage: Arc<StorageService>,
	permits: Arc<Semaphore>,
	tasks: Mutex<JoinSet<()>>,
	shutdown: watch::Sender<bool>,
	event_bus: EventBus,
}

impl RelayerEngine {
	/// Runs until [`shutdown`](Self::shutdown) is called or the event
	/// subscription ends, then drains in-flight work.
	pub async fn run(&self) -> Result<(), RelayerError> {
		self.reconcile().await?;

		let mut events = self.subscriber.stream().await?;
		let mut stop = self.shutdown.subscribe();
		let mut prune = ticker(self.config.relayer.prune_interval());
		let mut repoll = self.config.relayer.repoll_interval().map(ticker);

		info!(name = %self.config.relayer.name, "Relayer started");

		loop {
			tokio::select! {
				event = events.next() => match event {
					Some(event) => self.dispatch(event).await,
					None => {
						warn!("Event subscription ended");
						break;
					}
				},
				_ = tick(&mut repoll) => self.repoll().await,
				_ = prune.tick() => self.prune().await,
				// The guard returned by `wait_for` must not live across the
				// select, it would make this future `!Send`.
				_ = async { let _ = stop.wait_for(|stop| *stop).await; } => {
					info!("Shutting down relayer");
					break;
				}
			}
		}

		self.subscriber.stop_monitoring().await?;
		self.drain(self.config.relayer.shutdown_timeout()).await;
		Ok(())
	}

	/// Seeds the correlator from storage and resumes every non-terminal id.
	///
	/// Returns the number of resumed ids.
	pub async fn reconcile(&self) -> Result<usize, RelayerError> {
		let states: Vec<OrderState> = self.storage.load_all(ORDERS_NAMESPACE).await?;
		let restored = states.len();
		let resumed = self.pipeline.correlator.restore(states);

		for (id, phase) in &resumed {
			info!(correlation_id = %id, ?phase, "Reconciling order");
			if let Some(state) = self.pipeline.correlator.get(id) {
				self.pipeline.persist(&state).await;
			}
			self.spawn(*id, *phase).await;
		}

		info!(restored, resumed = resumed.len(), "Restored persisted orders");
		Ok(resumed.len())
	}

	/// Feeds one decoded event through deduplication and, if the id was
	/// claimed, schedules its check.
	pub async fn dispatch(&self, event: OrderEvent) {
		let id = event.correlation_id;
		match self.pipeline.correlator.observe(id) {
			Action::Check { first_seen, state } => {
				if first_seen {
					info!(
						correlation_id = %id,
						block = event.emitted_at_block,
						log_index = event.log_index,
						"Order seen"
					);
					self.pipeline.publish(RelayerEvent::OrderSeen {
						correlation_id: id,
						block_number: event.emitted_at_block,
					});
				} else {
					debug!(correlation_id = %id, attempts = state.attempts, "Re-checking order");
				}
				self.pipeline.persist(&state).await;
				self.spawn(id, Phase::Check).await;
			}
			Action::Ignore(reason) => {
				debug!(correlation_id = %id, ?reason, "Ignoring event");
			}
		}
	}

	async fn spawn(&self, id: CorrelationId, phase: Phase) {
		let pipeline = self.pipeline.clone();
		let permits = self.permits.clone();
		let mut tasks = self.tasks.lock().await;

		while let Some(finished) = tasks.try_join_next() {
			if let Err(e) = finished {
				if e.is_panic() {
					error!(error = %e, "Order task panicked");
				}
			}
		}

		tasks.spawn(async move {
			let Ok(_permit) = permits.acquire_owned().await else {
				return;
			};
			pipeline.process(id, phase).await;
		});
	}

	/// Re-observes ids whose last check was not-ready.
	async fn repoll(&self) {
		for id in self.pipeline.correlator.idle() {
			if let Action::Check { state, .. } = self.pipeline.correlator.observe(id) {
				debug!(correlation_id = %id, "Re-polling order");
				self.pipeline.persist(&state).await;
				self.spawn(id, Phase::Check).await;
			}
		}
	}

	/// Forgets terminal ids older than the dedup window.
	async fn prune(&self) {
		let evicted = self
			.pipeline
			.correlator
			.prune(self.config.relayer.dedup_window());
		if evicted.is_empty() {
			return;
		}

		for id in &evicted {
			if let Err(e) = self.storage.remove(ORDERS_NAMESPACE, &id.to_string()).await {
				warn!(correlation_id = %id, error = %e, "Failed to remove pruned order");
			}
		}
		debug!(pruned = evicted.len(), "Pruned terminal orders");
	}

	/// Waits up to `timeout` for in-flight work, then aborts what is left.
	///
	/// An aborted `submitting` id stays persisted as such and is reconciled
	/// on the next start.
	pub async fn drain(&self, timeout: Duration) {
		let mut tasks = self.tasks.lock().await;
		let drained = tokio::time::timeout(timeout, async {
			while tasks.join_next().await.is_some() {}
		})
		.await;

		if drained.is_err() {
			warn!(remaining = tasks.len(), "Shutdown timeout elapsed, aborting in-flight work");
			tasks.shutdown().await;
		}
	}

	/// Signals [`run`](Self::run) to stop.
	pub fn shutdown(&self) {
		self.shutdown.send_replace(true);
	}

	/// Operator reset of a failed id; the next event or re-poll checks it again.
	pub async fn reset(&self, id: CorrelationId) -> Result<OrderState, RelayerError> {
		let state = match self.pipeline.correlator.reset(&id) {
			Some(state) => state,
			None => {
				return Err(match self.pipeline.correlator.get(&id) {
					Some(state) => RelayerError::NotResettable {
						id,
						status: state.status.to_string(),
					},
					None => RelayerError::UnknownOrder(id),
				})
			}
		};
		self.pipeline.persist(&state).await;
		info!(correlation_id = %id, "Order reset");
		Ok(state)
	}

	pub fn order_state(&self, id: &CorrelationId) -> Option<OrderState> {
		self.pipeline.correlator.get(id)
	}

	pub fn event_bus(&self) -> &EventBus {
		&self.event_bus
	}

	pub fn config(&self) -> &Config {
		&self.config
	}
}

fn ticker(period: Duration) -> Interval {
	let mut interval = interval_at(Instant::now() + period, period);
	interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
	interval
}

async fn tick(interval: &mut Option<Interval>) {
	match interval {
		Some(interval) => {
			interval.tick().await;
		}
		None => std::future::pending().await,
	}
}

/// Resets a failed id directly in storage, for use while no relayer runs.
pub async fn reset_order(
	storage: &StorageService,
	id: CorrelationId,
) -> Result<OrderState, RelayerError> {
	let mut state: OrderState = storage
		.retrieve(ORDERS_NAMESPACE, &id.to_string())
		.await
		.map_err(|e| match e {
			relayer_storage::StorageError::NotFound => RelayerError::UnknownOrder(id),
			other => other.into(),
		})?;

	if state.status != OrderStatus::Failed {
		return Err(RelayerError::NotResettable {
			id,
			status: state.status.to_string(),
		});
	}

	state.attempts = 0;
	state.last_error = None;
	state.transition(OrderStatus::Seen);
	storage
		.store(ORDERS_NAMESPACE, &id.to_string(), &state)
		.await?;
	Ok(state)
}

type StorageFactory = Box<dyn Fn(&toml::Value) -> Box<dyn StorageInterface> + Send>;
type AccountFactory =
	Box<dyn Fn(&toml::Value) -> Result<Box<dyn AccountInterface>, AccountError> + Send>;
type ChainFactory = Box<
	dyn Fn(&toml::Value, &AccountService) -> Result<Arc<dyn ChainInterface>, ChainError> + Send,
>;

/// Assembles a [`RelayerEngine`] from configuration, picking each backend by
/// the name in its `backend` key.
pub struct RelayerBuilder {
	config: Config,
	storage_factories: HashMap<String, StorageFactory>,
	account_factories: HashMap<String, AccountFactory>,
	chain_factories: HashMap<String, ChainFactory>,
}

impl RelayerBuilder {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			storage_factories: HashMap::new(),
			account_factories: HashMap::new(),
			chain_factories: HashMap::new(),
		}
	}

	pub fn with_storage_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Box<dyn StorageInterface> + Send + 'static,
	{
		self.storage_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_account_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn AccountInterface>, AccountError> + Send + 'static,
	{
		self.account_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_chain_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value, &AccountService) -> Result<Arc<dyn ChainInterface>, ChainError>
			+ Send
			+ 'static,
	{
		self.chain_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn build(self) -> Result<RelayerEngine, RelayerError> {
		let config = self.config;
		let unknown = |kind: &str, name: &str| {
			RelayerError::Config(format!("Unknown {} backend '{}'", kind, name))
		};

		let storage_factory = self
			.storage_factories
			.get(&config.storage.backend)
			.ok_or_else(|| unknown("storage", &config.storage.backend))?;
		let storage = Arc::new(StorageService::new(storage_factory(&config.storage.config)));

		let account_factory = self
			.account_factories
			.get(&config.account.backend)
			.ok_or_else(|| unknown("account", &config.account.backend))?;
		let account = AccountService::new(account_factory(&config.account.config)?);

		let chain_factory = self
			.chain_factories
			.get(&config.chain.backend)
			.ok_or_else(|| unknown("chain", &config.chain.backend))?;
		let chain = ChainService::new(
			chain_factory(&config.chain.config, &account)?,
			config.relayer.call_timeout(),
		);

		let retry = Arc::new(RetryCoordinator::new(config.retry.clone()));
		let event_bus = EventBus::new(1000);
		let pipeline = Arc::new(Pipeline::new(
			ReadinessChecker::new(chain.clone()),
			CompletionSubmitter::new(chain.clone(), retry.clone(), &config.submission),
			retry,
			storage.clone(),
			event_bus.clone(),
			config.relayer.dedup_window(),
		));
		let subscriber = LogSubscriber::new(chain, config.source.clone(), storage.clone());
		let (shutdown, _) = watch::channel(false);

		Ok(RelayerEngine {
			permits: Arc::new(Semaphore::new(config.relayer.max_concurrency)),
			config,
			pipeline,
			subscriber,
			storage,
			tasks: Mutex::new(JoinSet::new()),
			shutdown,
			event_bus,
		})
	}
}
