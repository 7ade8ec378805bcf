//! Per-id bookkeeping and single-flight dispatch.
//!
//! The correlator owns the relayer-local [`OrderState`] of every known
//! correlation id. Claiming an id for work is a single atomic transition on
//! its map entry, so concurrent duplicate deliveries can never start two
//! checks or submissions for the same id.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relayer_types::{CorrelationId, OrderState, OrderStatus};
use std::time::Duration;

/// Where processing of a claimed id starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	/// Query readiness first.
	Check,
	/// A finalize transaction may already be out; go straight to simulation.
	Submit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
	Terminal,
	InFlight,
	BudgetExhausted,
}

/// Decision for one observation of an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
	/// The id was claimed; the caller must run its check path.
	Check { first_seen: bool, state: OrderState },
	Ignore(IgnoreReason),
}

pub struct Correlator {
	states: DashMap<CorrelationId, OrderState>,
	max_attempts: u32,
}

impl Correlator {
	pub fn new(max_attempts: u32) -> Self {
		Self {
			states: DashMap::new(),
			max_attempts,
		}
	}

	/// Records a delivery of `id` and decides whether it needs work.
	pub fn observe(&self, id: CorrelationId) -> Action {
		match self.states.entry(id) {
			Entry::Vacant(entry) => {
				let mut state = OrderState::new(id);
				state.transition(OrderStatus::Checking);
				entry.insert(state.clone());
				Action::Check {
					first_seen: true,
					state,
				}
			}
			Entry::Occupied(mut entry) => {
				let state = entry.get_mut();
				match state.status {
					OrderStatus::Completed | OrderStatus::AlreadyDone => {
						Action::Ignore(IgnoreReason::Terminal)
					}
					OrderStatus::Checking | OrderStatus::Ready | OrderStatus::Submitting => {
						Action::Ignore(IgnoreReason::InFlight)
					}
					OrderStatus::Failed if !state.has_budget(self.max_attempts) => {
						Action::Ignore(IgnoreReason::BudgetExhausted)
					}
					OrderStatus::Failed | OrderStatus::Seen => {
						state.transition(OrderStatus::Checking);
						Action::Check {
							first_seen: false,
							state: state.clone(),
						}
					}
				}
			}
		}
	}

	pub fn get(&self, id: &CorrelationId) -> Option<OrderState> {
		self.states.get(id).map(|state| state.clone())
	}

	/// Applies `change` to a known id and returns the new state.
	pub fn update<F>(&self, id: &CorrelationId, change: F) -> Option<OrderState>
	where
		F: FnOnce(&mut OrderState),
	{
		self.states.get_mut(id).map(|mut state| {
			change(state.value_mut());
			state.clone()
		})
	}

	/// Ids whose last check was not-ready, for periodic re-polling.
	pub fn idle(&self) -> Vec<CorrelationId> {
		self.states
			.iter()
			.filter(|entry| entry.status == OrderStatus::Seen)
			.map(|entry| *entry.key())
			.collect()
	}

	/// Operator reset of a failed id: clears its budget and error.
	///
	/// Returns `None` unless the id is currently `failed`.
	pub fn reset(&self, id: &CorrelationId) -> Option<OrderState> {
		let mut state = self.states.get_mut(id)?;
		if state.status != OrderStatus::Failed {
			return None;
		}
		state.attempts = 0;
		state.last_error = None;
		state.transition(OrderStatus::Seen);
		Some(state.clone())
	}

	/// Evicts terminal ids whose last transition is older than `grace`.
	pub fn prune(&self, grace: Duration) -> Vec<CorrelationId> {
		let cutoff = chrono::Utc::now().timestamp() - grace.as_secs() as i64;
		let mut evicted = Vec::new();

		self.states.retain(|id, state| {
			let expired = state.status.is_terminal() && state.updated_at < cutoff;
			if expired {
				evicted.push(*id);
			}
			!expired
		});

		evicted
	}

	/// Seeds the map from persisted states and claims every id that needs
	/// reconciliation.
	///
	/// In-flight statuses are stale after a restart. An id that was
	/// `submitting` resumes at the submission phase so that its simulation
	/// detects a finalize that already landed.
	pub fn restore(&self, states: Vec<OrderState>) -> Vec<(CorrelationId, Phase)> {
		let mut resumed = Vec::new();

		for mut state in states {
			let id = state.correlation_id;
			let phase = match state.status {
				OrderStatus::Completed | OrderStatus::AlreadyDone => None,
				OrderStatus::Failed if !state.has_budget(self.max_attempts) => None,
				OrderStatus::Submitting => Some(Phase::Submit),
				OrderStatus::Seen
				| OrderStatus::Checking
				| OrderStatus::Ready
				| OrderStatus::Failed => {
					state.transition(OrderStatus::Checking);
					Some(Phase::Check)
				}
			};

			self.states.insert(id, state);
			if let Some(phase) = phase {
				resumed.push((id, phase));
			}
		}

		resumed
	}

	pub fn len(&self) -> usize {
		self.states.len()
	}

	pub fn is_empty(&self) -> bool {
		self.states.is_empty()
	}
}
