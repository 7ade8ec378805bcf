//! Operator-visible relayer events.
//!
//! Every state transition that matters to an operator is emitted as a
//! structured log line and mirrored on the [`EventBus`] so that in-process
//! observers (and tests) can follow an order without scraping logs.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{CorrelationId, OrderStatus, TransactionHash};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayerEvent {
	/// A correlation id was observed for the first time.
	OrderSeen {
		correlation_id: CorrelationId,
		block_number: u64,
	},
	/// A readiness query returned a well-formed answer.
	CheckResult {
		correlation_id: CorrelationId,
		ready: bool,
	},
	/// The finalize transaction was broadcast.
	SubmissionSent {
		correlation_id: CorrelationId,
		tx_hash: TransactionHash,
	},
	/// The id reached a terminal or resting state after a submission.
	SubmissionResult {
		correlation_id: CorrelationId,
		status: OrderStatus,
		tx_hash: Option<TransactionHash>,
	},
	/// The id was marked failed and excluded from automatic action.
	TerminalFailure {
		correlation_id: CorrelationId,
		attempts: u32,
		error: String,
	},
}

impl RelayerEvent {
	pub fn correlation_id(&self) -> CorrelationId {
		match self {
			RelayerEvent::OrderSeen { correlation_id, .. }
			| RelayerEvent::CheckResult { correlation_id, .. }
			| RelayerEvent::SubmissionSent { correlation_id, .. }
			| RelayerEvent::SubmissionResult { correlation_id, .. }
			| RelayerEvent::TerminalFailure { correlation_id, .. } => *correlation_id,
		}
	}
}

/// Event bus for broadcasting relayer events to multiple subscribers.
///
/// Publishing never blocks; slow subscribers lose the oldest events once the
/// channel capacity is exceeded.
#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<RelayerEvent>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<RelayerEvent> {
		self.sender.subscribe()
	}

	/// Publishes an event to all current subscribers.
	///
	/// Returns an error if there are no active subscribers, which callers
	/// treat as non-critical.
	pub fn publish(
		&self,
		event: RelayerEvent,
	) -> Result<(), broadcast::error::SendError<RelayerEvent>> {
		self.sender.send(event)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_publish_reaches_subscribers() {
		let bus = EventBus::new(8);
		let mut first = bus.subscribe();
		let mut second = bus.clone().subscribe();

		bus.publish(RelayerEvent::CheckResult {
			correlation_id: CorrelationId::from(3),
			ready: true,
		})
		.unwrap();

		let a = first.recv().await.unwrap();
		let b = second.recv().await.unwrap();
		assert_eq!(a, b);
		assert_eq!(a.correlation_id(), CorrelationId::from(3));
	}

	#[test]
	fn test_publish_without_subscribers_is_an_error() {
		let bus = EventBus::new(8);
		assert!(bus
			.publish(RelayerEvent::OrderSeen {
				correlation_id: CorrelationId::from(1),
				block_number: 10,
			})
			.is_err());
	}
}
