//! Log decoding for the watched event.

use crate::DiscoveryError;
use alloy::primitives::{keccak256, B256};
use relayer_config::CorrelationIdLocation;
use relayer_types::{CorrelationId, OrderEvent, RawLog, TransactionHash};

/// Topic 0 of logs emitted for `signature`, e.g. `OrderFulfilled(uint256,address)`.
pub fn event_topic(signature: &str) -> B256 {
	keccak256(signature.trim().as_bytes())
}

/// Turns a raw log into an [`OrderEvent`], extracting the correlation id.
///
/// Only the id word is interpreted; the rest of the payload stays opaque.
pub fn decode_log(raw: RawLog, location: CorrelationIdLocation) -> Result<OrderEvent, DiscoveryError> {
	let emitted_at_block = raw
		.block_number
		.ok_or_else(|| DiscoveryError::Decode("log has no block number".to_string()))?;
	let log_index = raw
		.log_index
		.ok_or_else(|| DiscoveryError::Decode("log has no log index".to_string()))?;

	let word = match location {
		CorrelationIdLocation::Topic(index) => raw.topics.get(index).copied().ok_or_else(|| {
			DiscoveryError::Decode(format!(
				"expected indexed id at topic {}, log has {} topics",
				index,
				raw.topics.len()
			))
		})?,
		CorrelationIdLocation::DataWord(index) => {
			let start = index * 32;
			raw.data
				.get(start..start + 32)
				.map(B256::from_slice)
				.ok_or_else(|| {
					DiscoveryError::Decode(format!(
						"expected id at data word {}, data is {} bytes",
						index,
						raw.data.len()
					))
				})?
		}
	};

	Ok(OrderEvent {
		correlation_id: CorrelationId::from_word(word),
		emitted_at_block,
		log_index,
		transaction_hash: raw
			.transaction_hash
			.map(|hash| TransactionHash(hash.0.to_vec())),
		raw,
	})
}
