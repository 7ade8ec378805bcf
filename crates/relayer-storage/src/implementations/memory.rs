//! In-memory storage backend.
//!
//! Used for dry runs and tests. Honors TTLs lazily: expired entries are
//! dropped when they are next touched.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
	value: Vec<u8>,
	expires_at: Option<Instant>,
}

impl Entry {
	fn is_expired(&self, now: Instant) -> bool {
		self.expires_at.is_some_and(|deadline| deadline <= now)
	}
}

#[derive(Default)]
pub struct MemoryStorage {
	data: DashMap<String, Entry>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let now = Instant::now();
		let expired = match self.data.get(key) {
			Some(entry) if !entry.is_expired(now) => return Ok(entry.value.clone()),
			Some(_) => true,
			None => false,
		};
		if expired {
			self.data.remove(key);
		}
		Err(StorageError::NotFound)
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let expires_at = ttl.map(|ttl| Instant::now() + ttl);
		self.data
			.insert(key.to_string(), Entry { value, expires_at });
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		self.data.remove(key);
		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		let now = Instant::now();
		Ok(self
			.data
			.get(key)
			.is_some_and(|entry| !entry.is_expired(now)))
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		let now = Instant::now();
		self.data.retain(|_, entry| !entry.is_expired(now));
		Ok(self
			.data
			.iter()
			.filter(|entry| entry.key().starts_with(prefix))
			.map(|entry| entry.key().clone())
			.collect())
	}
}

/// Creates an in-memory storage backend; it takes no configuration.
pub fn create_storage(_config: &toml::Value) -> Box<dyn StorageInterface> {
	Box::new(MemoryStorage::new())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn test_ttl_expiry() {
		let storage = MemoryStorage::new();
		storage
			.set_bytes("orders:1", vec![1], Some(Duration::from_secs(60)))
			.await
			.unwrap();
		storage.set_bytes("orders:2", vec![2], None).await.unwrap();

		assert!(storage.exists("orders:1").await.unwrap());
		tokio::time::advance(Duration::from_secs(61)).await;

		assert!(!storage.exists("orders:1").await.unwrap());
		assert!(matches!(
			storage.get_bytes("orders:1").await,
			Err(StorageError::NotFound)
		));
		assert_eq!(storage.list_keys("orders:").await.unwrap(), vec!["orders:2"]);
	}
}
