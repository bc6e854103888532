use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::lock::Locker;
use crate::watch::{KvListStream, KvStream, StopSignal};

/// A key, its value and the backend version stamp observed when it was read.
///
/// `last_index` is the compare token for [`Store::atomic_put`] and
/// [`Store::atomic_delete`]. It goes stale as soon as any writer touches the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KVPair {
    pub key: String,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    pub last_index: u64,
}

impl KVPair {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, last_index: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            last_index,
        }
    }
}

/// Options for write operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// A positive TTL asks for a key bound to the client session.
    /// Backends without TTL support treat any positive value as "ephemeral".
    #[serde(default)]
    pub ttl: Duration,
}

impl WriteOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn is_ephemeral(&self) -> bool {
        !self.ttl.is_zero()
    }
}

/// Options for lock handles created by [`Store::new_lock`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    /// Written to the lock key once the lock is acquired.
    #[serde(with = "serde_bytes", default)]
    pub value: Vec<u8>,
    /// Lease for backends that expire locks by time.
    #[serde(default)]
    pub ttl: Duration,
}

/// Uniform key/value store contract implemented by each coordination backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the backend identifier (e.g., "zk", "etcd").
    fn backend_name(&self) -> &'static str;

    /// Put a value at `key`, creating missing parent directories.
    async fn put(
        &self,
        key: &str,
        value: &[u8],
        options: Option<&WriteOptions>,
    ) -> Result<(), StoreError>;

    /// Get the value at `key` together with its version stamp.
    async fn get(&self, key: &str) -> Result<KVPair, StoreError>;

    /// Delete the value at `key`.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Check if a key exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Watch a single key.
    ///
    /// The stream yields the current value first, then a new pair each time
    /// the value changes. It ends when `stop` is raised, when the stream is
    /// dropped, or when the backend can no longer serve the watch.
    async fn watch(&self, key: &str, stop: Option<StopSignal>) -> Result<KvStream, StoreError>;

    /// Watch the direct children of a directory.
    ///
    /// Each item is a full snapshot of the children. The first snapshot is
    /// sent on subscription, the next ones when the set of children changes.
    async fn watch_tree(
        &self,
        directory: &str,
        stop: Option<StopSignal>,
    ) -> Result<KvListStream, StoreError>;

    /// Create a lock handle on `key`. The lock is not acquired yet.
    async fn new_lock(
        &self,
        key: &str,
        options: Option<LockOptions>,
    ) -> Result<Box<dyn Locker>, StoreError>;

    /// List every key below a directory, at any depth.
    async fn list(&self, directory: &str) -> Result<Vec<KVPair>, StoreError>;

    /// Delete the direct children of a directory in one batch.
    async fn delete_tree(&self, directory: &str) -> Result<(), StoreError>;

    /// Compare-and-swap put.
    ///
    /// With `previous`, the write only applies if the key still carries
    /// `previous.last_index` ([`StoreError::KeyModified`] otherwise). Without
    /// it, the key is created and must not exist ([`StoreError::KeyExists`]).
    ///
    /// A write that does not apply is always reported as an error, so an
    /// `Ok` result carries `true` along with the new pair.
    async fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KVPair>,
        options: Option<&WriteOptions>,
    ) -> Result<(bool, KVPair), StoreError>;

    /// Compare-and-delete. `previous` is required ([`StoreError::PreviousNotSpecified`]
    /// otherwise). As with `atomic_put`, a delete that does not apply is an error.
    async fn atomic_delete(&self, key: &str, previous: Option<&KVPair>)
        -> Result<bool, StoreError>;

    /// Close the connection to the backend.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kvpair_value_serializes_as_bytes() {
        let pair = KVPair::new("/app/leader", b"node-1".to_vec(), 3);
        let json = serde_json::to_value(&pair).unwrap();
        assert_eq!(json["key"], "/app/leader");
        assert_eq!(json["last_index"], 3);
        assert_eq!(json["value"].as_array().unwrap().len(), 6);

        let back: KVPair = serde_json::from_value(json).unwrap();
        assert_eq!(back, pair);
    }

    #[test]
    fn test_write_options_ephemeral() {
        assert!(!WriteOptions::default().is_ephemeral());
        assert!(WriteOptions::with_ttl(Duration::from_secs(5)).is_ephemeral());
    }

    #[test]
    fn test_lock_options_defaults() {
        let options: LockOptions = serde_json::from_str("{}").unwrap();
        assert!(options.value.is_empty());
        assert_eq!(options.ttl, Duration::ZERO);
    }
}
