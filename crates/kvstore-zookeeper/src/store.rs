use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use kvstore_core::{
    key, Backend, KVPair, KvListStream, KvStream, LockOptions, Locker, StopSignal, Store,
    StoreConfig, StoreError, StoreRegistry, WriteOptions,
};
use tracing::{debug, info, instrument};

use crate::atomic;
use crate::client::{Connector, DeleteRequest, ZkClient, ZkError, ANY_VERSION};
use crate::lock::ZkLock;
use crate::path::{create_full_path, normalize};
use crate::read::{get_list, get_with_sync_retry};
use crate::tree::{list_children, list_children_recursive};
use crate::watch::{watch_directory, watch_key};

/// Session timeout when the configuration leaves it unset.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Times `list` starts over when a listed node disappears before it is read.
const LIST_RETRY_LIMIT: usize = 5;

/// [`Store`] over a ZooKeeper session.
///
/// Keys map to node paths (`a/b` is `/a/b`). Version stamps are node data
/// versions; TTL writes become ephemeral nodes tied to the session.
pub struct ZooKeeper {
    client: Arc<dyn ZkClient>,
    timeout: Duration,
}

impl ZooKeeper {
    /// Wrap an established session.
    pub fn new(client: Arc<dyn ZkClient>) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Open a session on `endpoints`.
    pub async fn connect(
        connector: &dyn Connector,
        endpoints: &[String],
        config: Option<&StoreConfig>,
    ) -> Result<Self, StoreError> {
        if endpoints.is_empty() {
            return Err(StoreError::InvalidArgument(
                "at least one endpoint is required".to_string(),
            ));
        }

        let timeout = config
            .and_then(StoreConfig::connection_timeout)
            .unwrap_or(DEFAULT_TIMEOUT);
        let tls = config.and_then(StoreConfig::tls);

        info!(
            "Connecting to ZooKeeper at {} (session timeout {:?})",
            endpoints.join(","),
            timeout
        );
        let client = connector.connect(endpoints, timeout, tls.as_ref()).await?;

        Ok(Self { client, timeout })
    }

    /// Session timeout negotiated at connection.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Register the ZooKeeper backend, opening sessions through `connector`.
pub fn register(registry: &mut StoreRegistry, connector: Arc<dyn Connector>) {
    registry.add_store(
        Backend::Zookeeper,
        Arc::new(move |endpoints, config| open(connector.clone(), endpoints, config).boxed()),
    );
}

async fn open(
    connector: Arc<dyn Connector>,
    endpoints: Vec<String>,
    config: Option<StoreConfig>,
) -> Result<Arc<dyn Store>, StoreError> {
    let store = ZooKeeper::connect(connector.as_ref(), &endpoints, config.as_ref()).await?;
    Ok(Arc::new(store))
}

#[async_trait]
impl Store for ZooKeeper {
    fn backend_name(&self) -> &'static str {
        "zk"
    }

    #[instrument(skip(self, value, options), level = "debug", fields(value_len = value.len()))]
    async fn put(
        &self,
        key: &str,
        value: &[u8],
        options: Option<&WriteOptions>,
    ) -> Result<(), StoreError> {
        let path = normalize(key);

        if self.exists(key).await? {
            self.client.set(&path, value, ANY_VERSION).await?;
            return Ok(());
        }

        let ephemeral = options.is_some_and(WriteOptions::is_ephemeral);
        match create_full_path(self.client.as_ref(), &key::split_key(key), value, ephemeral).await {
            Ok(()) => Ok(()),
            Err(ZkError::NodeExists) => {
                debug!("{} created concurrently, overwriting", path);
                self.client.set(&path, value, ANY_VERSION).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<KVPair, StoreError> {
        let read = get_with_sync_retry(self.client.as_ref(), &normalize(key), false).await?;
        Ok(read.into_pair(key))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client.delete(&normalize(key), ANY_VERSION).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let (exists, _) = self.client.exists(&normalize(key)).await?;
        Ok(exists)
    }

    #[instrument(skip(self, stop), level = "debug")]
    async fn watch(&self, key: &str, stop: Option<StopSignal>) -> Result<KvStream, StoreError> {
        let path = normalize(key);
        let initial = get_with_sync_retry(self.client.as_ref(), &path, true).await?;
        Ok(watch_key(
            self.client.clone(),
            key.to_string(),
            path,
            initial,
            stop,
        ))
    }

    #[instrument(skip(self, stop), level = "debug")]
    async fn watch_tree(
        &self,
        directory: &str,
        stop: Option<StopSignal>,
    ) -> Result<KvListStream, StoreError> {
        let path = normalize(directory);
        let initial = self.client.children_w(&path).await?;
        Ok(watch_directory(self.client.clone(), path, initial, stop))
    }

    #[instrument(skip(self, options), level = "debug")]
    async fn new_lock(
        &self,
        key: &str,
        options: Option<LockOptions>,
    ) -> Result<Box<dyn Locker>, StoreError> {
        let value = options.map(|o| o.value).unwrap_or_default();
        Ok(Box::new(ZkLock::new(
            self.client.clone(),
            normalize(key),
            value,
        )))
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, directory: &str) -> Result<Vec<KVPair>, StoreError> {
        let path = normalize(directory);
        let client = self.client.as_ref();

        let mut attempt = 0;
        loop {
            let mut keys = Vec::new();
            list_children_recursive(client, &mut keys, &path).await?;

            match get_list(client, &keys).await {
                Ok(pairs) => return Ok(pairs),
                Err(ZkError::NoNode) if attempt < LIST_RETRY_LIMIT => {
                    attempt += 1;
                    debug!("Listing of {} went stale, retry {}", path, attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_tree(&self, directory: &str) -> Result<(), StoreError> {
        let path = normalize(directory);
        let children = list_children(self.client.as_ref(), &path).await?;
        if children.is_empty() {
            return Ok(());
        }

        let requests: Vec<DeleteRequest> = children
            .iter()
            .map(|child| DeleteRequest {
                path: key::join_key(&path, child),
                version: ANY_VERSION,
            })
            .collect();
        self.client.multi(&requests).await?;

        debug!("Deleted {} children of {}", requests.len(), path);
        Ok(())
    }

    #[instrument(skip(self, value, previous, _options), level = "debug")]
    async fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KVPair>,
        _options: Option<&WriteOptions>,
    ) -> Result<(bool, KVPair), StoreError> {
        let pair = atomic::atomic_put(self.client.as_ref(), key, value, previous).await?;
        Ok((true, pair))
    }

    #[instrument(skip(self, previous), level = "debug")]
    async fn atomic_delete(
        &self,
        key: &str,
        previous: Option<&KVPair>,
    ) -> Result<bool, StoreError> {
        atomic::atomic_delete(self.client.as_ref(), key, previous).await
    }

    async fn close(&self) {
        self.client.close().await;
    }
}
