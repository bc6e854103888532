use kvstore_core::{key, KVPair};
use tracing::debug;

use crate::client::{EventReceiver, Stat, ZkClient, ZkError};

/// Start-of-heading control byte, seen by readers that race a writer
/// between node creation and the first write.
pub(crate) const SOH: u8 = 0x01;

/// Extra reads allowed before a placeholder value is returned as is.
pub(crate) const SYNC_RETRY_LIMIT: usize = 5;

/// Result of a node read.
#[derive(Debug)]
pub(crate) struct NodeRead {
    pub value: Vec<u8>,
    pub stat: Stat,
    pub events: Option<EventReceiver>,
}

impl NodeRead {
    pub fn into_pair(self, key: &str) -> KVPair {
        KVPair::new(key, self.value, version_index(&self.stat))
    }
}

/// Version stamp of a node as a compare token.
pub(crate) fn version_index(stat: &Stat) -> u64 {
    u64::try_from(stat.version).unwrap_or_default()
}

fn is_placeholder(value: &[u8]) -> bool {
    value.is_empty() || value == [SOH]
}

/// Read a node, syncing and retrying a few times while it still holds a
/// placeholder (empty or SOH) value.
///
/// A missing node is reported right away. With `watch`, the returned read
/// carries the watch registered by the last attempt.
pub(crate) async fn get_with_sync_retry(
    client: &dyn ZkClient,
    path: &str,
    watch: bool,
) -> Result<NodeRead, ZkError> {
    let mut attempt = 0;
    loop {
        let read = if watch {
            let (value, stat, events) = client.get_w(path).await?;
            NodeRead {
                value,
                stat,
                events: Some(events),
            }
        } else {
            let (value, stat) = client.get(path).await?;
            NodeRead {
                value,
                stat,
                events: None,
            }
        };

        if !is_placeholder(&read.value) || attempt == SYNC_RETRY_LIMIT {
            return Ok(read);
        }

        attempt += 1;
        debug!("Placeholder value at {}, sync before retry {}", path, attempt);
        client.sync(path).await?;
    }
}

/// Resolve full node paths to pairs.
pub(crate) async fn get_list(client: &dyn ZkClient, paths: &[String]) -> Result<Vec<KVPair>, ZkError> {
    let mut pairs = Vec::with_capacity(paths.len());
    for path in paths {
        let read = get_with_sync_retry(client, path, false).await?;
        pairs.push(read.into_pair(path));
    }
    Ok(pairs)
}

/// Resolve child names of `directory` to pairs keyed by their full path.
pub(crate) async fn get_list_with_path(
    client: &dyn ZkClient,
    directory: &str,
    children: &[String],
) -> Result<Vec<KVPair>, ZkError> {
    let paths: Vec<String> = children
        .iter()
        .map(|child| key::join_key(directory, child))
        .collect();
    get_list(client, &paths).await
}
