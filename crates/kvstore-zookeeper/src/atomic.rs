use kvstore_core::{key, KVPair, StoreError};
use tracing::debug;

use crate::client::{world_acl, CreateMode, ZkClient, ZkError, PERM_ALL};
use crate::path::{create_full_path, normalize};
use crate::read::version_index;

/// Node version a compare token stands for. Tokens outside the version
/// range cannot match any node.
fn expected_version(previous: &KVPair) -> Result<i32, StoreError> {
    i32::try_from(previous.last_index).map_err(|_| StoreError::KeyModified)
}

/// Compare-and-swap write.
///
/// With `previous`, a conditional set on its version. Without, a create
/// that must not find the node, building missing parents on the way.
pub(crate) async fn atomic_put(
    client: &dyn ZkClient,
    key: &str,
    value: &[u8],
    previous: Option<&KVPair>,
) -> Result<KVPair, StoreError> {
    let path = normalize(key);

    let last_index = match previous {
        Some(previous) => {
            let version = expected_version(previous)?;
            let stat = client.set(&path, value, version).await?;
            version_index(&stat)
        }
        None => {
            let acl = world_acl(PERM_ALL);
            match client.create(&path, value, CreateMode::Persistent, &acl).await {
                Ok(_) => {}
                Err(ZkError::NoNode) => {
                    debug!("Parent of {} missing, creating full path", path);
                    create_full_path(client, &key::split_key(key), value, false).await?;
                }
                Err(e) => return Err(e.into()),
            }
            0
        }
    };

    Ok(KVPair::new(key, value, last_index))
}

/// Compare-and-delete. Refuses to run without a previous pair.
pub(crate) async fn atomic_delete(
    client: &dyn ZkClient,
    key: &str,
    previous: Option<&KVPair>,
) -> Result<bool, StoreError> {
    let previous = previous.ok_or(StoreError::PreviousNotSpecified)?;
    let version = expected_version(previous)?;
    client.delete(&normalize(key), version).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ANY_VERSION;
    use crate::memory::MemoryEnsemble;

    #[tokio::test]
    async fn test_create_when_absent() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();

        let pair = atomic_put(&client, "a/b/c", b"v", None).await.unwrap();
        assert_eq!(pair, KVPair::new("a/b/c", b"v".to_vec(), 0));
        assert_eq!(client.get("/a/b/c").await.unwrap().0, b"v");
        assert!(client.get("/a/b").await.unwrap().0.is_empty());
    }

    #[tokio::test]
    async fn test_create_when_present_fails() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();

        atomic_put(&client, "k", b"v1", None).await.unwrap();
        let err = atomic_put(&client, "k", b"v2", None).await.unwrap_err();
        assert_eq!(err, StoreError::KeyExists);
        assert_eq!(client.get("/k").await.unwrap().0, b"v1");
    }

    #[tokio::test]
    async fn test_swap_requires_matching_version() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();

        let first = atomic_put(&client, "k", b"v1", None).await.unwrap();
        let second = atomic_put(&client, "k", b"v2", Some(&first)).await.unwrap();
        assert_eq!(second.last_index, first.last_index + 1);
        assert_eq!(second.value, b"v2");

        // The stale token no longer matches.
        let err = atomic_put(&client, "k", b"v3", Some(&first)).await.unwrap_err();
        assert_eq!(err, StoreError::KeyModified);
        assert_eq!(client.get("/k").await.unwrap().0, b"v2");
    }

    #[tokio::test]
    async fn test_swap_on_missing_key() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();

        let ghost = KVPair::new("k", b"v".to_vec(), 0);
        let err = atomic_put(&client, "k", b"v", Some(&ghost)).await.unwrap_err();
        assert_eq!(err, StoreError::KeyNotFound);
    }

    #[tokio::test]
    async fn test_out_of_range_token_is_a_conflict() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();
        atomic_put(&client, "k", b"v", None).await.unwrap();

        let bogus = KVPair::new("k", b"v".to_vec(), u64::MAX);
        assert_eq!(
            atomic_put(&client, "k", b"x", Some(&bogus)).await,
            Err(StoreError::KeyModified)
        );
        assert_eq!(
            atomic_delete(&client, "k", Some(&bogus)).await,
            Err(StoreError::KeyModified)
        );
    }

    #[tokio::test]
    async fn test_delete_requires_previous() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();
        atomic_put(&client, "k", b"v", None).await.unwrap();

        let before = ensemble.requests();
        let err = atomic_delete(&client, "k", None).await.unwrap_err();
        assert_eq!(err, StoreError::PreviousNotSpecified);
        assert_eq!(ensemble.requests(), before);
    }

    #[tokio::test]
    async fn test_delete_checks_version() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();

        let first = atomic_put(&client, "k", b"v1", None).await.unwrap();
        client.set("/k", b"v2", ANY_VERSION).await.unwrap();

        assert_eq!(
            atomic_delete(&client, "k", Some(&first)).await,
            Err(StoreError::KeyModified)
        );

        let (_, stat) = client.get("/k").await.unwrap();
        let current = KVPair::new("k", b"v2".to_vec(), version_index(&stat));
        assert_eq!(atomic_delete(&client, "k", Some(&current)).await, Ok(true));
        assert!(!client.exists("/k").await.unwrap().0);
    }
}
