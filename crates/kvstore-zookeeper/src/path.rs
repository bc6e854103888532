use kvstore_core::key;

use crate::client::{world_acl, CreateMode, ZkClient, ZkError, PERM_ALL};

/// Normalize a key to a node path.
///
/// ZooKeeper rejects trailing slashes and empty segments, both of which the
/// generic normalization removes.
pub fn normalize(key: &str) -> String {
    key::normalize(key)
}

/// Create every node along `parts`.
///
/// Missing ancestors become persistent empty containers; an ancestor that
/// already exists is fine. The last node is created with `data` and the
/// requested ephemerality, and any error creating it (including
/// [`ZkError::NodeExists`]) is returned to the caller.
pub(crate) async fn create_full_path(
    client: &dyn ZkClient,
    parts: &[&str],
    data: &[u8],
    ephemeral: bool,
) -> Result<(), ZkError> {
    let acl = world_acl(PERM_ALL);
    let Some((leaf, ancestors)) = parts.split_last() else {
        return Ok(());
    };

    let mut path = String::new();
    for part in ancestors {
        path.push('/');
        path.push_str(part);
        match client.create(&path, &[], CreateMode::Persistent, &acl).await {
            Ok(_) | Err(ZkError::NodeExists) => {}
            Err(e) => return Err(e),
        }
    }

    path.push('/');
    path.push_str(leaf);
    client
        .create(&path, data, CreateMode::from_ephemeral(ephemeral), &acl)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ANY_VERSION;
    use crate::memory::MemoryEnsemble;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a/b/"), "/a/b");
        assert_eq!(normalize("/a//b"), "/a/b");
        assert_eq!(normalize(""), "/");
    }

    #[tokio::test]
    async fn test_creates_missing_ancestors() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();

        create_full_path(&client, &["a", "b", "c"], b"leaf", false)
            .await
            .unwrap();

        for path in ["/a", "/a/b", "/a/b/c"] {
            assert!(client.exists(path).await.unwrap().0, "{} missing", path);
        }
        assert!(client.get("/a/b").await.unwrap().0.is_empty());
        assert_eq!(client.get("/a/b/c").await.unwrap().0, b"leaf");
    }

    #[tokio::test]
    async fn test_existing_ancestors_are_reused() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();

        create_full_path(&client, &["a", "b", "c"], b"first", false)
            .await
            .unwrap();
        client.delete("/a/b/c", ANY_VERSION).await.unwrap();

        create_full_path(&client, &["a", "b", "c"], b"second", false)
            .await
            .unwrap();
        assert_eq!(client.get("/a/b/c").await.unwrap().0, b"second");
    }

    #[tokio::test]
    async fn test_existing_leaf_is_an_error() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();

        create_full_path(&client, &["a", "b"], b"first", false)
            .await
            .unwrap();
        let err = create_full_path(&client, &["a", "b"], b"second", false)
            .await
            .unwrap_err();
        assert_eq!(err, ZkError::NodeExists);
        assert_eq!(client.get("/a/b").await.unwrap().0, b"first");
    }

    #[tokio::test]
    async fn test_ephemeral_leaf_under_persistent_ancestors() {
        let ensemble = MemoryEnsemble::new();
        let owner = ensemble.connect();
        let other = ensemble.connect();

        create_full_path(&owner, &["svc", "node-1"], b"up", true)
            .await
            .unwrap();
        owner.expire();

        assert!(other.exists("/svc").await.unwrap().0);
        assert!(!other.exists("/svc/node-1").await.unwrap().0);
    }

    #[tokio::test]
    async fn test_ancestor_failure_aborts() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();

        create_full_path(&client, &["eph"], b"", true).await.unwrap();
        let err = create_full_path(&client, &["eph", "x", "y"], b"", false)
            .await
            .unwrap_err();
        assert_eq!(err, ZkError::NoChildrenForEphemerals);
        assert!(!client.exists("/eph/x/y").await.unwrap().0);
    }
}
