use futures::future::{BoxFuture, FutureExt};
use kvstore_core::key;

use crate::client::{ZkClient, ZkError};

/// Names of the direct children of `directory`.
pub(crate) async fn list_children(
    client: &dyn ZkClient,
    directory: &str,
) -> Result<Vec<String>, ZkError> {
    client.children(directory).await
}

/// Append the full path of every node below `directory` to `list`.
///
/// Depth-first, each node after its own descendants. Nodes that refuse to
/// list children because they are ephemeral count as leaves.
pub(crate) fn list_children_recursive<'a>(
    client: &'a dyn ZkClient,
    list: &'a mut Vec<String>,
    directory: &'a str,
) -> BoxFuture<'a, Result<(), ZkError>> {
    async move {
        let children = list_children(client, directory).await?;

        for child in children {
            let path = key::join_key(directory, &child);
            match list_children_recursive(client, list, &path).await {
                Ok(()) | Err(ZkError::NoChildrenForEphemerals) => {}
                Err(e) => return Err(e),
            }
            list.push(path);
        }
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::client::CreateMode;
    use crate::memory::{MemoryBackend, MemoryEnsemble};

    async fn create(client: &MemoryBackend, path: &str, mode: CreateMode) {
        client.create(path, b"x", mode, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_lists_subtree_post_order() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();
        create(&client, "/a", CreateMode::Persistent).await;
        create(&client, "/a/b", CreateMode::Persistent).await;
        create(&client, "/a/c", CreateMode::Persistent).await;
        create(&client, "/a/c/d", CreateMode::Persistent).await;

        let mut list = Vec::new();
        list_children_recursive(&client, &mut list, "/a")
            .await
            .unwrap();

        assert_eq!(list.len(), 3);
        let set: HashSet<&str> = list.iter().map(String::as_str).collect();
        assert_eq!(set, HashSet::from(["/a/b", "/a/c/d", "/a/c"]));

        let pos = |p: &str| list.iter().position(|x| x == p).unwrap();
        assert!(pos("/a/c/d") < pos("/a/c"));
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();
        create(&client, "/empty", CreateMode::Persistent).await;

        let mut list = Vec::new();
        list_children_recursive(&client, &mut list, "/empty")
            .await
            .unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_ephemeral_children_are_leaves() {
        let ensemble = MemoryEnsemble::new();
        ensemble.reject_ephemeral_children(true);
        let client = ensemble.connect();
        create(&client, "/svc", CreateMode::Persistent).await;
        create(&client, "/svc/node-1", CreateMode::Ephemeral).await;
        create(&client, "/svc/node-2", CreateMode::Ephemeral).await;

        let mut list = Vec::new();
        list_children_recursive(&client, &mut list, "/svc")
            .await
            .unwrap();
        assert_eq!(list, vec!["/svc/node-1", "/svc/node-2"]);
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();

        let mut list = Vec::new();
        let err = list_children_recursive(&client, &mut list, "/missing")
            .await
            .unwrap_err();
        assert_eq!(err, ZkError::NoNode);
    }
}
