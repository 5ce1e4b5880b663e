use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::node::Node;
use crate::storage::StorageBackend;

/// 进程内易失存储，进程退出即丢失
#[derive(Debug, Default)]
pub struct SessionStorage {
    nodes: RwLock<HashMap<String, Node>>,
}

impl SessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

#[async_trait]
impl StorageBackend for SessionStorage {
    async fn get_node(&self, key: &str) -> Result<Option<Node>> {
        Ok(self.nodes.read().get(key).cloned())
    }

    async fn set_node(&self, key: &str, node: &Node) -> Result<()> {
        debug!("session set_node: {}", key);
        self.nodes.write().insert(key.to_string(), node.clone());
        Ok(())
    }

    async fn delete_node(&self, key: &str) -> Result<()> {
        if self.nodes.write().remove(key).is_some() {
            debug!("session delete_node: {}", key);
        }
        Ok(())
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .nodes
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_delete() {
        let storage = SessionStorage::new();
        assert!(storage.get_node("a").await.unwrap().is_none());

        storage.set_node("a", &Node::file("one")).await.unwrap();
        storage.set_node("a", &Node::file("two")).await.unwrap();
        let node = storage.get_node("a").await.unwrap().unwrap();
        assert_eq!(node.content(), Some(&b"two"[..]));

        storage.delete_node("a").await.unwrap();
        storage.delete_node("a").await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_list_keys_with_prefix() {
        let storage = SessionStorage::new();
        for key in ["dir-1", "dir-2", "file-1"] {
            storage.set_node(key, &Node::directory()).await.unwrap();
        }

        let mut keys = storage.list_keys_with_prefix("dir-").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["dir-1", "dir-2"]);
        assert_eq!(storage.list_keys_with_prefix("").await.unwrap().len(), 3);
        assert!(storage.list_keys_with_prefix("zzz").await.unwrap().is_empty());
    }
}
