use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{Result, VfsError};
use crate::node::Node;
use crate::storage::StorageBackend;

/// 本地持久化存储：每个键一个 JSON 文件。
///
/// 物理文件名为 `<前缀>_<会话ID>_<逻辑键>`，同一目录下的多个会话互不干扰。
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
    key_prefix: String,
    session_id: Uuid,
}

impl LocalStorage {
    pub const DEFAULT_KEY_PREFIX: &'static str = "RVFS_LOCAL";

    pub fn new(base_path: PathBuf, session_id: Uuid) -> Self {
        Self {
            base_path,
            key_prefix: Self::DEFAULT_KEY_PREFIX.to_string(),
            session_id,
        }
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn namespace(&self) -> String {
        format!("{}_{}_", self.key_prefix, self.session_id)
    }

    /// 逻辑键 -> 物理文件名
    pub fn physical_key(&self, key: &str) -> Result<String> {
        validate_key(key, false)?;
        Ok(format!("{}{}", self.namespace(), key))
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        Ok(self.base_path.join(self.physical_key(key)?))
    }
}

fn validate_key(key: &str, allow_empty: bool) -> Result<()> {
    let bad_char = key.chars().any(|c| c == '/' || c == '\\' || c == '\0');
    if bad_char || (!allow_empty && key.is_empty()) || key == "." || key == ".." {
        return Err(VfsError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn get_node(&self, key: &str) -> Result<Option<Node>> {
        let full_path = self.path_for(key)?;
        let data = match tokio::fs::read(&full_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VfsError::Io(e)),
        };
        let node = serde_json::from_slice(&data).map_err(|e| {
            error!("get_node: 无法解析 {:?}: {}", full_path, e);
            VfsError::Serialization(e)
        })?;
        Ok(Some(node))
    }

    async fn set_node(&self, key: &str, node: &Node) -> Result<()> {
        let physical = self.physical_key(key)?;
        let full_path = self.base_path.join(&physical);
        let tmp_path = self.base_path.join(format!(".{}.tmp", physical));
        debug!("set_node: writing to {:?}", full_path);

        tokio::fs::create_dir_all(&self.base_path).await.map_err(|e| {
            error!("set_node: failed to create base directory: {:?}", e);
            VfsError::Io(e)
        })?;
        let json = serde_json::to_vec(node)?;
        tokio::fs::write(&tmp_path, &json).await?;
        // 先写临时文件再改名，读者不会看到写了一半的节点
        tokio::fs::rename(&tmp_path, &full_path).await.map_err(|e| {
            error!("set_node: failed to rename {:?}: {:?}", tmp_path, e);
            VfsError::Io(e)
        })
    }

    async fn delete_node(&self, key: &str) -> Result<()> {
        let full_path = self.path_for(key)?;
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => {
                debug!("delete_node: removed {:?}", full_path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VfsError::Io(e)),
        }
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        validate_key(prefix, true)?;
        let namespace = self.namespace();
        let physical_prefix = format!("{}{}", namespace, prefix);
        let mut keys = Vec::new();

        // 目录还没创建过，说明什么都没写过
        if !self.base_path.exists() {
            return Ok(keys);
        }

        let mut dir = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&physical_prefix) {
                    keys.push(name[namespace.len()..].to_string());
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(dir: &TempDir, session: Uuid) -> LocalStorage {
        LocalStorage::new(dir.path().to_path_buf(), session)
    }

    #[tokio::test]
    async fn test_physical_key_layout() {
        let temp_dir = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        let store = storage(&temp_dir, session).with_key_prefix("TEST");

        store.set_node("abc", &Node::file("hi")).await.unwrap();

        let expected = temp_dir.path().join(format!("TEST_{}_abc", session));
        assert!(expected.exists());
        let node = store.get_node("abc").await.unwrap().unwrap();
        assert_eq!(node.content(), Some(&b"hi"[..]));
    }

    #[tokio::test]
    async fn test_missing_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = storage(&temp_dir, Uuid::new_v4());

        assert!(store.get_node("nope").await.unwrap().is_none());
        store.delete_node("nope").await.unwrap();

        store.set_node("k", &Node::directory()).await.unwrap();
        store.delete_node("k").await.unwrap();
        assert!(store.get_node("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sessions_do_not_collide() {
        let temp_dir = TempDir::new().unwrap();
        let first = storage(&temp_dir, Uuid::new_v4());
        let second = storage(&temp_dir, Uuid::new_v4());

        first.set_node("shared", &Node::file("first")).await.unwrap();
        second.set_node("shared", &Node::file("second")).await.unwrap();

        let a = first.get_node("shared").await.unwrap().unwrap();
        let b = second.get_node("shared").await.unwrap().unwrap();
        assert_eq!(a.content(), Some(&b"first"[..]));
        assert_eq!(b.content(), Some(&b"second"[..]));
        assert_eq!(first.list_keys_with_prefix("").await.unwrap(), vec!["shared"]);
    }

    #[tokio::test]
    async fn test_list_returns_logical_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = storage(&temp_dir, Uuid::new_v4());
        assert!(store.list_keys_with_prefix("").await.unwrap().is_empty());

        for key in ["node-1", "node-2", "other"] {
            store.set_node(key, &Node::directory()).await.unwrap();
        }
        let mut keys = store.list_keys_with_prefix("node-").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["node-1", "node-2"]);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        storage(&temp_dir, session)
            .set_node("persist", &Node::file("kept"))
            .await
            .unwrap();

        let reopened = storage(&temp_dir, session);
        let node = reopened.get_node("persist").await.unwrap().unwrap();
        assert_eq!(node.content(), Some(&b"kept"[..]));
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = storage(&temp_dir, Uuid::new_v4());

        for key in ["", "a/b", "..", "a\\b"] {
            assert!(matches!(
                store.set_node(key, &Node::directory()).await,
                Err(VfsError::InvalidKey(_))
            ));
        }
        assert!(matches!(
            store.list_keys_with_prefix("../").await,
            Err(VfsError::InvalidKey(_))
        ));
    }
}
