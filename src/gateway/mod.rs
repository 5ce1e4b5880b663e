//! 带闸门的存储访问入口。
//!
//! 每一次后端调用都先经过按 (后端, 键) 分片的锁表，再交给对应的后端执行。
//! 不带令牌的调用排队执行；带令牌的调用必须是当前持锁者，否则直接失败。

use std::fmt;
use std::future::Future;

use tracing::{debug, error};

use crate::error::{Result, VfsError};
use crate::lock::{KeyLocks, LockId};
use crate::node::Node;
use crate::storage::{BackendKind, BackendRegistry};

pub mod request;

pub use request::{Operation, RequestData, StorageRequest, StorageResponse};

/// 锁表的键：同一个键名在不同后端里互不相关
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub backend: BackendKind,
    pub key: String,
}

impl LockKey {
    pub fn new(backend: BackendKind, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.key)
    }
}

#[derive(Debug)]
pub struct StorageGateway {
    registry: BackendRegistry,
    locks: KeyLocks<LockKey>,
}

impl StorageGateway {
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry,
            locks: KeyLocks::new(),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn locks(&self) -> &KeyLocks<LockKey> {
        &self.locks
    }

    async fn gated<T, Fut>(&self, lock_key: LockKey, lock: Option<LockId>, op: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let result = match lock {
            Some(id) => self.locks.with_lock(&lock_key, id, op).await,
            None => self.locks.run(&lock_key, op).await,
        };
        if let Err(e) = &result {
            log_failure(&lock_key, e);
        }
        result
    }

    pub async fn get_node(
        &self,
        backend: BackendKind,
        key: &str,
        lock: Option<LockId>,
    ) -> Result<Option<Node>> {
        let storage = self.registry.get(backend)?;
        self.gated(LockKey::new(backend, key), lock, async move {
            storage.get_node(key).await
        })
        .await
    }

    pub async fn set_node(
        &self,
        backend: BackendKind,
        key: &str,
        node: &Node,
        lock: Option<LockId>,
    ) -> Result<()> {
        let storage = self.registry.get(backend)?;
        self.gated(LockKey::new(backend, key), lock, async move {
            storage.set_node(key, node).await
        })
        .await
    }

    pub async fn delete_node(
        &self,
        backend: BackendKind,
        key: &str,
        lock: Option<LockId>,
    ) -> Result<()> {
        let storage = self.registry.get(backend)?;
        self.gated(LockKey::new(backend, key), lock, async move {
            storage.delete_node(key).await
        })
        .await
    }

    /// 前缀本身作为闸门的键
    pub async fn list_keys_with_prefix(
        &self,
        backend: BackendKind,
        prefix: &str,
        lock: Option<LockId>,
    ) -> Result<Vec<String>> {
        let storage = self.registry.get(backend)?;
        self.gated(LockKey::new(backend, prefix), lock, async move {
            storage.list_keys_with_prefix(prefix).await
        })
        .await
    }

    /// 获取显式锁。闸门一直关着，直到 `unlock_node`
    pub async fn lock_node(&self, backend: BackendKind, key: &str) -> Result<LockId> {
        self.registry.get(backend)?;
        Ok(self.locks.acquire(&LockKey::new(backend, key)).await)
    }

    pub async fn unlock_node(&self, backend: BackendKind, key: &str, lock: LockId) -> Result<()> {
        self.registry.get(backend)?;
        let lock_key = LockKey::new(backend, key);
        self.locks.release(&lock_key, lock).map_err(|e| {
            log_failure(&lock_key, &e);
            e
        })
    }
}

fn log_failure(lock_key: &LockKey, err: &VfsError) {
    if err.is_internal_misuse() {
        error!("unexpected storage failure on {}: {}", lock_key, err);
    } else {
        debug!("storage operation on {} failed: {}", lock_key, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RemoteStorage, SessionStorage};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    fn gateway() -> Arc<StorageGateway> {
        let registry = BackendRegistry::new()
            .with(BackendKind::Session, SessionStorage::new())
            .with(BackendKind::Remote, RemoteStorage::new("http://127.0.0.1:9/api", None));
        Arc::new(StorageGateway::new(registry))
    }

    #[tokio::test]
    async fn test_plain_operations() {
        let gw = gateway();
        let b = BackendKind::Session;

        assert!(gw.get_node(b, "k", None).await.unwrap().is_none());
        gw.set_node(b, "k", &Node::file("v"), None).await.unwrap();
        let node = gw.get_node(b, "k", None).await.unwrap().unwrap();
        assert_eq!(node.content(), Some(&b"v"[..]));
        assert_eq!(gw.list_keys_with_prefix(b, "", None).await.unwrap(), vec!["k"]);
        gw.delete_node(b, "k", None).await.unwrap();
        assert!(gw.get_node(b, "k", None).await.unwrap().is_none());

        assert_eq!(gw.locks().active_keys(), 0);
    }

    #[tokio::test]
    async fn test_read_modify_write_under_lock() {
        let gw = gateway();
        let b = BackendKind::Session;
        gw.set_node(b, "dir", &Node::directory(), None).await.unwrap();

        let lock = gw.lock_node(b, "dir").await.unwrap();
        let reader = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.get_node(b, "dir", None).await })
        };
        sleep(Duration::from_millis(30)).await;
        assert!(!reader.is_finished());

        let mut dir = gw.get_node(b, "dir", Some(lock)).await.unwrap().unwrap();
        dir.add_child("child", crate::node::NodeId::new());
        gw.set_node(b, "dir", &dir, Some(lock)).await.unwrap();
        gw.unlock_node(b, "dir", lock).await.unwrap();

        // 排在锁后面的读取看到的是修改后的目录
        let seen = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(seen.size(), 1);
        assert!(gw.locks().is_idle(&LockKey::new(b, "dir")));
    }

    #[tokio::test]
    async fn test_lock_violation_is_fatal() {
        let gw = gateway();
        let b = BackendKind::Session;
        let lock = gw.lock_node(b, "k").await.unwrap();

        let stranger = LockId::fresh();
        assert!(matches!(
            gw.get_node(b, "k", Some(stranger)).await,
            Err(VfsError::LockViolation { .. })
        ));
        assert!(matches!(
            gw.unlock_node(b, "k", stranger).await,
            Err(VfsError::LockViolation { .. })
        ));
        // 令牌只对加锁的那个键有效
        assert!(gw.get_node(b, "other", Some(lock)).await.is_err());

        gw.unlock_node(b, "k", lock).await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_errors_pass_through_and_release() {
        let gw = gateway();
        let b = BackendKind::Remote;

        assert!(matches!(
            gw.get_node(b, "k", None).await,
            Err(VfsError::AuthRequired)
        ));
        assert!(gw.locks().is_idle(&LockKey::new(b, "k")));

        assert!(matches!(
            gw.get_node(BackendKind::Local, "k", None).await,
            Err(VfsError::UnknownBackend(_))
        ));
        assert!(matches!(
            gw.lock_node(BackendKind::Local, "k").await,
            Err(VfsError::UnknownBackend(_))
        ));
    }

    #[tokio::test]
    async fn test_same_key_in_different_backends_is_independent() {
        let gw = gateway();
        let lock = gw.lock_node(BackendKind::Session, "shared").await.unwrap();

        let other = tokio::time::timeout(
            Duration::from_secs(1),
            gw.lock_node(BackendKind::Remote, "shared"),
        )
        .await
        .unwrap()
        .unwrap();

        gw.unlock_node(BackendKind::Session, "shared", lock).await.unwrap();
        gw.unlock_node(BackendKind::Remote, "shared", other).await.unwrap();
        assert_eq!(gw.locks().active_keys(), 0);
    }
}
