use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VfsError};
use crate::node::Node;

pub mod local;
pub mod remote;
pub mod session;

pub use local::LocalStorage;
pub use remote::RemoteStorage;
pub use session::SessionStorage;

/// 存储后端种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendKind {
    Session, // 进程内，易失
    Local,   // 本地持久化
    Remote,  // 远程服务
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Session, BackendKind::Local, BackendKind::Remote];

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Session => "SESSION",
            BackendKind::Local => "LOCAL",
            BackendKind::Remote => "REMOTE",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = VfsError;

    fn from_str(s: &str) -> Result<Self> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| VfsError::UnknownBackend(s.to_string()))
    }
}

/// 所有后端的统一契约。后端只负责存储，从不加锁
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// 键不存在时返回 `None`，这不是错误
    async fn get_node(&self, key: &str) -> Result<Option<Node>>;

    /// 无条件覆盖
    async fn set_node(&self, key: &str, node: &Node) -> Result<()>;

    /// 键不存在时也返回成功
    async fn delete_node(&self, key: &str) -> Result<()>;

    /// 返回逻辑键，后端内部的键变换必须还原
    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// 后端注册表：种类 -> 实例
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn StorageBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: BackendKind, backend: impl StorageBackend + 'static) -> Self {
        self.register(kind, Arc::new(backend));
        self
    }

    pub fn register(&mut self, kind: BackendKind, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(kind, backend);
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn StorageBackend>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| VfsError::UnknownBackend(kind.to_string()))
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.backends.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_names() {
        assert_eq!("session".parse::<BackendKind>().unwrap(), BackendKind::Session);
        assert_eq!("LOCAL".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!(BackendKind::Remote.to_string(), "REMOTE");
        assert!(matches!(
            "tape".parse::<BackendKind>(),
            Err(VfsError::UnknownBackend(name)) if name == "tape"
        ));
        assert_eq!(serde_json::to_string(&BackendKind::Session).unwrap(), "\"SESSION\"");
    }

    #[test]
    fn test_registry_lookup() {
        let registry = BackendRegistry::new().with(BackendKind::Session, SessionStorage::new());
        assert!(registry.contains(BackendKind::Session));
        assert!(registry.get(BackendKind::Session).is_ok());
        assert!(matches!(
            registry.get(BackendKind::Remote),
            Err(VfsError::UnknownBackend(_))
        ));
        assert_eq!(registry.kinds(), vec![BackendKind::Session]);
    }
}
