use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::{uuid, Uuid};

use crate::error::{Result, VfsError};
use crate::fs::MountTable;
use crate::node::{Location, NodeId};
use crate::storage::{BackendKind, BackendRegistry, LocalStorage, RemoteStorage, SessionStorage};

/// 默认挂载表
const DEFAULT_MOUNTS: [(&str, BackendKind, Uuid); 6] = [
    ("/", BackendKind::Session, Uuid::nil()),
    ("/home", BackendKind::Remote, uuid!("a3771916-158b-47af-a78c-1151538590f0")),
    ("/home/guest", BackendKind::Local, uuid!("897ba474-ff01-4312-bc06-4127dd49fc3c")),
    ("/var/local", BackendKind::Local, uuid!("eb8ac8ed-cc20-4286-aded-1b0810c1e99c")),
    ("/var/remote", BackendKind::Remote, uuid!("3c77ca09-8bb7-4e63-bea8-5c08ec325264")),
    ("/var/session", BackendKind::Session, uuid!("867486bd-2424-40b7-afb1-7e651fbd0bb9")),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// 本地存储的命名空间。共用一个目录的多个会话必须各不相同
    pub session_id: Uuid,
    pub local: LocalConfig,
    /// `None` 表示不启用远程存储
    pub remote: Option<RemoteConfig>,
    pub mounts: Vec<MountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub root: PathBuf,
    pub key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountConfig {
    pub path: String,
    pub backend: BackendKind,
    #[serde(default = "root_id")]
    pub root: NodeId,
}

fn root_id() -> NodeId {
    NodeId::ROOT
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".rvfs"),
            key_prefix: LocalStorage::DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/api".to_string(),
            token: None,
        }
    }
}

impl Default for VfsConfig {
    fn default() -> Self {
        let mounts = DEFAULT_MOUNTS
            .iter()
            .map(|(path, backend, root)| MountConfig {
                path: path.to_string(),
                backend: *backend,
                root: NodeId::from_uuid(*root),
            })
            .collect();
        Self {
            session_id: Uuid::nil(),
            local: LocalConfig::default(),
            remote: Some(RemoteConfig::default()),
            mounts,
        }
    }
}

impl VfsConfig {
    /// 从 JSON 文件读取，缺省的字段取默认值
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: VfsConfig = serde_json::from_str(&text)?;
        debug!("loaded config from {:?}", path);
        Ok(config)
    }

    /// 用 `RVFS_*` 环境变量覆盖配置
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| env::var(name).ok())
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(id) = lookup("RVFS_SESSION_ID") {
            self.session_id = id
                .parse()
                .map_err(|e| VfsError::Config(format!("RVFS_SESSION_ID: {}", e)))?;
        }
        if let Some(root) = lookup("RVFS_LOCAL_ROOT") {
            self.local.root = PathBuf::from(root);
        }
        if let Some(url) = lookup("RVFS_REMOTE_URL") {
            self.remote.get_or_insert_with(RemoteConfig::default).api_url = url;
        }
        if let Some(token) = lookup("RVFS_REMOTE_TOKEN") {
            self.remote.get_or_insert_with(RemoteConfig::default).token = Some(token);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.local.key_prefix.is_empty() || self.local.key_prefix.contains('/') {
            return Err(VfsError::Config(format!(
                "invalid local key prefix: {:?}",
                self.local.key_prefix
            )));
        }
        if let Some(remote) = &self.remote {
            if remote.api_url.is_empty() {
                return Err(VfsError::Config("remote api_url is empty".to_string()));
            }
        }
        for mount in &self.mounts {
            if mount.backend == BackendKind::Remote && self.remote.is_none() {
                return Err(VfsError::Config(format!(
                    "{} is mounted on REMOTE but no remote storage is configured",
                    mount.path
                )));
            }
        }
        self.mount_table()?;
        Ok(())
    }

    pub fn build_registry(&self) -> BackendRegistry {
        let local = LocalStorage::new(self.local.root.clone(), self.session_id)
            .with_key_prefix(self.local.key_prefix.clone());
        let mut registry = BackendRegistry::new()
            .with(BackendKind::Session, SessionStorage::new())
            .with(BackendKind::Local, local);
        if let Some(remote) = &self.remote {
            registry = registry.with(
                BackendKind::Remote,
                RemoteStorage::new(remote.api_url.clone(), remote.token.clone()),
            );
        }
        registry
    }

    pub fn mount_table(&self) -> Result<MountTable> {
        MountTable::new(
            self.mounts
                .iter()
                .map(|m| (m.path.as_str(), Location::new(m.backend, m.root))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = VfsConfig::default();
        config.validate().unwrap();

        let table = config.mount_table().unwrap();
        assert_eq!(table.iter().count(), 6);
        let (mount, sub) = table.find("/home/guest/notes").unwrap();
        assert_eq!(mount.root.backend, BackendKind::Local);
        assert_eq!(sub, "notes");
        assert_eq!(table.find("/").unwrap().0.root, Location::root(BackendKind::Session));

        let registry = config.build_registry();
        assert_eq!(registry.kinds(), BackendKind::ALL.to_vec());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "session_id": "6f1c2d1e-0000-4000-8000-000000000001",
                "local": {{ "root": "/tmp/rvfs-test" }},
                "remote": null,
                "mounts": [
                    {{ "path": "/", "backend": "SESSION" }},
                    {{ "path": "/data", "backend": "LOCAL" }}
                ]
            }}"#
        )
        .unwrap();

        let config = VfsConfig::load(file.path()).unwrap();
        assert_eq!(config.local.root, PathBuf::from("/tmp/rvfs-test"));
        assert_eq!(config.local.key_prefix, LocalStorage::DEFAULT_KEY_PREFIX);
        assert!(config.remote.is_none());
        assert_eq!(config.mounts[1].root, NodeId::ROOT);
        config.validate().unwrap();
        assert!(!config.build_registry().contains(BackendKind::Remote));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("RVFS_SESSION_ID", "6f1c2d1e-0000-4000-8000-000000000002"),
            ("RVFS_LOCAL_ROOT", "/srv/rvfs"),
            ("RVFS_REMOTE_TOKEN", "t0k3n"),
        ]);
        let mut config = VfsConfig {
            remote: None,
            ..Default::default()
        };
        config
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.session_id.to_string(), "6f1c2d1e-0000-4000-8000-000000000002");
        assert_eq!(config.local.root, PathBuf::from("/srv/rvfs"));
        let remote = config.remote.unwrap();
        assert_eq!(remote.token.as_deref(), Some("t0k3n"));
        assert_eq!(remote.api_url, RemoteConfig::default().api_url);

        let mut bad = VfsConfig::default();
        assert!(bad
            .apply_vars(|name| (name == "RVFS_SESSION_ID").then(|| "nope".to_string()))
            .is_err());
    }

    #[test]
    fn test_validate_rejects_bad_mounts() {
        let mut no_remote = VfsConfig::default();
        no_remote.remote = None;
        assert!(matches!(no_remote.validate(), Err(VfsError::Config(_))));

        let mut duplicate = VfsConfig::default();
        duplicate.mounts.push(MountConfig {
            path: "/home".to_string(),
            backend: BackendKind::Session,
            root: NodeId::ROOT,
        });
        assert!(duplicate.validate().is_err());

        let mut rootless = VfsConfig::default();
        rootless.mounts.retain(|m| m.path != "/");
        assert!(rootless.validate().is_err());

        let mut bad_prefix = VfsConfig::default();
        bad_prefix.local.key_prefix = "a/b".to_string();
        assert!(bad_prefix.validate().is_err());
    }
}
