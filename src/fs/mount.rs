use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Result, VfsError};
use crate::fs::path;
use crate::node::Location;

/// 挂载表中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountPoint {
    pub path: String,
    pub root: Location,
}

/// 虚拟路径前缀 -> (后端, 根节点)。
///
/// 按路径分量做最长前缀匹配：`/home` 匹配 `/home/x`，不匹配 `/homer`。
/// 运行期间不可修改。
#[derive(Debug, Clone)]
pub struct MountTable {
    mounts: BTreeMap<String, Location>,
}

impl MountTable {
    pub fn new<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Location)>,
        S: AsRef<str>,
    {
        let mut mounts = BTreeMap::new();
        for (raw, root) in entries {
            let raw = raw.as_ref();
            let normalized = path::absolute(raw);
            if !raw.starts_with('/') || normalized != raw {
                return Err(VfsError::Config(format!(
                    "mount path must be absolute and normalized: {:?}",
                    raw
                )));
            }
            if mounts.insert(normalized, root).is_some() {
                return Err(VfsError::Config(format!("duplicate mount path: {}", raw)));
            }
        }
        if !mounts.contains_key("/") {
            return Err(VfsError::Config("mount table has no root (/) entry".to_string()));
        }
        Ok(Self { mounts })
    }

    /// 最长前缀匹配，返回挂载点和剩余的子路径
    pub fn find(&self, virtual_path: &str) -> Result<(MountPoint, String)> {
        let components = path::normalize(virtual_path);
        for depth in (0..=components.len()).rev() {
            let prefix = path::to_absolute(&components[..depth]);
            if let Some(root) = self.mounts.get(&prefix) {
                let mount = MountPoint {
                    path: prefix,
                    root: *root,
                };
                return Ok((mount, components[depth..].join("/")));
            }
        }
        Err(VfsError::NotFound(virtual_path.to_string()))
    }

    pub fn get(&self, virtual_path: &str) -> Option<Location> {
        self.mounts.get(&path::absolute(virtual_path)).copied()
    }

    pub fn is_mount_root(&self, location: Location) -> bool {
        self.mounts.values().any(|root| *root == location)
    }

    /// 挂载路径在 `virtual_path` 下一层的名字，例如 `/var/local` 对 `/` 给出 `var`
    pub fn children_of(&self, virtual_path: &str) -> Vec<String> {
        let base = path::normalize(virtual_path);
        let mut names: Vec<String> = Vec::new();
        for mount_path in self.mounts.keys() {
            let components = path::normalize(mount_path);
            if components.len() > base.len() && components[..base.len()] == base[..] {
                let name = &components[base.len()];
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = MountPoint> + '_ {
        self.mounts.iter().map(|(path, root)| MountPoint {
            path: path.clone(),
            root: *root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use crate::storage::BackendKind;

    fn table() -> MountTable {
        MountTable::new([
            ("/", Location::root(BackendKind::Session)),
            ("/home", Location::root(BackendKind::Remote)),
            ("/home/guest", Location::new(BackendKind::Local, NodeId::new())),
            ("/var/local", Location::root(BackendKind::Local)),
        ])
        .unwrap()
    }

    #[test]
    fn test_longest_prefix_match() {
        let table = table();

        let (mount, sub) = table.find("/home/guest/docs/a.txt").unwrap();
        assert_eq!(mount.path, "/home/guest");
        assert_eq!(mount.root.backend, BackendKind::Local);
        assert_eq!(sub, "docs/a.txt");

        let (mount, sub) = table.find("/home/other").unwrap();
        assert_eq!(mount.path, "/home");
        assert_eq!(sub, "other");

        let (mount, sub) = table.find("/homer").unwrap();
        assert_eq!(mount.path, "/");
        assert_eq!(sub, "homer");

        let (mount, sub) = table.find("/home/").unwrap();
        assert_eq!(mount.path, "/home");
        assert_eq!(sub, "");
    }

    #[test]
    fn test_children_of() {
        let table = table();
        let mut top = table.children_of("/");
        top.sort();
        assert_eq!(top, vec!["home", "var"]);
        assert_eq!(table.children_of("/home"), vec!["guest"]);
        assert_eq!(table.children_of("/var"), vec!["local"]);
        assert!(table.children_of("/var/local").is_empty());
    }

    #[test]
    fn test_mount_roots() {
        let table = table();
        assert!(table.is_mount_root(Location::root(BackendKind::Remote)));
        assert!(!table.is_mount_root(Location::new(BackendKind::Remote, NodeId::new())));
        assert_eq!(table.get("/home/"), Some(Location::root(BackendKind::Remote)));
        assert_eq!(table.iter().count(), 4);
    }

    #[test]
    fn test_rejects_bad_tables() {
        let session = Location::root(BackendKind::Session);
        assert!(MountTable::new([("/data", session)]).is_err());
        assert!(MountTable::new([("/", session), ("relative", session)]).is_err());
        assert!(MountTable::new([("/", session), ("/a/", session)]).is_err());
        assert!(MountTable::new([("/", session), ("/a", session), ("/a", session)]).is_err());
    }
}
