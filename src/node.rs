use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::BackendKind;

/// 节点标识，作用域为 (后端, 标识)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// 每个后端的隐式根目录
    pub const ROOT: NodeId = NodeId(Uuid::nil());

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_nil()
    }

    /// 后端存储使用的键
    pub fn key(&self) -> String {
        self.0.to_string()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// 节点在某个后端中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub backend: BackendKind,
    pub id: NodeId,
}

impl Location {
    pub fn new(backend: BackendKind, id: NodeId) -> Self {
        Self { backend, id }
    }

    pub fn root(backend: BackendKind) -> Self {
        Self::new(backend, NodeId::ROOT)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
    Mount,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::File => "file",
            NodeKind::Directory => "directory",
            NodeKind::Mount => "mount",
        };
        f.write_str(name)
    }
}

/// 目录中的一项；名字只保存在父目录里
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub id: NodeId,
}

/// 挂载节点指向的目标目录
pub type MountTarget = Location;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum NodeBody {
    File(Vec<u8>),
    Directory(Vec<DirEntry>),
    Mount(MountTarget),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub body: NodeBody,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub modified_at: DateTime<Utc>,
}

impl Node {
    fn with_body(body: NodeBody) -> Self {
        Self {
            body,
            metadata: BTreeMap::new(),
            modified_at: Utc::now(),
        }
    }

    pub fn file(content: impl Into<Vec<u8>>) -> Self {
        Self::with_body(NodeBody::File(content.into()))
    }

    pub fn directory() -> Self {
        Self::with_body(NodeBody::Directory(Vec::new()))
    }

    pub fn mount(target: MountTarget) -> Self {
        Self::with_body(NodeBody::Mount(target))
    }

    pub fn kind(&self) -> NodeKind {
        match self.body {
            NodeBody::File(_) => NodeKind::File,
            NodeBody::Directory(_) => NodeKind::Directory,
            NodeBody::Mount(_) => NodeKind::Mount,
        }
    }

    pub fn children(&self) -> Option<&[DirEntry]> {
        match &self.body {
            NodeBody::Directory(children) => Some(children),
            _ => None,
        }
    }

    pub fn find_child(&self, name: &str) -> Option<NodeId> {
        self.children()?
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.id)
    }

    /// 追加子项，调用方需持有该目录的锁。非目录节点返回 false
    pub fn add_child(&mut self, name: impl Into<String>, id: NodeId) -> bool {
        match &mut self.body {
            NodeBody::Directory(children) => {
                children.push(DirEntry {
                    name: name.into(),
                    id,
                });
                self.modified_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn remove_child(&mut self, name: &str) -> Option<NodeId> {
        let NodeBody::Directory(children) = &mut self.body else {
            return None;
        };
        let index = children.iter().position(|entry| entry.name == name)?;
        let removed = children.remove(index);
        self.modified_at = Utc::now();
        Some(removed.id)
    }

    pub fn set_content(&mut self, content: impl Into<Vec<u8>>) -> bool {
        match &mut self.body {
            NodeBody::File(data) => {
                *data = content.into();
                self.modified_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn content(&self) -> Option<&[u8]> {
        match &self.body {
            NodeBody::File(data) => Some(data),
            _ => None,
        }
    }

    pub fn mount_target(&self) -> Option<MountTarget> {
        match self.body {
            NodeBody::Mount(target) => Some(target),
            _ => None,
        }
    }

    /// 文件为字节数，目录为子项数
    pub fn size(&self) -> usize {
        match &self.body {
            NodeBody::File(data) => data.len(),
            NodeBody::Directory(children) => children.len(),
            NodeBody::Mount(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_id_is_nil() {
        assert!(NodeId::ROOT.is_root());
        assert!(!NodeId::new().is_root());
        assert_eq!(NodeId::ROOT.key(), "00000000-0000-0000-0000-000000000000");
        assert_ne!(NodeId::new(), NodeId::new());
    }

    #[test]
    fn test_node_json_shape() {
        let node = Node::directory();
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["body"]["type"], "directory");
        assert_eq!(value["body"]["content"], serde_json::json!([]));

        let target = Location::new(BackendKind::Remote, NodeId::ROOT);
        let mount = serde_json::to_value(Node::mount(target)).unwrap();
        assert_eq!(mount["body"]["type"], "mount");
        assert_eq!(mount["body"]["content"]["backend"], "REMOTE");

        let back: Node = serde_json::from_value(mount).unwrap();
        assert_eq!(back.mount_target(), Some(target));
    }

    #[test]
    fn test_directory_children() {
        let mut dir = Node::directory();
        let a = NodeId::new();
        assert!(dir.add_child("a", a));
        assert_eq!(dir.find_child("a"), Some(a));
        assert_eq!(dir.find_child("b"), None);
        assert_eq!(dir.size(), 1);

        assert_eq!(dir.remove_child("a"), Some(a));
        assert_eq!(dir.remove_child("a"), None);
        assert_eq!(dir.size(), 0);
    }

    #[test]
    fn test_kind_specific_helpers() {
        let mut file = Node::file("hi");
        assert_eq!(file.kind(), NodeKind::File);
        assert!(!file.add_child("x", NodeId::new()));
        assert!(file.set_content("bye"));
        assert_eq!(file.content(), Some(&b"bye"[..]));
        assert!(file.children().is_none());

        let mut dir = Node::directory();
        assert!(!dir.set_content("nope"));
        assert!(dir.content().is_none());
    }
}
