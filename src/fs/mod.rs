//! 路径解析层：把虚拟路径翻译成 (后端, 节点)，并在锁的保护下维护目录结构。
//!
//! 所有对目录内容的修改都是“加锁 -> 读 -> 改 -> 写 -> 解锁”，锁加在父目录上。
//! 锁总是自上而下获取，持锁期间不会等待祖先目录的锁。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::error::{Result, VfsError};
use crate::gateway::{LockKey, StorageGateway};
use crate::lock::LockId;
use crate::node::{Location, Node, NodeBody, NodeId, NodeKind};

pub mod mount;
pub mod path;
pub mod tree;

pub use mount::{MountPoint, MountTable};
pub use tree::{DirListing, NodeStat, TreeNode};

/// 一次解析中最多穿过的挂载节点数
const MAX_MOUNT_HOPS: usize = 16;

type Memo = HashMap<Location, Option<Node>>;

/// 面向路径的文件系统操作
#[async_trait]
pub trait FileSystem: Send + Sync + fmt::Debug {
    async fn list_directory(&self, path: &str) -> Result<Vec<DirListing>>;
    async fn stat(&self, path: &str) -> Result<NodeStat>;
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;
    /// 缺失的父目录会被创建，已存在的文件被原地覆盖
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<Location>;
    async fn mkdir(&self, path: &str) -> Result<Location>;
    /// 只删除文件、空目录和挂载节点
    async fn remove(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// 穿过挂载节点之后落到的位置
#[derive(Debug, Clone, Copy)]
struct Target {
    location: Location,
    /// 缺失时按空目录处理（根节点、挂载表的根、挂载节点的目标）
    implicit: bool,
}

/// 持有中的目录锁。没有走到 `unlock`（比如 future 被丢弃）时在 drop 里释放
struct DirLock<'a> {
    gateway: &'a StorageGateway,
    key: LockKey,
    id: LockId,
    armed: bool,
}

impl DirLock<'_> {
    async fn unlock(mut self) -> Result<()> {
        self.armed = false;
        self.gateway
            .unlock_node(self.key.backend, &self.key.key, self.id)
            .await
    }
}

impl Drop for DirLock<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("releasing abandoned lock on {}", self.key);
            let _ = self.gateway.locks().release(&self.key, self.id);
        }
    }
}

/// 父目录持锁期间找到的同名子项
enum ChildDir {
    Found(Target),
    /// 挂载节点，等父目录解锁后再跟随
    Mount(Location),
}

fn type_mismatch(path: &str, expected: NodeKind, found: NodeKind) -> VfsError {
    VfsError::TypeMismatch {
        path: path.to_string(),
        expected,
        found,
    }
}

#[derive(Debug)]
pub struct VirtualFileSystem {
    gateway: Arc<StorageGateway>,
    mounts: MountTable,
}

impl VirtualFileSystem {
    pub fn new(gateway: Arc<StorageGateway>, mounts: MountTable) -> Self {
        Self { gateway, mounts }
    }

    pub fn gateway(&self) -> &Arc<StorageGateway> {
        &self.gateway
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// 最长前缀匹配的挂载点，以及挂载点之下的子路径
    pub fn find_mount_point(&self, virtual_path: &str) -> Result<(MountPoint, String)> {
        self.mounts.find(virtual_path)
    }

    /// 从 `root` 出发按子路径逐级查找，最后是挂载节点时返回它的目标
    pub async fn find_file(&self, root: Location, sub_path: &str) -> Result<Location> {
        let (target, _) = self.walk(root, "/", sub_path).await?;
        Ok(target.location)
    }

    /// 逐级创建缺失的目录，已存在的目录原样返回
    pub async fn create_dir(&self, root: Location, sub_path: &str) -> Result<Location> {
        let target = self.create_dir_at(root, "/", sub_path).await?;
        Ok(target.location)
    }

    pub async fn create_file(&self, root: Location, sub_path: &str, content: &[u8]) -> Result<Location> {
        self.create_file_at(root, "/", sub_path, content).await
    }

    /// 虚拟路径对应的位置
    pub async fn resolve(&self, virtual_path: &str) -> Result<Location> {
        let (target, _) = self.lookup(&path::absolute(virtual_path)).await?;
        Ok(target.location)
    }

    /// 在 `virtual_path` 处放一个指向 `target` 的挂载节点
    pub async fn create_mount(&self, virtual_path: &str, target: Location) -> Result<Location> {
        self.gateway.registry().get(target.backend)?;

        let normalized = path::absolute(virtual_path);
        let (mount, sub) = self.mounts.find(&normalized)?;
        let Some((parent_sub, name)) = path::split_parent(&sub) else {
            return Err(VfsError::Conflict(format!(
                "{} is already a mount point",
                normalized
            )));
        };
        let parent_path = path::absolute(&format!("{}/{}", mount.path, parent_sub));
        let parent = self.create_dir_at(mount.root, &mount.path, &parent_sub).await?;

        self.with_dir_lock(parent.location, move |lock| async move {
            let mut dir = self.read_dir_locked(parent, lock, &parent_path).await?;
            if dir.find_child(&name).is_some() {
                return Err(VfsError::Conflict(format!("{} already exists", normalized)));
            }
            let location = self
                .link_new_child(parent, &mut dir, &name, Node::mount(target), lock)
                .await?;
            info!("挂载 {} -> {} ({})", normalized, target, location);
            Ok(location)
        })
        .await
    }

    /// 整棵树的快照；遇到挂载点时切换到挂载的后端
    pub async fn get_tree(&self) -> Result<TreeNode> {
        let mut memo = Memo::new();
        let mut visiting = HashSet::new();
        let root = self.mounts.get("/");
        let tree = self
            .tree_at("/".to_string(), "/".to_string(), root, &mut memo, &mut visiting)
            .await?;
        Ok(tree.unwrap_or_else(|| TreeNode::virtual_dir("/".to_string(), "/".to_string())))
    }

    fn is_implicit_root(&self, location: Location) -> bool {
        location.id.is_root() || self.mounts.is_mount_root(location)
    }

    /// 读取 `start` 处的节点，挂载节点一路跟到底
    async fn open(
        &self,
        start: Location,
        path: &str,
        mut memo: Option<&mut Memo>,
    ) -> Result<(Target, Option<Node>)> {
        let mut target = Target {
            location: start,
            implicit: self.is_implicit_root(start),
        };
        for _ in 0..MAX_MOUNT_HOPS {
            let location = target.location;
            let cached = memo.as_deref_mut().and_then(|m| m.get(&location).cloned());
            let node = match cached {
                Some(node) => node,
                None => {
                    let fetched = self
                        .gateway
                        .get_node(location.backend, &location.id.key(), None)
                        .await?;
                    if let Some(m) = memo.as_deref_mut() {
                        m.insert(location, fetched.clone());
                    }
                    fetched
                }
            };

            match node {
                Some(Node {
                    body: NodeBody::Mount(next),
                    ..
                }) => {
                    debug!("{}: following mount {} -> {}", path, location, next);
                    target = Target {
                        location: next,
                        implicit: true,
                    };
                }
                Some(node) => return Ok((target, Some(node))),
                None if target.implicit => return Ok((target, Some(Node::directory()))),
                None => return Ok((target, None)),
            }
        }
        Err(VfsError::MountLoop(path.to_string()))
    }

    async fn walk(&self, root: Location, base: &str, sub_path: &str) -> Result<(Target, Node)> {
        let (mut current, mut node) = self.open(root, base, None).await?;
        let mut walked = base.to_string();

        for name in path::normalize(sub_path) {
            let dir = node.ok_or_else(|| VfsError::NotFound(walked.clone()))?;
            if dir.kind() != NodeKind::Directory {
                return Err(type_mismatch(&walked, NodeKind::Directory, dir.kind()));
            }
            let child = dir.find_child(&name);
            walked = path::join(&walked, &name);
            let child = child.ok_or_else(|| VfsError::NotFound(walked.clone()))?;
            (current, node) = self
                .open(Location::new(current.location.backend, child), &walked, None)
                .await?;
        }

        let node = node.ok_or(VfsError::NotFound(walked))?;
        Ok((current, node))
    }

    async fn lookup(&self, normalized: &str) -> Result<(Target, Node)> {
        let (mount, sub) = self.mounts.find(normalized)?;
        self.walk(mount.root, &mount.path, &sub).await
    }

    async fn with_dir_lock<T, F, Fut>(&self, dir: Location, op: F) -> Result<T>
    where
        F: FnOnce(LockId) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = LockKey::new(dir.backend, dir.id.key());
        let id = self.gateway.lock_node(dir.backend, &key.key).await?;
        let held = DirLock {
            gateway: &self.gateway,
            key,
            id,
            armed: true,
        };

        let outcome = op(id).await;
        let released = held.unlock().await;
        let value = outcome?;
        released?;
        Ok(value)
    }

    /// 持锁读取目录
    async fn read_dir_locked(&self, dir: Target, lock: LockId, path: &str) -> Result<Node> {
        let location = dir.location;
        let node = match self
            .gateway
            .get_node(location.backend, &location.id.key(), Some(lock))
            .await?
        {
            Some(node) => node,
            None if dir.implicit => Node::directory(),
            None => return Err(VfsError::NotFound(path.to_string())),
        };
        match node.kind() {
            NodeKind::Directory => Ok(node),
            found => Err(type_mismatch(path, NodeKind::Directory, found)),
        }
    }

    /// 先写新节点再写父目录，中途失败只会留下一个没人引用的节点
    async fn link_new_child(
        &self,
        parent: Target,
        dir: &mut Node,
        name: &str,
        node: Node,
        lock: LockId,
    ) -> Result<Location> {
        let backend = parent.location.backend;
        let id = NodeId::new();
        self.gateway.set_node(backend, &id.key(), &node, None).await?;
        dir.add_child(name, id);
        self.gateway
            .set_node(backend, &parent.location.id.key(), dir, Some(lock))
            .await?;
        Ok(Location::new(backend, id))
    }

    async fn create_dir_at(&self, root: Location, base: &str, sub_path: &str) -> Result<Target> {
        let (mut parent, node) = self.open(root, base, None).await?;
        match node {
            Some(node) if node.kind() == NodeKind::Directory => {}
            Some(node) => return Err(type_mismatch(base, NodeKind::Directory, node.kind())),
            None => return Err(VfsError::NotFound(base.to_string())),
        }

        let mut parent_path = base.to_string();
        for name in path::normalize(sub_path) {
            parent = self.ensure_child_dir(parent, &parent_path, &name).await?;
            parent_path = path::join(&parent_path, &name);
        }
        Ok(parent)
    }

    async fn ensure_child_dir(&self, parent: Target, parent_path: &str, name: &str) -> Result<Target> {
        let child_path = path::join(parent_path, name);
        let child_path_ref = child_path.as_str();

        // 持锁期间只读子节点本身，挂载节点在解锁之后再跟随
        let child = self
            .with_dir_lock(parent.location, move |lock| async move {
                let mut dir = self.read_dir_locked(parent, lock, parent_path).await?;

                if let Some(existing) = dir.find_child(name) {
                    let child = Location::new(parent.location.backend, existing);
                    return match self.gateway.get_node(child.backend, &existing.key(), None).await? {
                        Some(node) if node.kind() == NodeKind::Mount => Ok(ChildDir::Mount(child)),
                        Some(node) if node.kind() == NodeKind::Directory => {
                            Ok(ChildDir::Found(Target {
                                location: child,
                                implicit: false,
                            }))
                        }
                        Some(node) => Err(VfsError::Conflict(format!(
                            "{} exists and is a {}",
                            child_path_ref,
                            node.kind()
                        ))),
                        None => Err(VfsError::NotFound(child_path_ref.to_string())),
                    };
                }

                let location = self
                    .link_new_child(parent, &mut dir, name, Node::directory(), lock)
                    .await?;
                info!("创建目录 {} ({})", child_path_ref, location);
                Ok(ChildDir::Found(Target {
                    location,
                    implicit: false,
                }))
            })
            .await?;

        match child {
            ChildDir::Found(target) => Ok(target),
            ChildDir::Mount(mount) => {
                let (target, node) = self.open(mount, &child_path, None).await?;
                match node {
                    Some(node) if node.kind() == NodeKind::Directory => Ok(target),
                    Some(node) => Err(VfsError::Conflict(format!(
                        "{} exists and is a {}",
                        child_path,
                        node.kind()
                    ))),
                    None => Err(VfsError::NotFound(child_path)),
                }
            }
        }
    }

    async fn create_file_at(
        &self,
        root: Location,
        base: &str,
        sub_path: &str,
        content: &[u8],
    ) -> Result<Location> {
        let Some((parent_sub, name)) = path::split_parent(sub_path) else {
            return Err(type_mismatch(base, NodeKind::File, NodeKind::Directory));
        };
        let parent_path = path::absolute(&format!("{}/{}", base, parent_sub));
        let file_path = path::join(&parent_path, &name);
        let parent = self.create_dir_at(root, base, &parent_sub).await?;

        self.with_dir_lock(parent.location, move |lock| async move {
            let mut dir = self.read_dir_locked(parent, lock, &parent_path).await?;

            match dir.find_child(&name) {
                Some(existing) => {
                    let location = Location::new(parent.location.backend, existing);
                    let key = existing.key();
                    let node = match self.gateway.get_node(location.backend, &key, None).await? {
                        Some(mut node) => {
                            if !node.set_content(content) {
                                return Err(type_mismatch(&file_path, NodeKind::File, node.kind()));
                            }
                            node
                        }
                        None => {
                            warn!("{}: 目录项指向的节点不存在，重新写入", file_path);
                            Node::file(content)
                        }
                    };
                    self.gateway.set_node(location.backend, &key, &node, None).await?;
                    debug!("overwrote {} ({} bytes)", file_path, content.len());
                    Ok(location)
                }
                None => {
                    let location = self
                        .link_new_child(parent, &mut dir, &name, Node::file(content), lock)
                        .await?;
                    info!("创建文件 {} ({})", file_path, location);
                    Ok(location)
                }
            }
        })
        .await
    }

    async fn describe(
        &self,
        dir: Location,
        name: String,
        id: NodeId,
        child_path: String,
    ) -> Option<DirListing> {
        let child = Location::new(dir.backend, id);
        match self.open(child, &child_path, None).await {
            Ok((target, Some(node))) => Some(DirListing {
                name,
                kind: node.kind(),
                location: Some(target.location),
                mounted: target.location != child,
            }),
            Ok((_, None)) => {
                warn!("{}: 目录项指向的节点不存在 ({})", child_path, child);
                None
            }
            // 无法解析的挂载仍然列出，但没有位置
            Err(e) => {
                warn!("{}: 无法解析: {}", child_path, e);
                Some(DirListing {
                    name,
                    kind: NodeKind::Mount,
                    location: None,
                    mounted: true,
                })
            }
        }
    }

    fn tree_at<'a>(
        &'a self,
        name: String,
        tree_path: String,
        start: Option<Location>,
        memo: &'a mut Memo,
        visiting: &'a mut HashSet<Location>,
    ) -> BoxFuture<'a, Result<Option<TreeNode>>> {
        async move {
            let mut tree = TreeNode::virtual_dir(name, tree_path);
            let mut entries: Vec<(String, Option<Location>)> = Vec::new();
            let mut entered = None;

            if let Some(start) = start {
                let (target, node) = self.open(start, &tree.path, Some(&mut *memo)).await?;
                let Some(node) = node else {
                    warn!("{}: 目录项指向的节点不存在 ({})", tree.path, start);
                    return Ok(None);
                };
                tree.kind = node.kind();
                tree.size = node.size();
                tree.location = Some(target.location);

                if visiting.insert(target.location) {
                    entered = Some(target.location);
                    let backend = target.location.backend;
                    if let Some(children) = node.children() {
                        entries = children
                            .iter()
                            .map(|e| (e.name.clone(), Some(Location::new(backend, e.id))))
                            .collect();
                    }
                } else {
                    warn!("{}: mount cycle at {}", tree.path, target.location);
                }
            }

            // 挂载表里的路径优先于同名的物理子项
            for child in self.mounts.children_of(&tree.path) {
                let child_path = path::join(&tree.path, &child);
                match self.mounts.get(&child_path) {
                    Some(root) => {
                        entries.retain(|(n, _)| n != &child);
                        entries.push((child, Some(root)));
                    }
                    None if entries.iter().all(|(n, _)| n != &child) => entries.push((child, None)),
                    None => {}
                }
            }

            for (child_name, child_start) in entries {
                let child_path = path::join(&tree.path, &child_name);
                let subtree = self
                    .tree_at(child_name.clone(), child_path.clone(), child_start, &mut *memo, &mut *visiting)
                    .await;
                match subtree {
                    Ok(Some(subtree)) => tree.children.push(subtree),
                    Ok(None) => {}
                    // 无法解析的子项保留名字，没有位置和内容
                    Err(e) => {
                        warn!("{}: 无法解析: {}", child_path, e);
                        let mut placeholder = TreeNode::virtual_dir(child_name, child_path);
                        if !child_start.is_some_and(|l| self.mounts.is_mount_root(l)) {
                            placeholder.kind = NodeKind::Mount;
                        }
                        tree.children.push(placeholder);
                    }
                }
            }

            if let Some(location) = entered {
                visiting.remove(&location);
            }
            Ok(Some(tree))
        }
        .boxed()
    }
}

#[async_trait]
impl FileSystem for VirtualFileSystem {
    async fn list_directory(&self, virtual_path: &str) -> Result<Vec<DirListing>> {
        let normalized = path::absolute(virtual_path);
        let mount_children = self.mounts.children_of(&normalized);

        let mut entries = match self.lookup(&normalized).await {
            Ok((target, node)) => {
                if node.kind() != NodeKind::Directory {
                    return Err(type_mismatch(&normalized, NodeKind::Directory, node.kind()));
                }
                let lookups = node.children().unwrap_or(&[]).iter().map(|entry| {
                    self.describe(
                        target.location,
                        entry.name.clone(),
                        entry.id,
                        path::join(&normalized, &entry.name),
                    )
                });
                join_all(lookups)
                    .await
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
            }
            Err(VfsError::NotFound(_)) if !mount_children.is_empty() => Vec::new(),
            Err(e) => return Err(e),
        };

        for name in mount_children {
            let child_path = path::join(&normalized, &name);
            match self.mounts.get(&child_path) {
                Some(root) => {
                    entries.retain(|e| e.name != name);
                    entries.push(DirListing {
                        name,
                        kind: NodeKind::Directory,
                        location: Some(root),
                        mounted: true,
                    });
                }
                None if entries.iter().all(|e| e.name != name) => entries.push(DirListing {
                    name,
                    kind: NodeKind::Directory,
                    location: None,
                    mounted: false,
                }),
                None => {}
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, virtual_path: &str) -> Result<NodeStat> {
        let normalized = path::absolute(virtual_path);
        match self.lookup(&normalized).await {
            Ok((target, node)) => Ok(NodeStat {
                path: normalized,
                kind: node.kind(),
                location: Some(target.location),
                size: node.size(),
                modified_at: Some(node.modified_at),
            }),
            Err(VfsError::NotFound(_)) if !self.mounts.children_of(&normalized).is_empty() => {
                Ok(NodeStat {
                    path: normalized,
                    kind: NodeKind::Directory,
                    location: None,
                    size: 0,
                    modified_at: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn read_file(&self, virtual_path: &str) -> Result<Vec<u8>> {
        let normalized = path::absolute(virtual_path);
        let (_, node) = self.lookup(&normalized).await?;
        match node.body {
            NodeBody::File(data) => Ok(data),
            NodeBody::Directory(_) => Err(type_mismatch(&normalized, NodeKind::File, NodeKind::Directory)),
            NodeBody::Mount(_) => Err(type_mismatch(&normalized, NodeKind::File, NodeKind::Mount)),
        }
    }

    async fn write_file(&self, virtual_path: &str, content: &[u8]) -> Result<Location> {
        let normalized = path::absolute(virtual_path);
        let (mount, sub) = self.mounts.find(&normalized)?;
        self.create_file_at(mount.root, &mount.path, &sub, content).await
    }

    async fn mkdir(&self, virtual_path: &str) -> Result<Location> {
        let normalized = path::absolute(virtual_path);
        let (mount, sub) = self.mounts.find(&normalized)?;
        let target = self.create_dir_at(mount.root, &mount.path, &sub).await?;
        Ok(target.location)
    }

    async fn remove(&self, virtual_path: &str) -> Result<()> {
        let normalized = path::absolute(virtual_path);
        if self.mounts.get(&normalized).is_some() {
            return Err(VfsError::InvalidPath(format!(
                "cannot remove mount point {}",
                normalized
            )));
        }
        let (mount, sub) = self.mounts.find(&normalized)?;
        let Some((parent_sub, name)) = path::split_parent(&sub) else {
            return Err(VfsError::InvalidPath(normalized));
        };
        let parent_path = path::absolute(&format!("{}/{}", mount.path, parent_sub));
        let (parent, parent_node) = self.walk(mount.root, &mount.path, &parent_sub).await?;
        if parent_node.kind() != NodeKind::Directory {
            return Err(type_mismatch(&parent_path, NodeKind::Directory, parent_node.kind()));
        }

        self.with_dir_lock(parent.location, move |lock| async move {
            let dir = self.read_dir_locked(parent, lock, &parent_path).await?;
            let child_id = dir
                .find_child(&name)
                .ok_or_else(|| VfsError::NotFound(normalized.clone()))?;
            let backend = parent.location.backend;
            let child = Location::new(backend, child_id);

            // 先父后子加锁，检查为空和删除之间子目录不会被改动
            self.with_dir_lock(child, move |child_lock| async move {
                let mut dir = dir;
                match self.gateway.get_node(backend, &child_id.key(), Some(child_lock)).await? {
                    Some(node) if node.kind() == NodeKind::Directory && node.size() > 0 => {
                        return Err(VfsError::Conflict(format!(
                            "directory not empty: {}",
                            normalized
                        )));
                    }
                    Some(_) => {}
                    None => warn!("{}: 删除悬空的目录项", normalized),
                }

                dir.remove_child(&name);
                self.gateway
                    .set_node(backend, &parent.location.id.key(), &dir, Some(lock))
                    .await?;
                self.gateway
                    .delete_node(backend, &child_id.key(), Some(child_lock))
                    .await?;
                info!("删除 {} ({})", normalized, child);
                Ok(())
            })
            .await
        })
        .await
    }

    async fn exists(&self, virtual_path: &str) -> Result<bool> {
        match self.stat(virtual_path).await {
            Ok(_) => Ok(true),
            Err(VfsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
