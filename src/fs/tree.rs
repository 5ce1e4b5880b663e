use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::node::{Location, NodeKind};

/// 整个虚拟文件系统的快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub kind: NodeKind,
    /// 只由挂载表撑出来的中间目录没有物理位置
    pub location: Option<Location>,
    pub size: usize,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub(crate) fn virtual_dir(name: String, path: String) -> Self {
        Self {
            name,
            path,
            kind: NodeKind::Directory,
            location: None,
            size: 0,
            children: Vec::new(),
        }
    }

    /// 按路径查找子树
    pub fn find(&self, path: &str) -> Option<&TreeNode> {
        let mut current = self;
        for name in crate::fs::path::normalize(path) {
            current = current.children.iter().find(|c| c.name == name)?;
        }
        Some(current)
    }

    /// 画成 `tree` 命令的样子
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(if self.path == "/" { "/" } else { &self.name });
        out.push('\n');
        render_children(&self.children, "", &mut out);
        out
    }
}

fn render_children(children: &[TreeNode], prefix: &str, out: &mut String) {
    let mut sorted: Vec<&TreeNode> = children.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    for (i, child) in sorted.iter().enumerate() {
        let last = i + 1 == sorted.len();
        out.push_str(prefix);
        out.push_str(if last { "└── " } else { "├── " });
        out.push_str(&child.name);
        out.push('\n');

        let next = format!("{}{}", prefix, if last { "    " } else { "│   " });
        render_children(&child.children, &next, out);
    }
}

/// `list_directory` 返回的一项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirListing {
    pub name: String,
    pub kind: NodeKind,
    pub location: Option<Location>,
    /// 通过挂载（挂载表或挂载节点）接入的目录
    pub mounted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStat {
    pub path: String,
    pub kind: NodeKind,
    pub location: Option<Location>,
    pub size: usize,
    pub modified_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, path: &str) -> TreeNode {
        TreeNode {
            name: name.into(),
            path: path.into(),
            kind: NodeKind::File,
            location: None,
            size: 1,
            children: Vec::new(),
        }
    }

    #[test]
    fn test_render_sorts_and_draws_branches() {
        let mut root = TreeNode::virtual_dir("/".into(), "/".into());
        let mut b = TreeNode::virtual_dir("b".into(), "/b".into());
        b.children.push(leaf("z.txt", "/b/z.txt"));
        b.children.push(leaf("y.txt", "/b/y.txt"));
        root.children.push(b);
        root.children.push(leaf("a.txt", "/a.txt"));

        let expected = "/\n\
                        ├── a.txt\n\
                        └── b\n    \
                        ├── y.txt\n    \
                        └── z.txt\n";
        assert_eq!(root.render(), expected);
    }

    #[test]
    fn test_find() {
        let mut root = TreeNode::virtual_dir("/".into(), "/".into());
        let mut b = TreeNode::virtual_dir("b".into(), "/b".into());
        b.children.push(leaf("c", "/b/c"));
        root.children.push(b);

        assert_eq!(root.find("/b/c").map(|n| n.kind), Some(NodeKind::File));
        assert_eq!(root.find("/").map(|n| n.path.as_str()), Some("/"));
        assert!(root.find("/nope").is_none());
    }
}
