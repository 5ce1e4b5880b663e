use thiserror::Error;

use crate::node::NodeKind;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Not a {expected}: {path} is a {found}")]
    TypeMismatch {
        path: String,
        expected: NodeKind,
        found: NodeKind,
    },

    #[error("Invalid lock id '{supplied}' for '{key}' (current lock: {current})")]
    LockViolation {
        key: String,
        supplied: String,
        current: String,
    },

    #[error("Authentication required")]
    AuthRequired,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unknown storage backend: {0}")]
    UnknownBackend(String),

    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Too many mount hops while resolving {0}")]
    MountLoop(String),

    #[error("Remote storage error: {0}")]
    Remote(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl VfsError {
    /// 锁 ID 不匹配和缺少凭证属于调用方的误用，而不是正常的失败
    pub fn is_internal_misuse(&self) -> bool {
        matches!(self, VfsError::LockViolation { .. } | VfsError::AuthRequired)
    }
}

pub type Result<T> = std::result::Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misuse_classification() {
        assert!(VfsError::AuthRequired.is_internal_misuse());
        assert!(VfsError::LockViolation {
            key: "k".into(),
            supplied: "a".into(),
            current: "none".into(),
        }
        .is_internal_misuse());
        assert!(!VfsError::NotFound("/x".into()).is_internal_misuse());
        assert!(!VfsError::Conflict("/x".into()).is_internal_misuse());
    }

    #[test]
    fn test_messages_are_readable() {
        let err = VfsError::TypeMismatch {
            path: "/a/b".into(),
            expected: NodeKind::Directory,
            found: NodeKind::File,
        };
        assert_eq!(err.to_string(), "Not a directory: /a/b is a file");
        assert_eq!(
            VfsError::NotFound("/nope".into()).to_string(),
            "No such file or directory: /nope"
        );
    }
}
