pub mod config;
pub mod error;
pub mod fs;
pub mod gateway;
pub mod lock;
pub mod node;
pub mod storage;

pub use config::{MountConfig, VfsConfig};
pub use error::{Result, VfsError};
pub use fs::{DirListing, FileSystem, MountTable, NodeStat, TreeNode, VirtualFileSystem};
pub use gateway::{StorageGateway, StorageRequest, StorageResponse};
pub use lock::{KeyLocks, LockId};
pub use node::{Location, Node, NodeBody, NodeId, NodeKind};
pub use storage::{BackendKind, BackendRegistry, LocalStorage, RemoteStorage, SessionStorage, StorageBackend};
