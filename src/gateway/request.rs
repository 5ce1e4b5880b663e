use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, VfsError};
use crate::gateway::{LockKey, StorageGateway};
use crate::lock::LockId;
use crate::node::Node;
use crate::storage::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    GetNode,
    SetNode,
    DeleteNode,
    ListKeysWithPrefix,
    LockNode,
    UnlockNode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<LockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<Node>,
}

impl RequestData {
    fn key(&self, operation: Operation) -> Result<&str> {
        self.key
            .as_deref()
            .ok_or_else(|| VfsError::InvalidRequest(format!("{:?} requires a key", operation)))
    }
}

/// 编排层发来的存储请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRequest {
    pub backend_name: String,
    pub operation_name: Operation,
    #[serde(default)]
    pub data: RequestData,
}

impl StorageRequest {
    pub fn new(backend: BackendKind, operation: Operation, data: RequestData) -> Self {
        Self {
            backend_name: backend.to_string(),
            operation_name: operation,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageResponse {
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StorageResponse {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl StorageGateway {
    /// 处理一条请求。所有失败都放进 `error`，不会向上抛出
    pub async fn handle(&self, request: StorageRequest) -> StorageResponse {
        debug!(
            "storage request: {} {:?}",
            request.backend_name, request.operation_name
        );
        match self.dispatch(request).await {
            Ok(result) => StorageResponse {
                result,
                error: None,
            },
            Err(e) => StorageResponse {
                result: Value::Null,
                error: Some(e.to_string()),
            },
        }
    }

    async fn dispatch(&self, request: StorageRequest) -> Result<Value> {
        let backend: BackendKind = request.backend_name.parse()?;
        let operation = request.operation_name;
        let data = request.data;

        match operation {
            Operation::GetNode => {
                let node = self
                    .get_node(backend, data.key(operation)?, data.lock_id)
                    .await?;
                Ok(serde_json::to_value(node)?)
            }
            Operation::SetNode => {
                let key = data.key(operation)?;
                let node = data.node.as_ref().ok_or_else(|| {
                    VfsError::InvalidRequest("setNode requires a node".to_string())
                })?;
                self.set_node(backend, key, node, data.lock_id).await?;
                Ok(Value::Null)
            }
            Operation::DeleteNode => {
                self.delete_node(backend, data.key(operation)?, data.lock_id)
                    .await?;
                Ok(Value::Null)
            }
            Operation::ListKeysWithPrefix => {
                let prefix = data.prefix.as_deref().or(data.key.as_deref()).unwrap_or("");
                let keys = self
                    .list_keys_with_prefix(backend, prefix, data.lock_id)
                    .await?;
                Ok(json!(keys))
            }
            Operation::LockNode => {
                let key = data.key(operation)?;
                let lock_id = match data.lock_id {
                    // 已经持有时重新确认同一把锁
                    Some(id) => {
                        self.registry().get(backend)?;
                        self.locks().check(&LockKey::new(backend, key), id)?;
                        id
                    }
                    None => self.lock_node(backend, key).await?,
                };
                Ok(json!({ "lockId": lock_id }))
            }
            Operation::UnlockNode => {
                let key = data.key(operation)?;
                let lock_id = data.lock_id.ok_or_else(|| {
                    VfsError::InvalidRequest("unlockNode requires a lockId".to_string())
                })?;
                self.unlock_node(backend, key, lock_id).await?;
                Ok(Value::Null)
            }
        }
    }
}
