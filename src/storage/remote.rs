use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, VfsError};
use crate::node::Node;
use crate::storage::StorageBackend;

/// 远程存储：每次调用都是一次带 Bearer 凭证的 HTTP 请求。
///
/// 没有凭证时直接失败（`AuthRequired`），不会发出请求，也不会返回空结果。
#[derive(Debug, Clone)]
pub struct RemoteStorage {
    client: reqwest::Client,
    api_url: String,
    token: Arc<RwLock<Option<String>>>,
}

#[derive(Debug, Default, Serialize)]
struct RemoteRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefix: Option<&'a str>,
    /// 写操作携带序列化后的节点
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    node: Option<Node>,
    #[serde(default)]
    keys: Option<Vec<String>>,
}

impl RemoteStorage {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            token: Arc::new(RwLock::new(token)),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// 登录后由宿主设置凭证
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn clear_token(&self) {
        *self.token.write() = None;
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    async fn call(&self, action: &str, body: RemoteRequest<'_>) -> Result<RemoteResponse> {
        let token = self.token.read().clone().ok_or(VfsError::AuthRequired)?;
        debug!("remote call: action={}", action);

        let response = self
            .client
            .post(&self.api_url)
            .query(&[("action", action)])
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!("remote call {} failed with HTTP {}", action, status);
            return Err(VfsError::Remote(format!(
                "{} failed with HTTP status {}",
                action, status
            )));
        }

        let reply: RemoteResponse = response.json().await?;
        if reply.status.as_deref() == Some("error") {
            let message = reply
                .message
                .unwrap_or_else(|| format!("{} failed", action));
            return Err(VfsError::Remote(message));
        }
        Ok(reply)
    }
}

#[async_trait]
impl StorageBackend for RemoteStorage {
    async fn get_node(&self, key: &str) -> Result<Option<Node>> {
        let reply = self
            .call(
                "get_node",
                RemoteRequest {
                    key: Some(key),
                    ..Default::default()
                },
            )
            .await?;
        Ok(reply.node)
    }

    async fn set_node(&self, key: &str, node: &Node) -> Result<()> {
        let payload = serde_json::to_string(node)?;
        self.call(
            "set_node",
            RemoteRequest {
                key: Some(key),
                node: Some(payload),
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }

    async fn delete_node(&self, key: &str) -> Result<()> {
        self.call(
            "delete_node",
            RemoteRequest {
                key: Some(key),
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let reply = self
            .call(
                "list_keys",
                RemoteRequest {
                    prefix: Some(prefix),
                    ..Default::default()
                },
            )
            .await?;
        Ok(reply.keys.unwrap_or_default())
    }
}
