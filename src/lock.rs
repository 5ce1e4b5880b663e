use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as Gate, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, VfsError};

/// 显式锁的令牌，每次加锁都重新生成，从不复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(Uuid);

impl LockId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LockId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// 被持有的显式锁：令牌 + 闸门的所有权
struct HeldLock {
    id: LockId,
    _guard: OwnedMutexGuard<()>,
}

/// 每个键的锁条目，只在有操作进行中或显式锁被持有时存在
struct LockEntry {
    /// 公平锁，等待者按到达顺序获得
    gate: Arc<Gate<()>>,
    holder: Option<HeldLock>,
    /// 排队中 + 执行中 + 显式持有的数量
    users: usize,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            gate: Arc::new(Gate::new(())),
            holder: None,
            users: 0,
        }
    }
}

/// 按键分片的锁表。
///
/// 同一个键上的操作严格按到达顺序执行，不同键之间互不阻塞。
/// 显式锁 (`acquire`) 会一直占住闸门，直到用匹配的令牌 `release`。
pub struct KeyLocks<K> {
    entries: Mutex<HashMap<K, LockEntry>>,
}

impl<K> Default for KeyLocks<K>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for KeyLocks<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLocks")
            .field("active_keys", &self.entries.lock().len())
            .finish()
    }
}

/// 排队凭据。Drop 时归还计数，成功、失败、被取消都会执行
struct Ticket<'a, K>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    locks: &'a KeyLocks<K>,
    key: K,
    gate: Arc<Gate<()>>,
    armed: bool,
}

impl<'a, K> Ticket<'a, K>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    fn new(locks: &'a KeyLocks<K>, key: &K) -> Self {
        let gate = locks.enter(key);
        Self {
            locks,
            key: key.clone(),
            gate,
            armed: true,
        }
    }

    /// 转交给显式锁，由 `release` 负责归还
    fn keep(mut self) {
        self.armed = false;
    }
}

impl<K> Drop for Ticket<'_, K>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    fn drop(&mut self) {
        if self.armed {
            self.locks.leave(&self.key);
        }
    }
}

impl<K> KeyLocks<K>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn enter(&self, key: &K) -> Arc<Gate<()>> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(LockEntry::new);
        entry.users += 1;
        entry.gate.clone()
    }

    fn leave(&self, key: &K) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.users = entry.users.saturating_sub(1);
            if entry.users == 0 && entry.holder.is_none() {
                entries.remove(key);
            }
        }
    }

    fn violation(key: &K, supplied: LockId, current: Option<LockId>) -> VfsError {
        VfsError::LockViolation {
            key: key.to_string(),
            supplied: supplied.to_string(),
            current: current.map_or_else(|| "none".to_string(), |id| id.to_string()),
        }
    }

    /// 排队执行一次操作，完成后（无论成败）放行下一个
    pub async fn run<F, T>(&self, key: &K, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let ticket = Ticket::new(self, key);
        let _guard = ticket.gate.clone().lock_owned().await;
        op.await
    }

    /// 排队获取显式锁，返回的令牌用于后续操作和 `release`
    pub async fn acquire(&self, key: &K) -> LockId {
        let ticket = Ticket::new(self, key);
        let guard = ticket.gate.clone().lock_owned().await;
        let id = LockId::fresh();
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(key) {
                entry.holder = Some(HeldLock { id, _guard: guard });
            }
        }
        ticket.keep();
        debug!("lock acquired: {} ({})", key, id);
        id
    }

    /// 校验令牌是否就是当前持有者
    pub fn check(&self, key: &K, id: LockId) -> Result<()> {
        let current = self.holder(key);
        if current == Some(id) {
            Ok(())
        } else {
            Err(Self::violation(key, id, current))
        }
    }

    /// 持锁者在不排队的情况下执行操作
    pub async fn with_lock<F, T>(&self, key: &K, id: LockId, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(key, id)?;
        op.await
    }

    /// 释放显式锁。令牌不匹配时报错，锁保持不变
    pub fn release(&self, key: &K, id: LockId) -> Result<()> {
        let held = {
            let mut entries = self.entries.lock();
            let entry = match entries.get_mut(key) {
                Some(entry) if entry.holder.as_ref().map(|h| h.id) == Some(id) => entry,
                Some(entry) => {
                    let current = entry.holder.as_ref().map(|h| h.id);
                    return Err(Self::violation(key, id, current));
                }
                None => return Err(Self::violation(key, id, None)),
            };
            let held = entry.holder.take();
            entry.users = entry.users.saturating_sub(1);
            if entry.users == 0 {
                entries.remove(key);
            }
            held
        };
        // 在表锁之外打开闸门
        drop(held);
        debug!("lock released: {} ({})", key, id);
        Ok(())
    }

    pub fn holder(&self, key: &K) -> Option<LockId> {
        self.entries
            .lock()
            .get(key)
            .and_then(|entry| entry.holder.as_ref().map(|h| h.id))
    }

    pub fn is_idle(&self, key: &K) -> bool {
        !self.entries.lock().contains_key(key)
    }

    pub fn active_keys(&self) -> usize {
        self.entries.lock().len()
    }
}
