//! 封禁记录
//!
//! 封禁成功后由服务端保存记录，后续请求在流水线最前面被直接拒绝。
//! 记录只保存在服务端，客户端持有的标记不作为封禁依据。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::store::{KeyedStore, MemoryStore, SweepDecision};

/// 封禁记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanRecord {
    pub session_id: String,
    pub banned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
}

impl BanRecord {
    pub fn new(session_id: &str, reason: &str, duration: Duration, now: DateTime<Utc>) -> Self {
        let duration = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::days(1));
        Self {
            session_id: session_id.to_string(),
            banned_at: now,
            expires_at: now + duration,
            reason: reason.to_string(),
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// 封禁记录仓库
pub struct BanStore<S = MemoryStore<BanRecord>> {
    store: S,
}

impl BanStore {
    pub fn in_memory() -> Self {
        Self::with_store(MemoryStore::new())
    }
}

impl Default for BanStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl<S> BanStore<S>
where
    S: KeyedStore<BanRecord>,
{
    pub fn with_store(store: S) -> Self {
        Self { store }
    }

    pub fn ban(&self, record: BanRecord) {
        info!(
            target: "leadguard::audit",
            session_id = %record.session_id,
            expires_at = %record.expires_at,
            "🚫 写入封禁记录"
        );
        let key = record.session_id.clone();
        self.store.set(&key, record);
    }

    /// 查询未过期的封禁；过期记录在 key 锁内删除
    pub fn active_ban(&self, session_id: &str, now: DateTime<Utc>) -> Option<BanRecord> {
        let mut active = None;
        self.store.sweep_key(session_id, |record| {
            if record.is_active(now) {
                active = Some(record.clone());
                SweepDecision::Keep
            } else {
                SweepDecision::Remove
            }
        })?;
        active
    }

    pub fn is_banned(&self, session_id: &str) -> bool {
        self.active_ban(session_id, Utc::now()).is_some()
    }

    /// 提前解除封禁
    pub fn lift(&self, session_id: &str) -> Option<BanRecord> {
        self.store.delete(session_id)
    }

    /// 清理过期记录，返回删除数
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        self.store
            .sweep(|record| {
                if record.is_active(now) {
                    SweepDecision::Keep
                } else {
                    SweepDecision::Remove
                }
            })
            .removed
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
