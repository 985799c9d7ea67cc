/// 信任分自适应限流器
///
/// 核心特性：
/// 1. 固定时间窗口计数，按身份作用域（IP / 会话 / 可疑桶）隔离
/// 2. 有效配额随信任分缩放，封禁时长随信任分与可疑次数放大
/// 3. 转发头声称私有地址视为伪造，直接硬封禁
/// 4. 每个身份的读-改-写都在该 key 的锁内完成（DashMap 分片锁）
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::identity::{ClientMeta, IdentityVerdict};
use super::trust::{block_duration_ms, effective_limit, TrustRecord};
use crate::infra::metrics;
use crate::store::{KeyedStore, MemoryStore, SweepDecision, SweepStats};

/// 单个作用域的限流配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 作用域名（作为 key 前缀）
    pub scope: String,
    /// 窗口长度（毫秒）
    pub window_ms: u64,
    /// 基础配额（信任分 ≥ 80 时的配额）
    pub max_requests: u32,
    /// 基础封禁时长（毫秒）
    pub block_duration_ms: u64,
}

impl RateLimitConfig {
    pub fn new(scope: &str, window_ms: u64, max_requests: u32, block_duration_ms: u64) -> Self {
        Self {
            scope: scope.to_string(),
            window_ms,
            max_requests,
            block_duration_ms,
        }
    }

    /// 通用接口限流：每分钟 100 次，封禁 5 分钟
    pub fn api() -> Self {
        Self::new("api", 60_000, 100, 5 * 60_000)
    }

    /// 聊天：单 IP 每分钟 30 条
    pub fn chat_ip() -> Self {
        Self::new("chat_ip", 60_000, 30, 5 * 60_000)
    }

    /// 聊天：单会话每分钟 20 条
    pub fn chat_session() -> Self {
        Self::new("chat_session", 60_000, 20, 5 * 60_000)
    }

    /// 聊天：可疑请求桶，每 5 分钟 5 条，封禁 30 分钟
    pub fn chat_suspicious() -> Self {
        Self::new("chat_suspicious", 5 * 60_000, 5, 30 * 60_000)
    }

    fn key(&self, identity: &str) -> String {
        format!("{}:{}", self.scope, identity)
    }
}

/// 聊天复合限流配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRateLimits {
    pub per_address: RateLimitConfig,
    pub per_session: RateLimitConfig,
    pub suspicious: RateLimitConfig,
}

impl Default for ChatRateLimits {
    fn default() -> Self {
        Self {
            per_address: RateLimitConfig::chat_ip(),
            per_session: RateLimitConfig::chat_session(),
            suspicious: RateLimitConfig::chat_suspicious(),
        }
    }
}

/// 闲置清理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// 超过此闲置时长的身份被删除（毫秒）
    pub retention_ms: u64,
    /// 超过此闲置时长的身份开始恢复信任（毫秒）
    pub recovery_ms: u64,
    /// 每次清理恢复的信任分
    pub recovery_trust_step: i32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_ms: 24 * 60 * 60 * 1000,
            recovery_ms: 60 * 60 * 1000,
            recovery_trust_step: 5,
        }
    }
}

/// 拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// 仍在封禁期
    Blocked,
    /// 超出配额
    LimitExceeded,
    /// 伪造身份
    IdentitySpoofed,
}

/// 限流检查结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    /// 当前有效配额
    pub limit: u32,
    /// 剩余次数
    pub remaining: u32,
    /// 窗口重置（或封禁结束）时间，毫秒时间戳
    pub reset_time: i64,
    /// 建议重试等待秒数
    pub retry_after: Option<u64>,
    pub denial: Option<DenialReason>,
    /// 检查后的信任分
    pub trust_score: i32,
}

impl RateLimitResult {
    fn denied(record: &TrustRecord, limit: u32, now_ms: i64, reason: DenialReason) -> Self {
        let until = record.blocked_until.unwrap_or(now_ms);
        let remaining_ms = (until - now_ms).max(0);
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_time: until,
            retry_after: Some(((remaining_ms + 999) / 1000).max(1) as u64),
            denial: Some(reason),
            trust_score: record.trust_score,
        }
    }

    /// 取最严格的结果：任一拒绝则拒绝（取最长等待），否则取剩余最少者
    pub fn most_restrictive(results: Vec<RateLimitResult>) -> Option<RateLimitResult> {
        results.into_iter().reduce(|a, b| match (a.allowed, b.allowed) {
            (true, false) => b,
            (false, true) => a,
            (false, false) => {
                if b.retry_after.unwrap_or(0) > a.retry_after.unwrap_or(0) {
                    b
                } else {
                    a
                }
            }
            (true, true) => {
                if b.remaining < a.remaining {
                    b
                } else {
                    a
                }
            }
        })
    }
}

/// 信任分自适应限流器
pub struct TrustScoredRateLimiter<S = MemoryStore<TrustRecord>> {
    store: S,
    chat: ChatRateLimits,
    retention: RetentionConfig,
}

impl TrustScoredRateLimiter {
    pub fn new(chat: ChatRateLimits, retention: RetentionConfig) -> Self {
        Self::with_store(MemoryStore::new(), chat, retention)
    }
}

impl<S> TrustScoredRateLimiter<S>
where
    S: KeyedStore<TrustRecord>,
{
    pub fn with_store(store: S, chat: ChatRateLimits, retention: RetentionConfig) -> Self {
        Self {
            store,
            chat,
            retention,
        }
    }

    /// 检查并计数
    pub fn check(
        &self,
        identity: &str,
        config: &RateLimitConfig,
        meta: Option<&ClientMeta>,
        suspicious: bool,
    ) -> RateLimitResult {
        self.check_at(
            identity,
            config,
            meta,
            suspicious,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    /// 指定时间点的检查（便于测试与回放）
    pub fn check_at(
        &self,
        identity: &str,
        config: &RateLimitConfig,
        meta: Option<&ClientMeta>,
        suspicious: bool,
        now_ms: i64,
    ) -> RateLimitResult {
        let key = config.key(identity);
        let verdict = meta.map(|m| m.verify()).unwrap_or(IdentityVerdict::Unknown);
        let window_ms = config.window_ms as i64;
        let base_block_ms = config.block_duration_ms as i64;

        let result = self.store.update_or_insert(
            &key,
            || TrustRecord::new(&key, now_ms),
            |record| {
                record.last_seen = now_ms;
                record.roll_window(now_ms, window_ms);

                if record.is_blocked(now_ms) {
                    let limit = effective_limit(config.max_requests, record.trust_score);
                    return RateLimitResult::denied(record, limit, now_ms, DenialReason::Blocked);
                }

                if let IdentityVerdict::Spoofed { .. } = verdict {
                    record.record_spoof();
                    let block = block_duration_ms(
                        base_block_ms,
                        record.trust_score,
                        record.suspicious_activity_count,
                    );
                    record.blocked_until = Some(now_ms + block);
                    let limit = effective_limit(config.max_requests, record.trust_score);
                    return RateLimitResult::denied(
                        record,
                        limit,
                        now_ms,
                        DenialReason::IdentitySpoofed,
                    );
                }

                record.request_count = record.request_count.saturating_add(1);
                if suspicious {
                    record.record_suspicious();
                }

                let limit = effective_limit(config.max_requests, record.trust_score);
                if record.request_count > limit {
                    let block = block_duration_ms(
                        base_block_ms,
                        record.trust_score,
                        record.suspicious_activity_count,
                    );
                    record.blocked_until = Some(now_ms + block);
                    record.window_tainted = true;
                    return RateLimitResult::denied(
                        record,
                        limit,
                        now_ms,
                        DenialReason::LimitExceeded,
                    );
                }

                RateLimitResult {
                    allowed: true,
                    limit,
                    remaining: limit - record.request_count,
                    reset_time: record.window_start + window_ms,
                    retry_after: None,
                    denial: None,
                    trust_score: record.trust_score,
                }
            },
        );

        match (&verdict, result.denial) {
            (IdentityVerdict::Spoofed { claimed, header }, Some(DenialReason::IdentitySpoofed)) => {
                warn!(
                    target: "leadguard::audit",
                    identity = %key,
                    claimed = %claimed,
                    header = %header,
                    "🚫 伪造来源地址，已硬封禁"
                );
                metrics::record_spoof_block(&config.scope);
            }
            (_, Some(DenialReason::LimitExceeded)) => {
                warn!(
                    identity = %key,
                    limit = result.limit,
                    retry_after = ?result.retry_after,
                    trust = result.trust_score,
                    "⚠️ 超出限流配额，进入封禁"
                );
                metrics::record_rate_limited(&config.scope);
            }
            (_, Some(DenialReason::Blocked)) => {
                debug!(identity = %key, retry_after = ?result.retry_after, "封禁期内请求被拒绝");
                metrics::record_rate_limited(&config.scope);
            }
            _ => {}
        }

        result
    }

    /// 聊天复合检查：按地址、按会话、可疑桶三个作用域，返回最严格的结果
    ///
    /// 可疑桶只统计被标记为可疑的请求
    pub fn check_chat(
        &self,
        session_id: &str,
        meta: &ClientMeta,
        suspicious: bool,
    ) -> RateLimitResult {
        self.check_chat_at(
            session_id,
            meta,
            suspicious,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    pub fn check_chat_at(
        &self,
        session_id: &str,
        meta: &ClientMeta,
        suspicious: bool,
        now_ms: i64,
    ) -> RateLimitResult {
        let address = meta.client_identity();
        let mut results = vec![
            self.check_at(&address, &self.chat.per_address, Some(meta), suspicious, now_ms),
            self.check_at(session_id, &self.chat.per_session, None, suspicious, now_ms),
        ];
        if suspicious {
            results.push(self.check_at(&address, &self.chat.suspicious, None, false, now_ms));
        }

        // 非空，reduce 必然有值
        RateLimitResult::most_restrictive(results).unwrap_or_else(|| RateLimitResult {
            allowed: false,
            limit: 0,
            remaining: 0,
            reset_time: now_ms,
            retry_after: Some(1),
            denial: Some(DenialReason::Blocked),
            trust_score: 0,
        })
    }

    /// 某个身份的信任记录快照
    pub fn record(&self, identity: &str, config: &RateLimitConfig) -> Option<TrustRecord> {
        self.store.get(&config.key(identity))
    }

    /// 删除会话作用域的记录（会话结束时调用）
    pub fn forget_session(&self, session_id: &str) {
        self.store.delete(&self.chat.per_session.key(session_id));
    }

    /// 聊天复合检查所用配置
    pub fn chat_limits(&self) -> &ChatRateLimits {
        &self.chat
    }

    /// 周期清理：删除长期闲置的身份，对中期闲置的身份有限度地恢复信任
    pub fn sweep_at(&self, now_ms: i64) -> SweepStats {
        let retention_ms = self.retention.retention_ms as i64;
        let recovery_ms = self.retention.recovery_ms as i64;
        let step = self.retention.recovery_trust_step;

        self.store.sweep(|record| {
            let idle = now_ms - record.last_seen;
            if idle >= retention_ms && !record.is_blocked(now_ms) {
                SweepDecision::Remove
            } else {
                if idle >= recovery_ms {
                    record.rehabilitate(step);
                }
                SweepDecision::Keep
            }
        })
    }

    pub fn sweep(&self) -> SweepStats {
        self.sweep_at(chrono::Utc::now().timestamp_millis())
    }

    /// 当前跟踪的身份数
    pub fn tracked_identities(&self) -> usize {
        self.store.len()
    }
}
