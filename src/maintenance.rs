//! 后台维护任务
//!
//! - 限流记录清理与信任恢复
//! - 过期封禁记录清理
//! - 闲置会话的消息历史清理
//! - 操作密钥轮换
//!
//! 每个任务独占一个 tokio 定时器，通过 watch 通道统一停止。

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::FieldCipher;
use crate::error::{GuardError, Result};
use crate::infra::metrics;
use crate::security::checks::TrollCheck;
use crate::security::{BanStore, TrustScoredRateLimiter};

/// 周期执行的维护任务
#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// 执行一次，返回本次处理的条目数
    async fn tick(&self) -> Result<usize>;
}

/// 限流记录清理：删除闲置身份，为闲置但未过期的身份恢复信任
pub struct RateLimiterSweep {
    limiter: Arc<TrustScoredRateLimiter>,
}

impl RateLimiterSweep {
    pub fn new(limiter: Arc<TrustScoredRateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl MaintenanceTask for RateLimiterSweep {
    fn name(&self) -> &'static str {
        "rate_limiter_sweep"
    }

    async fn tick(&self) -> Result<usize> {
        let stats = self.limiter.sweep();
        metrics::record_tracked_identities(self.limiter.tracked_identities());
        if stats.removed > 0 {
            info!(
                "🧹 限流记录清理: 检查 {} 个，删除 {} 个",
                stats.scanned, stats.removed
            );
        }
        Ok(stats.removed)
    }
}

/// 过期封禁清理
pub struct BanPurge {
    bans: Arc<BanStore>,
}

impl BanPurge {
    pub fn new(bans: Arc<BanStore>) -> Self {
        Self { bans }
    }
}

#[async_trait]
impl MaintenanceTask for BanPurge {
    fn name(&self) -> &'static str {
        "ban_purge"
    }

    async fn tick(&self) -> Result<usize> {
        let purged = self.bans.purge_expired(Utc::now());
        metrics::record_active_bans(self.bans.len());
        if purged > 0 {
            info!("🧹 清理过期封禁: {} 条", purged);
        }
        Ok(purged)
    }
}

/// 捣乱检测的会话历史清理：删除闲置超过保留期的会话
pub struct TrollHistorySweep {
    troll: Arc<TrollCheck>,
    idle: Duration,
}

impl TrollHistorySweep {
    pub fn new(troll: Arc<TrollCheck>, idle: Duration) -> Self {
        Self { troll, idle }
    }
}

#[async_trait]
impl MaintenanceTask for TrollHistorySweep {
    fn name(&self) -> &'static str {
        "troll_history_sweep"
    }

    async fn tick(&self) -> Result<usize> {
        let idle_ms = i64::try_from(self.idle.as_millis()).unwrap_or(i64::MAX);
        let removed = self.troll.sweep_idle(Utc::now().timestamp_millis(), idle_ms);
        if removed > 0 {
            info!(
                "🧹 会话消息历史清理: 删除 {} 个，剩余 {} 个",
                removed,
                self.troll.tracked_sessions()
            );
        }
        Ok(removed)
    }
}

/// 操作密钥轮换
pub struct KeyRotation {
    cipher: Arc<FieldCipher>,
}

impl KeyRotation {
    pub fn new(cipher: Arc<FieldCipher>) -> Self {
        Self { cipher }
    }
}

#[async_trait]
impl MaintenanceTask for KeyRotation {
    fn name(&self) -> &'static str {
        "key_rotation"
    }

    async fn tick(&self) -> Result<usize> {
        let evicted = self.cipher.rotate_keys();
        info!("🔑 操作密钥已轮换，清除缓存 {} 把", evicted);
        Ok(evicted)
    }
}

/// 维护任务调度器
pub struct Scheduler {
    tasks: Vec<(Arc<dyn MaintenanceTask>, Duration)>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tasks: Vec::new(),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// 添加任务（start 之前调用），周期必须大于零
    pub fn add(&mut self, task: Arc<dyn MaintenanceTask>, every: Duration) -> Result<()> {
        if every.is_zero() {
            return Err(GuardError::Configuration(format!(
                "maintenance task {} needs a non-zero period",
                task.name()
            )));
        }
        self.tasks.push((task, every));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 启动所有任务；需要在 tokio 运行时内调用
    pub fn start(&mut self) {
        for (task, every) in self.tasks.drain(..) {
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(async move {
                // 首次执行延后一个周期
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            match task.tick().await {
                                Ok(n) => debug!("维护任务 {} 完成，处理 {} 条", task.name(), n),
                                Err(e) => warn!("⚠️ 维护任务 {} 失败: {}", task.name(), e),
                            }
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("维护任务 {} 已停止", task.name());
            });
            self.handles.push(handle);
        }
        info!("✅ 维护任务已启动: {} 个", self.handles.len());
    }

    /// 通知所有任务停止并等待退出
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("🛑 维护任务已全部停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{BanRecord, ChatRateLimits, RetentionConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl MaintenanceTask for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn tick(&self) -> Result<usize> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn test_scheduler_ticks_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        scheduler
            .add(Arc::new(Counting(count.clone())), Duration::from_millis(10))
            .unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await;

        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 2, "ticks = {}", ticks);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), ticks);
    }

    #[test]
    fn test_zero_period_rejected() {
        let mut scheduler = Scheduler::new();
        let err = scheduler
            .add(Arc::new(Counting(Arc::new(AtomicUsize::new(0)))), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, GuardError::Configuration(_)));
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_ban_purge_removes_expired() {
        let bans = Arc::new(BanStore::in_memory());
        let past = Utc::now() - chrono::Duration::hours(2);
        bans.ban(BanRecord::new("old", "spam", Duration::from_secs(60), past));
        bans.ban(BanRecord::new("new", "spam", Duration::from_secs(3600), Utc::now()));

        let purged = BanPurge::new(bans.clone()).tick().await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(bans.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limiter_sweep_reports_removed() {
        let limiter = Arc::new(TrustScoredRateLimiter::new(
            ChatRateLimits::default(),
            RetentionConfig::default(),
        ));
        let task = RateLimiterSweep::new(limiter);
        assert_eq!(task.tick().await.unwrap(), 0);
        assert_eq!(task.name(), "rate_limiter_sweep");
    }

    #[tokio::test]
    async fn test_troll_history_sweep_drops_idle_sessions() {
        use crate::security::checks::TrollConfig;
        use crate::security::{CheckContext, ClientMeta, SecurityCheck};

        let troll = Arc::new(TrollCheck::new(TrollConfig::default()).unwrap());
        let stale = Utc::now() - chrono::Duration::hours(48);
        for i in 0..500 {
            let ctx = CheckContext::new(&format!("s{}", i), "hi", ClientMeta::default()).at(stale);
            troll.evaluate(&ctx, &[]).await.unwrap();
        }
        let fresh = CheckContext::new("active", "hi", ClientMeta::default());
        troll.evaluate(&fresh, &[]).await.unwrap();

        let task = TrollHistorySweep::new(troll.clone(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(task.tick().await.unwrap(), 500);
        assert_eq!(troll.tracked_sessions(), 1);
    }

    #[tokio::test]
    async fn test_key_rotation_evicts_cache() {
        use crate::crypto::KeyConfig;

        let cipher = Arc::new(
            FieldCipher::new(
                "0123456789abcdef0123456789abcdef-test-secret",
                KeyConfig {
                    pbkdf2_iterations: 10_000,
                    ..KeyConfig::default()
                },
            )
            .unwrap(),
        );
        cipher.encrypt("alice@example.com", "email").unwrap();
        let task = KeyRotation::new(cipher.clone());
        assert!(task.tick().await.unwrap() >= 1);
    }
}
