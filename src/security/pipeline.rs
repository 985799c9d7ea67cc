/// 安全检查流水线
///
/// 按优先级（升序）依次执行已注册且适用的检查：
/// - 遇到第一个拒绝结果立即返回，后续检查不会执行
/// - 全部放行时，合并告警级结果；没有告警则合并正常结果
/// - 检查出错或 panic 一律视为封禁（fail-closed）
///
/// 检查可以在运行时注册/注销，执行时使用注册表快照，不影响正在执行的请求。
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use super::identity::ClientMeta;
use super::result::SecurityResult;
use crate::error::Result;
use crate::infra::metrics;

/// 单条消息的检查上下文
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub session_id: String,
    pub message: String,
    pub meta: ClientMeta,
    pub received_at: DateTime<Utc>,
}

impl CheckContext {
    pub fn new(session_id: &str, message: &str, meta: ClientMeta) -> Self {
        Self {
            session_id: session_id.to_string(),
            message: message.to_string(),
            meta,
            received_at: Utc::now(),
        }
    }

    pub fn at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn received_at_ms(&self) -> i64 {
        self.received_at.timestamp_millis()
    }
}

/// 安全检查
///
/// `prior` 是本次执行中排在前面、且已放行的检查结果
#[async_trait]
pub trait SecurityCheck: Send + Sync {
    /// 检查名（注册表中唯一）
    fn name(&self) -> &'static str;

    /// 优先级，数值越小越先执行
    fn priority(&self) -> u32;

    /// 是否适用于当前请求
    fn applies_to(&self, _ctx: &CheckContext) -> bool {
        true
    }

    async fn evaluate(&self, ctx: &CheckContext, prior: &[SecurityResult]) -> Result<SecurityResult>;
}

/// 安全检查流水线
#[derive(Default)]
pub struct SecurityPipeline {
    checks: RwLock<Vec<Arc<dyn SecurityCheck>>>,
}

impl SecurityPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册检查；同名检查会被替换
    pub fn register(&self, check: Arc<dyn SecurityCheck>) {
        let mut checks = self.checks.write();
        let name = check.name();
        let replaced = checks.iter().any(|c| c.name() == name);
        checks.retain(|c| c.name() != name);
        checks.push(check);
        // 稳定排序：同优先级保持注册顺序
        checks.sort_by_key(|c| c.priority());
        if replaced {
            info!("🔄 替换安全检查: {}", name);
        } else {
            info!("✅ 注册安全检查: {}", name);
        }
    }

    /// 注销检查，返回是否存在
    pub fn unregister(&self, name: &str) -> bool {
        let mut checks = self.checks.write();
        let before = checks.len();
        checks.retain(|c| c.name() != name);
        let removed = checks.len() != before;
        if removed {
            info!("🗑️ 注销安全检查: {}", name);
        }
        removed
    }

    /// 按执行顺序列出检查名
    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.read().iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.checks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.read().is_empty()
    }

    /// 执行流水线
    pub async fn execute(&self, ctx: &CheckContext) -> SecurityResult {
        let snapshot: Vec<Arc<dyn SecurityCheck>> = self.checks.read().clone();
        let started = Instant::now();
        let mut results: Vec<SecurityResult> = Vec::with_capacity(snapshot.len());
        let mut executed: Vec<&'static str> = Vec::with_capacity(snapshot.len());

        for check in &snapshot {
            if !check.applies_to(ctx) {
                continue;
            }
            let name = check.name();
            let outcome = AssertUnwindSafe(check.evaluate(ctx, &results))
                .catch_unwind()
                .await;

            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => fail_closed(ctx, name, &e.to_string()),
                Err(_) => fail_closed(ctx, name, "check panicked"),
            };
            executed.push(name);

            if !result.allowed {
                debug!(
                    session_id = %ctx.session_id,
                    check = name,
                    level = result.level.as_str(),
                    "流水线短路"
                );
                let result = result.with_metadata("blockedBy", name);
                metrics::record_decision(&result, started.elapsed());
                return result;
            }
            results.push(result);
        }

        let merged = SecurityResult::merge_warnings(&results)
            .unwrap_or_else(|| SecurityResult::merge_clean(&results))
            .with_metadata("checks", executed);
        metrics::record_decision(&merged, started.elapsed());
        merged
    }
}

/// 检查失败转换为封禁结果
fn fail_closed(ctx: &CheckContext, check: &'static str, reason: &str) -> SecurityResult {
    error!(
        target: "leadguard::audit",
        session_id = %ctx.session_id,
        check = check,
        reason = %reason,
        "❌ 安全检查执行失败，按封禁处理"
    );
    metrics::record_check_failure(check);
    SecurityResult::banned(format!("check_failed: {}", check))
}
