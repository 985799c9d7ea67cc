//! Prometheus 指标：检查决策、限流拒绝、警告/封禁、密钥轮换等
//!
//! 未安装 Recorder 时所有 `record_*` 都是空操作，库使用方无需关心。
//! 通过 `init()` 安装全局 Recorder（进程内渲染），
//! 或通过 `init_with_listener()` 同时启动 `/metrics` 抓取端点。

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::security::result::SecurityResult;
use crate::security::warning::ModerationAction;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标名称
const COUNTER_DECISIONS: &str = "leadguard_decisions_total";
const HISTOGRAM_PIPELINE_DURATION: &str = "leadguard_pipeline_duration_seconds";
const COUNTER_CHECK_FAILURES: &str = "leadguard_check_failures_total";
const COUNTER_RATE_LIMITED: &str = "leadguard_rate_limited_total";
const COUNTER_SPOOF_BLOCKS: &str = "leadguard_spoof_blocks_total";
const COUNTER_SEQUENCE_VIOLATIONS: &str = "leadguard_sequence_violations_total";
const COUNTER_MODERATION: &str = "leadguard_moderation_total";
const COUNTER_KEY_ROTATIONS: &str = "leadguard_key_rotations_total";
const COUNTER_CRYPTO_FAILURES: &str = "leadguard_crypto_failures_total";
const GAUGE_TRACKED_IDENTITIES: &str = "leadguard_tracked_identities";
const GAUGE_ACTIVE_BANS: &str = "leadguard_active_bans";

/// 安装全局 Recorder（不启动 HTTP 端点）。
/// 仅需在进程内调用一次；重复调用会返回 Err。
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    HANDLE
        .set(handle)
        .map_err(|_| "metrics already initialized")?;
    Ok(())
}

/// 安装全局 Recorder 并在 `addr` 上暴露 `/metrics`。需要在 tokio 运行时内调用。
pub fn init_with_listener(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if is_initialized() {
        return Err("metrics already initialized".into());
    }
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}

pub fn is_initialized() -> bool {
    HANDLE.get().is_some()
}

/// 渲染当前指标为 Prometheus 文本格式（仅 `init()` 模式可用）
pub fn render_metrics() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// 记录一次流水线决策及耗时
pub fn record_decision(result: &SecurityResult, elapsed: Duration) {
    metrics::counter!(
        COUNTER_DECISIONS,
        "level" => result.level.as_str(),
        "allowed" => if result.allowed { "true" } else { "false" }
    )
    .increment(1);
    metrics::histogram!(HISTOGRAM_PIPELINE_DURATION).record(elapsed.as_secs_f64());
}

/// 记录某个检查执行失败（出错、超时或 panic）
pub fn record_check_failure(check: &str) {
    metrics::counter!(COUNTER_CHECK_FAILURES, "check" => check.to_string()).increment(1);
}

pub fn record_rate_limited(scope: &str) {
    metrics::counter!(COUNTER_RATE_LIMITED, "scope" => scope.to_string()).increment(1);
}

pub fn record_spoof_block(scope: &str) {
    metrics::counter!(COUNTER_SPOOF_BLOCKS, "scope" => scope.to_string()).increment(1);
}

/// 记录警告/封禁请求的顺序违规（kind: warning / ban）
pub fn record_sequence_violation(kind: &'static str) {
    metrics::counter!(COUNTER_SEQUENCE_VIOLATIONS, "kind" => kind).increment(1);
}

pub fn record_moderation(action: ModerationAction) {
    let label = match action {
        ModerationAction::Warning => "warning",
        ModerationAction::Ban => "ban",
        ModerationAction::Blocked => "blocked",
    };
    metrics::counter!(COUNTER_MODERATION, "action" => label).increment(1);
}

pub fn record_key_rotation() {
    metrics::counter!(COUNTER_KEY_ROTATIONS).increment(1);
}

/// 记录加解密失败（op: encrypt / decrypt）
pub fn record_crypto_failure(op: &'static str) {
    metrics::counter!(COUNTER_CRYPTO_FAILURES, "op" => op).increment(1);
}

/// 更新限流器跟踪的身份数（Gauge）。由清理任务周期调用。
pub fn record_tracked_identities(count: usize) {
    metrics::gauge!(GAUGE_TRACKED_IDENTITIES).set(count as f64);
}

/// 更新未过期封禁记录数（Gauge）
pub fn record_active_bans(count: usize) {
    metrics::gauge!(GAUGE_ACTIVE_BANS).set(count as f64);
}
