/// 安全模块
///
/// 对话式线索收集 agent 的滥用防护核心：
/// - 会话警告状态机（0 -> 1 -> 2 -> 3 -> 封禁，严格按序，越级请求被纠正）
/// - 信任分自适应限流（按 IP / 会话 / 可疑桶，伪造来源直接硬封禁）
/// - 按优先级执行的可插拔安全检查流水线（出错即封禁）
/// - 封禁记录
///
/// 宿主程序通常只需要持有 `SecurityService`。
pub mod ban;
pub mod checks;
pub mod classifier;
pub mod identity;
pub mod pipeline;
pub mod rate_limiter;
pub mod result;
pub mod security_service;
pub mod trust;
pub mod warning;

pub use ban::{BanRecord, BanStore};
pub use classifier::{Classification, PatternClassifier, RiskClassifier, RiskTier};
pub use identity::{ClientMeta, IdentityVerdict};
pub use pipeline::{CheckContext, SecurityCheck, SecurityPipeline};
pub use rate_limiter::{
    ChatRateLimits, DenialReason, RateLimitConfig, RateLimitResult, RetentionConfig,
    TrustScoredRateLimiter,
};
pub use result::{PublicDecision, RiskDetail, SecurityAction, SecurityLevel, SecurityResult};
pub use security_service::{SecurityConfig, SecurityService, SecurityStats};
pub use trust::TrustRecord;
pub use warning::{
    ModerationAction, ModerationOutcome, ModerationRequest, WarningConfig, WarningState,
    WarningStateMachine,
};
