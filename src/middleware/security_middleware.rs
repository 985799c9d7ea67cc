/// 安全中间件
///
/// 宿主程序的请求入口：内部保留完整判定，对外只暴露通用拒绝信息

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{GuardError, Result};
use crate::security::{
    ClientMeta, DenialReason, PublicDecision, SecurityResult, SecurityService,
};

/// 安全中间件
pub struct SecurityMiddleware {
    security_service: Arc<SecurityService>,
}

impl SecurityMiddleware {
    pub fn new(security_service: Arc<SecurityService>) -> Self {
        Self { security_service }
    }

    pub fn service(&self) -> &Arc<SecurityService> {
        &self.security_service
    }

    /// 聊天消息进入 agent 之前的检查，返回完整判定（仅供内部使用）
    pub async fn inspect_message(
        &self,
        session_id: &str,
        message: &str,
        meta: ClientMeta,
    ) -> SecurityResult {
        self.security_service
            .check_security(session_id, message, meta)
            .await
    }

    /// 聊天消息进入 agent 之前的检查，返回可直接回给客户端的判定
    pub async fn guard_message(
        &self,
        session_id: &str,
        message: &str,
        meta: ClientMeta,
    ) -> PublicDecision {
        let result = self.inspect_message(session_id, message, meta).await;
        if !result.allowed {
            warn!(
                "消息被拒绝: session={} reason={}",
                session_id,
                result.reason.as_deref().unwrap_or("unknown")
            );
        } else if result.is_warning() {
            info!(
                "消息放行但带有警告信号: session={} level={} patterns={:?}",
                session_id,
                result.level.as_str(),
                result.patterns()
            );
        }
        PublicDecision::from(&result)
    }

    /// 普通接口调用前的限流检查
    pub fn check_api(&self, identity: &str, meta: &ClientMeta) -> Result<()> {
        let result = self.security_service.check_api_rate_limit(identity, Some(meta));
        match result.denial {
            None => Ok(()),
            Some(DenialReason::IdentitySpoofed) => Err(GuardError::IdentityValidation(format!(
                "{} presented a spoofed client address",
                identity
            ))),
            Some(reason) => Err(GuardError::check_failure(
                "rate_limit",
                format!("{:?}, retry after {:?}s", reason, result.retry_after),
            )),
        }
    }
}
