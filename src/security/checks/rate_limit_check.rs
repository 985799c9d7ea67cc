use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::security::pipeline::{CheckContext, SecurityCheck};
use crate::security::rate_limiter::{DenialReason, TrustScoredRateLimiter};
use crate::security::result::{SecurityLevel, SecurityResult};

pub const PRIORITY: u32 = 40;

/// 限流检查
///
/// 前面的检查报告了可疑及以上级别时，本次请求计入可疑桶并扣信任分
pub struct RateLimitCheck {
    limiter: Arc<TrustScoredRateLimiter>,
}

impl RateLimitCheck {
    pub fn new(limiter: Arc<TrustScoredRateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl SecurityCheck for RateLimitCheck {
    fn name(&self) -> &'static str {
        "rate_limit_check"
    }

    fn priority(&self) -> u32 {
        PRIORITY
    }

    async fn evaluate(&self, ctx: &CheckContext, prior: &[SecurityResult]) -> Result<SecurityResult> {
        let suspicious = prior.iter().any(|r| r.level >= SecurityLevel::Suspicious);
        let outcome = self.limiter.check_chat_at(
            &ctx.session_id,
            &ctx.meta,
            suspicious,
            ctx.received_at_ms(),
        );

        let result = match outcome.denial {
            None => SecurityResult::clean(),
            Some(DenialReason::IdentitySpoofed) => {
                SecurityResult::blocked(SecurityLevel::Troll, 1.0, "identity_spoofed")
            }
            Some(DenialReason::LimitExceeded) | Some(DenialReason::Blocked) => {
                SecurityResult::blocked(SecurityLevel::Suspicious, 0.8, "rate_limited")
            }
        };

        let mut result = result
            .with_metadata("rateLimit", outcome.limit)
            .with_metadata("rateRemaining", outcome.remaining)
            .with_metadata("trustScore", outcome.trust_score);
        if let Some(retry_after) = outcome.retry_after {
            result = result.with_metadata("retryAfter", retry_after);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::identity::ClientMeta;
    use crate::security::rate_limiter::{ChatRateLimits, RetentionConfig};
    use crate::security::result::SecurityAction;

    fn check() -> (RateLimitCheck, Arc<TrustScoredRateLimiter>) {
        let limiter = Arc::new(TrustScoredRateLimiter::new(
            ChatRateLimits::default(),
            RetentionConfig::default(),
        ));
        (RateLimitCheck::new(limiter.clone()), limiter)
    }

    #[tokio::test]
    async fn test_prior_suspicion_feeds_suspicious_bucket() {
        let (check, limiter) = check();
        let meta = ClientMeta::new(Some("8.8.8.8".parse().unwrap()));
        let ctx = CheckContext::new("s1", "hi", meta);
        let prior = [SecurityResult::flagged(SecurityLevel::Suspicious, 0.4, SecurityAction::None)];

        let r = check.evaluate(&ctx, &prior).await.unwrap();
        assert!(r.allowed);
        let record = limiter
            .record("8.8.8.8", &limiter.chat_limits().suspicious)
            .unwrap();
        assert_eq!(record.request_count, 1);
    }

    #[tokio::test]
    async fn test_spoofed_address_blocked() {
        let (check, _) = check();
        let meta = ClientMeta::new(Some("8.8.8.8".parse().unwrap()))
            .with_header("x-forwarded-for", "127.0.0.1");
        let ctx = CheckContext::new("s1", "hi", meta);

        let r = check.evaluate(&ctx, &[]).await.unwrap();
        assert!(!r.allowed);
        assert_eq!(r.reason.as_deref(), Some("identity_spoofed"));
        assert!(r.metadata.contains_key("retryAfter"));
    }
}
