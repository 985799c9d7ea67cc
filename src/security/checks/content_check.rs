use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{GuardError, Result};
use crate::security::classifier::{Classification, RiskClassifier, RiskTier};
use crate::security::pipeline::{CheckContext, SecurityCheck};
use crate::security::result::{RiskDetail, SecurityAction, SecurityLevel, SecurityResult};

pub const PRIORITY: u32 = 30;

/// 内容风险检查：调用外部分类器，把风险等级映射为检查结果
///
/// 分类器调用带超时，超时按检查失败处理（流水线会转换为封禁）
pub struct ContentCheck {
    classifier: Arc<dyn RiskClassifier>,
    timeout: Duration,
}

impl ContentCheck {
    pub fn new(classifier: Arc<dyn RiskClassifier>, timeout: Duration) -> Self {
        Self { classifier, timeout }
    }

    fn to_result(classification: Classification) -> SecurityResult {
        let detail = RiskDetail {
            patterns: classification.patterns,
            tier: Some(classification.tier.as_str().to_string()),
        };
        let score = classification.score;

        let result = match classification.tier {
            RiskTier::Safe => return SecurityResult::clean(),
            RiskTier::Low => SecurityResult::flagged(SecurityLevel::Suspicious, score, SecurityAction::None),
            RiskTier::Medium => {
                SecurityResult::flagged(SecurityLevel::Suspicious, score, SecurityAction::Warning)
            }
            RiskTier::High => SecurityResult::flagged(SecurityLevel::Troll, score, SecurityAction::Warning),
            RiskTier::Critical => SecurityResult::blocked(SecurityLevel::Troll, score, "critical_content"),
        };
        result.with_risk_detail(detail)
    }
}

#[async_trait]
impl SecurityCheck for ContentCheck {
    fn name(&self) -> &'static str {
        "content_check"
    }

    fn priority(&self) -> u32 {
        PRIORITY
    }

    fn applies_to(&self, ctx: &CheckContext) -> bool {
        !ctx.message.trim().is_empty()
    }

    async fn evaluate(&self, ctx: &CheckContext, _prior: &[SecurityResult]) -> Result<SecurityResult> {
        let classification = tokio::time::timeout(self.timeout, self.classifier.classify(&ctx.message))
            .await
            .map_err(|_| {
                warn!(
                    session_id = %ctx.session_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "⏱️ 内容分类器超时"
                );
                GuardError::Timeout(format!("classifier exceeded {:?}", self.timeout))
            })??;

        Ok(Self::to_result(classification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::identity::ClientMeta;

    struct Fixed(RiskTier);

    #[async_trait]
    impl RiskClassifier for Fixed {
        async fn classify(&self, _text: &str) -> Result<Classification> {
            Ok(Classification {
                tier: self.0,
                score: 0.5,
                patterns: vec!["p".into()],
            })
        }
    }

    struct Slow;

    #[async_trait]
    impl RiskClassifier for Slow {
        async fn classify(&self, _text: &str) -> Result<Classification> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Classification::safe())
        }
    }

    fn ctx() -> CheckContext {
        CheckContext::new("s1", "some text", ClientMeta::default())
    }

    #[tokio::test]
    async fn test_tier_mapping() {
        let cases = [
            (RiskTier::Safe, true, SecurityLevel::Clean, SecurityAction::None),
            (RiskTier::Low, true, SecurityLevel::Suspicious, SecurityAction::None),
            (RiskTier::Medium, true, SecurityLevel::Suspicious, SecurityAction::Warning),
            (RiskTier::High, true, SecurityLevel::Troll, SecurityAction::Warning),
            (RiskTier::Critical, false, SecurityLevel::Troll, SecurityAction::None),
        ];
        for (tier, allowed, level, action) in cases {
            let check = ContentCheck::new(Arc::new(Fixed(tier)), Duration::from_secs(1));
            let r = check.evaluate(&ctx(), &[]).await.unwrap();
            assert_eq!(r.allowed, allowed, "{:?}", tier);
            assert_eq!(r.level, level, "{:?}", tier);
            assert_eq!(r.action, action, "{:?}", tier);
        }
    }

    #[tokio::test]
    async fn test_classifier_timeout_is_error() {
        let check = ContentCheck::new(Arc::new(Slow), Duration::from_millis(100));
        let err = check.evaluate(&ctx(), &[]).await.unwrap_err();
        assert!(matches!(err, GuardError::Timeout(_)));
    }
}
