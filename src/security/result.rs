//! 安全检查结果
//!
//! 每个检查产出一个不可变的 `SecurityResult`，由流水线合并为最终决策。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 安全级别（按严重程度递增）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// 正常
    Clean,
    /// 可疑
    Suspicious,
    /// 捣乱
    Troll,
    /// 已封禁
    Banned,
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Clean => "clean",
            SecurityLevel::Suspicious => "suspicious",
            SecurityLevel::Troll => "troll",
            SecurityLevel::Banned => "banned",
        }
    }
}

/// 建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityAction {
    None,
    Warning,
    Ban,
}

/// 风险详情
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskDetail {
    /// 命中的模式
    pub patterns: Vec<String>,
    /// 分类器给出的风险等级（如有）
    pub tier: Option<String>,
}

impl RiskDetail {
    pub fn from_patterns(patterns: Vec<String>) -> Self {
        Self {
            patterns,
            tier: None,
        }
    }

    /// 合并：模式去重并保持首次出现的顺序，等级取较严重者
    fn union(mut self, other: &RiskDetail) -> Self {
        for p in &other.patterns {
            if !self.patterns.contains(p) {
                self.patterns.push(p.clone());
            }
        }
        if self.tier.is_none() {
            self.tier = other.tier.clone();
        }
        self
    }
}

/// 安全检查结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityResult {
    /// 是否允许
    pub allowed: bool,
    /// 安全级别
    pub level: SecurityLevel,
    /// 风险分（0-1）
    pub score: f64,
    /// 建议动作
    pub action: SecurityAction,
    /// 原因
    pub reason: Option<String>,
    /// 风险详情
    pub risk_detail: Option<RiskDetail>,
    /// 附加信息
    pub metadata: Map<String, Value>,
    /// 产生时间
    pub timestamp: DateTime<Utc>,
}

impl SecurityResult {
    fn base(allowed: bool, level: SecurityLevel, score: f64, action: SecurityAction) -> Self {
        Self {
            allowed,
            level,
            score: score.clamp(0.0, 1.0),
            action,
            reason: None,
            risk_detail: None,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// 正常放行
    pub fn clean() -> Self {
        Self::base(true, SecurityLevel::Clean, 0.0, SecurityAction::None)
    }

    /// 放行但标记（不拦截）
    pub fn flagged(level: SecurityLevel, score: f64, action: SecurityAction) -> Self {
        Self::base(true, level, score, action)
    }

    /// 拦截（非封禁）
    pub fn blocked(level: SecurityLevel, score: f64, reason: impl Into<String>) -> Self {
        Self::base(false, level, score, SecurityAction::None).with_reason(reason)
    }

    /// 封禁
    pub fn banned(reason: impl Into<String>) -> Self {
        Self::base(false, SecurityLevel::Banned, 1.0, SecurityAction::Ban).with_reason(reason)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_risk_detail(mut self, detail: RiskDetail) -> Self {
        self.risk_detail = Some(detail);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// 是否需要告警合并（级别高于 clean 或建议了警告）
    pub fn is_warning(&self) -> bool {
        self.level > SecurityLevel::Clean || self.action != SecurityAction::None
    }

    /// 模式列表（没有风险详情时为空）
    pub fn patterns(&self) -> &[String] {
        self.risk_detail
            .as_ref()
            .map(|d| d.patterns.as_slice())
            .unwrap_or(&[])
    }

    /// 合并多个告警级结果：最高级别/分数胜出，模式取并集，元数据取并集
    pub fn merge_warnings(results: &[SecurityResult]) -> Option<SecurityResult> {
        let mut iter = results.iter().filter(|r| r.is_warning());
        let first = iter.next()?.clone();

        let merged = iter.fold(first, |acc, r| {
            let (mut winner, loser) = if (r.level, r.action) > (acc.level, acc.action)
                || ((r.level, r.action) == (acc.level, acc.action) && r.score > acc.score)
            {
                (r.clone(), acc)
            } else {
                (acc, r.clone())
            };
            winner.score = winner.score.max(loser.score);
            winner.risk_detail = match (winner.risk_detail.take(), loser.risk_detail.as_ref()) {
                (Some(w), Some(l)) => Some(w.union(l)),
                (Some(w), None) => Some(w),
                (None, Some(l)) => Some(l.clone()),
                (None, None) => None,
            };
            for (k, v) in loser.metadata {
                winner.metadata.entry(k).or_insert(v);
            }
            if winner.reason.is_none() {
                winner.reason = loser.reason;
            }
            winner
        });
        Some(merged)
    }

    /// 合并正常结果：元数据取并集
    pub fn merge_clean(results: &[SecurityResult]) -> SecurityResult {
        let mut merged = SecurityResult::clean();
        for r in results {
            for (k, v) in &r.metadata {
                merged.metadata.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

/// 对外决策
///
/// 对终端用户只暴露两种结果，不泄露内部评分逻辑
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum PublicDecision {
    Allowed,
    Denied { reason: String },
}

impl PublicDecision {
    pub const GENERIC_DENIAL: &'static str = "Your request could not be processed right now.";

    pub fn is_allowed(&self) -> bool {
        matches!(self, PublicDecision::Allowed)
    }
}

impl From<&SecurityResult> for PublicDecision {
    fn from(result: &SecurityResult) -> Self {
        if result.allowed {
            PublicDecision::Allowed
        } else {
            PublicDecision::Denied {
                reason: Self::GENERIC_DENIAL.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(SecurityLevel::Clean < SecurityLevel::Suspicious);
        assert!(SecurityLevel::Suspicious < SecurityLevel::Troll);
        assert!(SecurityLevel::Troll < SecurityLevel::Banned);
    }

    #[test]
    fn test_merge_warnings_highest_wins_patterns_unioned() {
        let a = SecurityResult::flagged(SecurityLevel::Suspicious, 0.4, SecurityAction::None)
            .with_risk_detail(RiskDetail::from_patterns(vec!["caps".into(), "repeat".into()]))
            .with_metadata("a", 1);
        let b = SecurityResult::flagged(SecurityLevel::Troll, 0.7, SecurityAction::Warning)
            .with_risk_detail(RiskDetail::from_patterns(vec!["repeat".into(), "gibberish".into()]))
            .with_metadata("b", 2);
        let clean = SecurityResult::clean().with_metadata("c", 3);

        let merged = SecurityResult::merge_warnings(&[a, clean, b]).unwrap();
        assert_eq!(merged.level, SecurityLevel::Troll);
        assert_eq!(merged.action, SecurityAction::Warning);
        assert!((merged.score - 0.7).abs() < f64::EPSILON);
        assert_eq!(merged.patterns(), &["repeat", "gibberish", "caps"]);
        assert!(merged.metadata.contains_key("a"));
        assert!(merged.metadata.contains_key("b"));
        assert!(!merged.metadata.contains_key("c"));
    }

    #[test]
    fn test_merge_warnings_none_when_all_clean() {
        assert!(SecurityResult::merge_warnings(&[SecurityResult::clean()]).is_none());
    }

    #[test]
    fn test_public_decision_is_generic() {
        let result = SecurityResult::blocked(SecurityLevel::Suspicious, 0.9, "rate_limited: ip");
        match PublicDecision::from(&result) {
            PublicDecision::Denied { reason } => assert!(!reason.contains("rate")),
            PublicDecision::Allowed => panic!("should be denied"),
        }
    }
}
