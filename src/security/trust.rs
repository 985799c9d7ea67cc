use serde::{Deserialize, Serialize};

/// 信任分上下限与初始值
pub const TRUST_MIN: i32 = 0;
pub const TRUST_MAX: i32 = 100;
pub const TRUST_NEUTRAL: i32 = 50;

/// 各类行为对信任分的影响
pub const SPOOF_PENALTY: i32 = 20;
pub const SUSPICIOUS_PENALTY: i32 = 10;
pub const CLEAN_WINDOW_REWARD: i32 = 1;

/// 封禁时长上限（24 小时）
pub const MAX_BLOCK_MS: i64 = 24 * 60 * 60 * 1000;

/// 单个身份（IP / 会话 / 可疑桶）的信任记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRecord {
    /// 身份标识（含作用域前缀）
    pub identity: String,
    /// 当前窗口起点（毫秒时间戳）
    pub window_start: i64,
    /// 当前窗口内请求数
    pub request_count: u32,
    /// 信任分（0-100）
    pub trust_score: i32,
    /// 可疑行为累计次数
    pub suspicious_activity_count: u32,
    /// 封禁截止时间（毫秒时间戳）
    pub blocked_until: Option<i64>,
    /// 最近一次请求时间（毫秒时间戳）
    pub last_seen: i64,
    /// 当前窗口是否出现过超限或可疑
    pub window_tainted: bool,
}

impl TrustRecord {
    pub fn new(identity: &str, now_ms: i64) -> Self {
        Self {
            identity: identity.to_string(),
            window_start: now_ms,
            request_count: 0,
            trust_score: TRUST_NEUTRAL,
            suspicious_activity_count: 0,
            blocked_until: None,
            last_seen: now_ms,
            window_tainted: false,
        }
    }

    /// 调整信任分（始终保持在 0-100）
    pub fn adjust_trust(&mut self, delta: i32) {
        self.trust_score = (self.trust_score + delta).clamp(TRUST_MIN, TRUST_MAX);
    }

    /// 记录一次可疑行为
    pub fn record_suspicious(&mut self) {
        self.suspicious_activity_count = self.suspicious_activity_count.saturating_add(1);
        self.adjust_trust(-SUSPICIOUS_PENALTY);
        self.window_tainted = true;
    }

    /// 记录一次伪造身份
    pub fn record_spoof(&mut self) {
        self.suspicious_activity_count = self.suspicious_activity_count.saturating_add(1);
        self.adjust_trust(-SPOOF_PENALTY);
        self.window_tainted = true;
    }

    /// 是否处于封禁中
    pub fn is_blocked(&self, now_ms: i64) -> bool {
        self.blocked_until.map(|until| now_ms < until).unwrap_or(false)
    }

    /// 窗口过期则重置；干净的窗口奖励少量信任分
    ///
    /// 返回是否发生了重置
    pub fn roll_window(&mut self, now_ms: i64, window_ms: i64) -> bool {
        if now_ms - self.window_start < window_ms {
            return false;
        }
        if self.request_count > 0 && !self.window_tainted {
            self.adjust_trust(CLEAN_WINDOW_REWARD);
        }
        self.window_start = now_ms;
        self.request_count = 0;
        self.window_tainted = false;
        true
    }

    /// 闲置恢复：信任分回升（最多回到中性值），可疑计数回落
    pub fn rehabilitate(&mut self, trust_step: i32) {
        if self.trust_score < TRUST_NEUTRAL {
            self.trust_score = (self.trust_score + trust_step).min(TRUST_NEUTRAL);
        }
        self.suspicious_activity_count = self.suspicious_activity_count.saturating_sub(1);
    }
}

/// 根据信任分计算限流系数
///
/// 高信任身份获得完整配额，低信任身份配额收紧
pub fn limit_factor(trust_score: i32) -> f64 {
    match trust_score {
        s if s >= 80 => 1.0,
        s if s >= 50 => 0.8,
        s if s >= 20 => 0.5,
        _ => 0.2,
    }
}

/// 有效配额 = floor(基础配额 × 系数)
pub fn effective_limit(base_limit: u32, trust_score: i32) -> u32 {
    (base_limit as f64 * limit_factor(trust_score)).floor() as u32
}

/// 计算封禁时长（毫秒），上限 24 小时
pub fn block_duration_ms(base_block_ms: i64, trust_score: i32, suspicious_count: u32) -> i64 {
    let mut multiplier = if trust_score < 20 {
        3.0
    } else if trust_score < 50 {
        2.0
    } else {
        1.0
    };

    if suspicious_count > 5 {
        multiplier *= 2.0;
    } else if suspicious_count > 2 {
        multiplier *= 1.5;
    }

    let duration = (base_block_ms as f64 * multiplier).round() as i64;
    duration.min(MAX_BLOCK_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_fairness() {
        assert_eq!(effective_limit(100, 100), 100);
        assert_eq!(effective_limit(100, 0), 20);
        assert_eq!(effective_limit(7, 0), 1);
        assert_eq!(effective_limit(100, 50), 80);
        assert_eq!(effective_limit(100, 20), 50);
        assert_eq!(effective_limit(100, 19), 20);
    }

    #[test]
    fn test_block_duration_multipliers() {
        let base = 60_000;
        assert_eq!(block_duration_ms(base, 80, 0), 60_000);
        assert_eq!(block_duration_ms(base, 40, 0), 120_000);
        assert_eq!(block_duration_ms(base, 10, 0), 180_000);
        assert_eq!(block_duration_ms(base, 10, 3), 270_000);
        assert_eq!(block_duration_ms(base, 10, 6), 360_000);
    }

    #[test]
    fn test_block_duration_capped() {
        let base = 10 * 60 * 60 * 1000;
        assert_eq!(block_duration_ms(base, 0, 10), MAX_BLOCK_MS);
    }

    #[test]
    fn test_trust_bounded() {
        let mut record = TrustRecord::new("ip:1.2.3.4", 0);
        for _ in 0..10 {
            record.record_spoof();
        }
        assert_eq!(record.trust_score, 0);
        for _ in 0..200 {
            record.rehabilitate(5);
        }
        assert_eq!(record.trust_score, TRUST_NEUTRAL);
        assert_eq!(record.suspicious_activity_count, 0);

        for _ in 0..200 {
            record.adjust_trust(5);
        }
        assert_eq!(record.trust_score, TRUST_MAX);
    }

    #[test]
    fn test_clean_window_rewards_trust() {
        let mut record = TrustRecord::new("session:s1", 0);
        record.request_count = 3;
        assert!(record.roll_window(60_000, 60_000));
        assert_eq!(record.trust_score, TRUST_NEUTRAL + CLEAN_WINDOW_REWARD);

        record.request_count = 3;
        record.record_suspicious();
        assert!(record.roll_window(120_000, 60_000));
        assert_eq!(record.trust_score, TRUST_NEUTRAL + CLEAN_WINDOW_REWARD - SUSPICIOUS_PENALTY);
    }
}
