/// 捣乱行为检测
///
/// 只根据消息本身与会话最近的消息历史报告事实（重复刷屏、全大写、字符洪水、
/// 键盘乱敲、链接堆砌），不直接发出警告；是否警告由外部决策者决定。
use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{GuardError, Result};
use crate::security::pipeline::{CheckContext, SecurityCheck};
use crate::security::result::{RiskDetail, SecurityAction, SecurityLevel, SecurityResult};

pub const PRIORITY: u32 = 20;

/// 各事实的权重
const WEIGHT_REPEATED: f64 = 0.4;
const WEIGHT_CAPS: f64 = 0.2;
const WEIGHT_FLOODING: f64 = 0.2;
const WEIGHT_GIBBERISH: f64 = 0.3;
const WEIGHT_LINKS: f64 = 0.4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrollConfig {
    /// 每个会话保留的最近消息数
    pub history_size: usize,
    /// 历史中出现多少次相同消息算刷屏
    pub repeat_threshold: usize,
    /// 大写字母占比阈值
    pub caps_ratio: f64,
    /// 判断大写占比所需的最少字母数
    pub caps_min_letters: usize,
    /// 同一字符连续出现多少次算洪水
    pub flood_run: usize,
    /// 连续辅音个数（键盘乱敲）
    pub gibberish_run: usize,
    /// 单条消息链接数阈值
    pub link_threshold: usize,
    /// 分数达到此值判定为 troll，否则为 suspicious
    pub troll_score: f64,
}

impl Default for TrollConfig {
    fn default() -> Self {
        Self {
            history_size: 5,
            repeat_threshold: 2,
            caps_ratio: 0.7,
            caps_min_letters: 12,
            flood_run: 6,
            gibberish_run: 6,
            link_threshold: 3,
            troll_score: 0.6,
        }
    }
}

/// 单个会话的最近消息
#[derive(Debug, Default)]
struct SessionHistory {
    last_seen_ms: i64,
    messages: VecDeque<String>,
}

pub struct TrollCheck {
    config: TrollConfig,
    gibberish: Regex,
    links: Regex,
    history: DashMap<String, SessionHistory>,
}

impl TrollCheck {
    pub fn new(config: TrollConfig) -> Result<Self> {
        let gibberish = Regex::new(&format!(
            "(?i)[bcdfghjklmnpqrstvwxz]{{{},}}",
            config.gibberish_run
        ))
        .map_err(|e| GuardError::Configuration(format!("troll gibberish pattern: {}", e)))?;
        let links = Regex::new(r"(?i)\b(https?://|www\.)\S+")
            .map_err(|e| GuardError::Configuration(format!("troll link pattern: {}", e)))?;

        Ok(Self {
            config,
            gibberish,
            links,
            history: DashMap::new(),
        })
    }

    /// 会话结束时丢弃消息历史
    pub fn forget_session(&self, session_id: &str) {
        self.history.remove(session_id);
    }

    pub fn tracked_sessions(&self) -> usize {
        self.history.len()
    }

    /// 删除闲置超过 `idle_ms` 的会话历史，返回删除数
    pub fn sweep_idle(&self, now_ms: i64, idle_ms: i64) -> usize {
        let before = self.history.len();
        self.history.retain(|_, history| now_ms - history.last_seen_ms < idle_ms);
        before.saturating_sub(self.history.len())
    }

    /// 记录消息并返回之前出现过的相同消息次数
    fn remember(&self, session_id: &str, message: &str, now_ms: i64) -> usize {
        let normalized = message
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        let mut entry = self.history.entry(session_id.to_string()).or_default();
        let history = entry.value_mut();
        history.last_seen_ms = history.last_seen_ms.max(now_ms);
        let messages = &mut history.messages;
        let seen = messages.iter().filter(|m| **m == normalized).count();
        messages.push_back(normalized);
        while messages.len() > self.config.history_size {
            messages.pop_front();
        }
        seen
    }

    fn is_shouting(&self, message: &str) -> bool {
        let (letters, upper) = message
            .chars()
            .filter(|c| c.is_alphabetic())
            .fold((0usize, 0usize), |(l, u), c| (l + 1, u + c.is_uppercase() as usize));
        letters >= self.config.caps_min_letters
            && upper as f64 / letters as f64 >= self.config.caps_ratio
    }

    fn is_flooding(&self, message: &str) -> bool {
        let mut run = 0usize;
        let mut last: Option<char> = None;
        for c in message.chars() {
            if c.is_whitespace() {
                run = 0;
                last = None;
                continue;
            }
            if Some(c) == last {
                run += 1;
            } else {
                run = 1;
                last = Some(c);
            }
            if run >= self.config.flood_run {
                return true;
            }
        }
        false
    }

    fn facts(&self, ctx: &CheckContext) -> Vec<(&'static str, f64)> {
        let message = ctx.message.as_str();
        let mut facts = Vec::new();
        let seen = self.remember(&ctx.session_id, message, ctx.received_at_ms());
        if seen >= self.config.repeat_threshold {
            facts.push(("repeated_message", WEIGHT_REPEATED));
        }
        if self.is_shouting(message) {
            facts.push(("excessive_caps", WEIGHT_CAPS));
        }
        if self.is_flooding(message) {
            facts.push(("char_flooding", WEIGHT_FLOODING));
        }
        if self.gibberish.is_match(message) {
            facts.push(("gibberish", WEIGHT_GIBBERISH));
        }
        if self.links.find_iter(message).count() >= self.config.link_threshold {
            facts.push(("link_spam", WEIGHT_LINKS));
        }
        facts
    }
}

#[async_trait]
impl SecurityCheck for TrollCheck {
    fn name(&self) -> &'static str {
        "troll_check"
    }

    fn priority(&self) -> u32 {
        PRIORITY
    }

    fn applies_to(&self, ctx: &CheckContext) -> bool {
        !ctx.message.trim().is_empty()
    }

    async fn evaluate(&self, ctx: &CheckContext, _prior: &[SecurityResult]) -> Result<SecurityResult> {
        let facts = self.facts(ctx);
        if facts.is_empty() {
            return Ok(SecurityResult::clean());
        }

        let score: f64 = facts.iter().map(|(_, w)| w).sum::<f64>().min(1.0);
        let level = if score >= self.config.troll_score {
            SecurityLevel::Troll
        } else {
            SecurityLevel::Suspicious
        };
        let patterns = facts.iter().map(|(name, _)| name.to_string()).collect();

        Ok(SecurityResult::flagged(level, score, SecurityAction::None)
            .with_reason("troll_patterns")
            .with_risk_detail(RiskDetail::from_patterns(patterns)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::identity::ClientMeta;
    use chrono::Utc;

    fn check() -> TrollCheck {
        TrollCheck::new(TrollConfig::default()).unwrap()
    }

    async fn eval(check: &TrollCheck, session: &str, msg: &str) -> SecurityResult {
        let ctx = CheckContext::new(session, msg, ClientMeta::default());
        check.evaluate(&ctx, &[]).await.unwrap()
    }

    #[tokio::test]
    async fn test_normal_message_is_clean() {
        let check = check();
        let r = eval(&check, "s1", "We are looking to automate our invoicing workflow.").await;
        assert_eq!(r.level, SecurityLevel::Clean);
    }

    #[tokio::test]
    async fn test_repetition_detected_per_session() {
        let check = check();
        assert!(!eval(&check, "s1", "buy now").await.is_warning());
        assert!(!eval(&check, "s1", "Buy   NOW").await.is_warning());
        let r = eval(&check, "s1", "buy now").await;
        assert_eq!(r.patterns(), &["repeated_message"]);
        assert_eq!(r.action, SecurityAction::None);

        // 其他会话不受影响
        assert!(!eval(&check, "s2", "buy now").await.is_warning());
    }

    #[tokio::test]
    async fn test_shouting_and_flooding() {
        let check = check();
        let r = eval(&check, "s1", "HELLO THIS IS SO ANNOYING!!!!!!!").await;
        assert_eq!(r.level, SecurityLevel::Suspicious);
        assert_eq!(r.patterns(), &["excessive_caps", "char_flooding"]);
    }

    #[tokio::test]
    async fn test_gibberish_and_links_reach_troll() {
        let check = check();
        let r = eval(
            &check,
            "s1",
            "asdfghjkl http://a.example http://b.example www.c.example",
        )
        .await;
        assert_eq!(r.level, SecurityLevel::Troll);
        assert!(r.patterns().contains(&"gibberish".to_string()));
        assert!(r.patterns().contains(&"link_spam".to_string()));
    }

    #[test]
    fn test_history_bounded_and_forgotten() {
        let check = check();
        for i in 0..20 {
            check.remember("s1", &format!("message {}", i), 1_000 + i);
        }
        assert_eq!(check.history.get("s1").map(|h| h.messages.len()), Some(5));
        check.forget_session("s1");
        assert_eq!(check.tracked_sessions(), 0);
    }

    #[tokio::test]
    async fn test_idle_histories_swept() {
        let check = check();
        let start = Utc::now();
        for i in 0..500 {
            let ctx = CheckContext::new(&format!("s{}", i), "hello there", ClientMeta::default())
                .at(start);
            check.evaluate(&ctx, &[]).await.unwrap();
        }
        let late = CheckContext::new("late", "hello there", ClientMeta::default())
            .at(start + chrono::Duration::hours(47));
        check.evaluate(&late, &[]).await.unwrap();
        assert_eq!(check.tracked_sessions(), 501);

        let day_ms = 24 * 60 * 60 * 1000;
        let now_ms = (start + chrono::Duration::hours(48)).timestamp_millis();
        assert_eq!(check.sweep_idle(now_ms, day_ms), 500);
        assert_eq!(check.tracked_sessions(), 1);
        assert!(check.history.contains_key("late"));
    }
}
