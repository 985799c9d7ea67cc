/// 会话警告状态机
///
/// 严格的升级阶梯：0 -> 1 -> 2 -> 3（可封禁）-> 封禁（状态删除，会话重用时从 0 开始）
///
/// 外部决策者（驱动对话的 agent）只能提交警告/封禁 *请求*，
/// 状态机负责校验顺序并在必要时纠正：
/// - 跳级的警告请求被静默纠正为下一级，并记入审计日志
/// - 未满足前置条件的封禁请求被降级为下一次警告
/// - 无法识别的动作一律按“拦截”处理
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::infra::metrics;
use crate::store::{KeyedStore, MemoryStore};

/// 可封禁的警告次数
pub const BAN_THRESHOLD: u8 = 3;

/// 会话警告状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningState {
    pub session_id: String,
    /// 警告次数（0-3）
    pub warning_count: u8,
    pub last_warning_time: Option<DateTime<Utc>>,
    /// 检测原因记录（按时间顺序）
    pub detection_log: Vec<String>,
    /// 是否可封禁（warning_count >= 3）
    pub can_ban: bool,
}

impl WarningState {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            warning_count: 0,
            last_warning_time: None,
            detection_log: Vec::new(),
            can_ban: false,
        }
    }

    /// 唯一的状态转换入口
    fn apply_warning(&mut self, level: u8, reason: &str) {
        debug_assert!(level <= BAN_THRESHOLD);
        self.warning_count = level.min(BAN_THRESHOLD);
        self.can_ban = self.warning_count >= BAN_THRESHOLD;
        self.last_warning_time = Some(Utc::now());
        self.detection_log.push(reason.to_string());
    }
}

/// 最终动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationAction {
    /// 发出警告
    Warning,
    /// 封禁
    Ban,
    /// 无法识别的请求，按拦截处理
    Blocked,
}

/// 警告/封禁请求的处理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationOutcome {
    pub final_action: ModerationAction,
    pub warning_level: u8,
    /// 面向用户的提示
    pub message: String,
    pub should_ban: bool,
    /// 封禁时长（仅封禁时有值），由调用方负责实际终止会话
    pub ban_duration: Option<Duration>,
}

/// 外部决策者提交的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationRequest {
    Warning { level: u8 },
    Ban,
    Unknown(String),
}

impl ModerationRequest {
    /// 解析 agent 工具调用中的动作名
    pub fn parse(action: &str, level: Option<u8>) -> Self {
        match action.trim().to_ascii_lowercase().as_str() {
            "warn" | "warning" | "issue_warning" => ModerationRequest::Warning {
                level: level.unwrap_or(0),
            },
            "ban" | "terminate" | "ban_user" => ModerationRequest::Ban,
            other => ModerationRequest::Unknown(other.to_string()),
        }
    }
}

/// 面向用户的提示文案
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarningMessages {
    pub first: String,
    pub second: String,
    pub final_warning: String,
    pub banned: String,
    pub blocked: String,
}

impl Default for WarningMessages {
    fn default() -> Self {
        Self {
            first: "Let's keep the conversation focused on your project.".to_string(),
            second: "Please keep this conversation on topic and respectful.".to_string(),
            final_warning: "Final notice: further misuse will end this conversation.".to_string(),
            banned: "This conversation has been ended.".to_string(),
            blocked: "This request could not be processed.".to_string(),
        }
    }
}

impl WarningMessages {
    fn for_level(&self, level: u8) -> &str {
        match level {
            0 | 1 => &self.first,
            2 => &self.second,
            _ => &self.final_warning,
        }
    }
}

/// 状态机配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarningConfig {
    /// 封禁时长（秒）
    pub ban_duration_secs: u64,
    pub messages: WarningMessages,
}

impl Default for WarningConfig {
    fn default() -> Self {
        Self {
            ban_duration_secs: 24 * 60 * 60,
            messages: WarningMessages::default(),
        }
    }
}

enum Transition {
    Warned(u8),
    Banned,
}

/// 会话警告状态机
pub struct WarningStateMachine<S = MemoryStore<WarningState>> {
    store: S,
    config: WarningConfig,
}

impl WarningStateMachine {
    pub fn new(config: WarningConfig) -> Self {
        Self::with_store(MemoryStore::new(), config)
    }
}

impl<S> WarningStateMachine<S>
where
    S: KeyedStore<WarningState>,
{
    pub fn with_store(store: S, config: WarningConfig) -> Self {
        Self { store, config }
    }

    /// 请求发出警告
    ///
    /// 请求的级别只作参考：实际级别永远是 当前次数 + 1
    pub fn request_warning(
        &self,
        session_id: &str,
        requested_level: u8,
        reason: &str,
    ) -> ModerationOutcome {
        let warned = self.store.update_or_insert(
            session_id,
            || WarningState::new(session_id),
            |state| {
                let expected = state.warning_count + 1;
                if requested_level != expected {
                    warn!(
                        target: "leadguard::audit",
                        session_id = %session_id,
                        requested = requested_level,
                        expected = expected,
                        current = state.warning_count,
                        "⚠️ 警告顺序违规，已纠正为期望级别"
                    );
                    metrics::record_sequence_violation("warning");
                }

                if expected > BAN_THRESHOLD {
                    return None;
                }
                state.apply_warning(expected, reason);
                Some(expected)
            },
        );

        match warned {
            Some(level) => self.warning_outcome(session_id, level, reason),
            None => self.request_ban(session_id, reason),
        }
    }

    /// 请求封禁
    ///
    /// 前置条件：warning_count >= 3；否则降级为下一次警告，封禁永远不会越级发生
    pub fn request_ban(&self, session_id: &str, reason: &str) -> ModerationOutcome {
        let transition = self.store.update_or_insert(
            session_id,
            || WarningState::new(session_id),
            |state| {
                if state.warning_count >= BAN_THRESHOLD && state.can_ban {
                    return Transition::Banned;
                }
                let next = state.warning_count + 1;
                warn!(
                    target: "leadguard::audit",
                    session_id = %session_id,
                    current = state.warning_count,
                    "⚠️ 封禁请求未满足前置条件，降级为警告 {}",
                    next
                );
                metrics::record_sequence_violation("ban");
                state.apply_warning(next, reason);
                Transition::Warned(next)
            },
        );

        match transition {
            Transition::Warned(level) => self.warning_outcome(session_id, level, reason),
            Transition::Banned => {
                let history = self.store.delete(session_id);
                let warnings = history.map(|s| s.detection_log.len()).unwrap_or(0);
                warn!(
                    target: "leadguard::audit",
                    session_id = %session_id,
                    reason = %reason,
                    prior_warnings = warnings,
                    "🚫 会话已封禁"
                );
                metrics::record_moderation(ModerationAction::Ban);
                ModerationOutcome {
                    final_action: ModerationAction::Ban,
                    warning_level: BAN_THRESHOLD,
                    message: self.config.messages.banned.clone(),
                    should_ban: true,
                    ban_duration: Some(self.ban_duration()),
                }
            }
        }
    }

    /// 处理外部决策者提交的请求，无法识别的动作按拦截处理
    pub fn handle_request(
        &self,
        session_id: &str,
        request: &ModerationRequest,
        reason: &str,
    ) -> ModerationOutcome {
        match request {
            ModerationRequest::Warning { level } => {
                self.request_warning(session_id, *level, reason)
            }
            ModerationRequest::Ban => self.request_ban(session_id, reason),
            ModerationRequest::Unknown(action) => {
                warn!(
                    target: "leadguard::audit",
                    session_id = %session_id,
                    action = %action,
                    "❌ 无法识别的处置请求，按拦截处理"
                );
                metrics::record_moderation(ModerationAction::Blocked);
                ModerationOutcome {
                    final_action: ModerationAction::Blocked,
                    warning_level: self.warning_count(session_id),
                    message: self.config.messages.blocked.clone(),
                    should_ban: false,
                    ban_duration: None,
                }
            }
        }
    }

    /// 当前警告次数
    pub fn warning_count(&self, session_id: &str) -> u8 {
        self.store
            .get(session_id)
            .map(|s| s.warning_count)
            .unwrap_or(0)
    }

    /// 当前状态快照
    pub fn state(&self, session_id: &str) -> Option<WarningState> {
        self.store.get(session_id)
    }

    /// 清除会话的警告记录
    pub fn clear_warnings(&self, session_id: &str) -> bool {
        let existed = self.store.delete(session_id).is_some();
        if existed {
            info!("🧹 已清除会话 {} 的警告记录", session_id);
        }
        existed
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.config.ban_duration_secs)
    }

    pub fn tracked_sessions(&self) -> usize {
        self.store.len()
    }

    fn warning_outcome(&self, session_id: &str, level: u8, reason: &str) -> ModerationOutcome {
        info!(
            target: "leadguard::audit",
            session_id = %session_id,
            level = level,
            reason = %reason,
            "⚠️ 已发出警告"
        );
        metrics::record_moderation(ModerationAction::Warning);
        ModerationOutcome {
            final_action: ModerationAction::Warning,
            warning_level: level,
            message: self.config.messages.for_level(level).to_string(),
            should_ban: false,
            ban_duration: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> WarningStateMachine {
        WarningStateMachine::new(WarningConfig::default())
    }

    #[test]
    fn test_skipped_level_is_corrected() {
        let m = machine();
        let outcome = m.request_warning("s1", 3, "off topic");
        assert_eq!(outcome.final_action, ModerationAction::Warning);
        assert_eq!(outcome.warning_level, 1);
        assert_eq!(m.warning_count("s1"), 1);
        assert!(!m.state("s1").unwrap().can_ban);
    }

    #[test]
    fn test_ban_refused_before_threshold() {
        let m = machine();
        m.request_warning("s1", 1, "a");
        let outcome = m.request_ban("s1", "impatient agent");
        assert!(!outcome.should_ban);
        assert_eq!(outcome.final_action, ModerationAction::Warning);
        assert_eq!(outcome.warning_level, 2);
        assert_eq!(m.warning_count("s1"), 2);
    }

    #[test]
    fn test_full_ladder() {
        let m = machine();
        for level in 1..=3 {
            let outcome = m.request_warning("s1", level, "troll");
            assert_eq!(outcome.warning_level, level);
            assert!(!outcome.should_ban);
        }
        let state = m.state("s1").unwrap();
        assert!(state.can_ban);
        assert_eq!(state.detection_log.len(), 3);

        let outcome = m.request_ban("s1", "troll");
        assert!(outcome.should_ban);
        assert_eq!(outcome.final_action, ModerationAction::Ban);
        assert_eq!(outcome.ban_duration, Some(Duration::from_secs(86_400)));
        assert_eq!(m.warning_count("s1"), 0);
        assert!(m.state("s1").is_none());
    }

    #[test]
    fn test_fourth_warning_redirects_to_ban() {
        let m = machine();
        for _ in 0..3 {
            m.request_warning("s1", 0, "spam");
        }
        let outcome = m.request_warning("s1", 4, "spam");
        assert!(outcome.should_ban);
        assert_eq!(m.warning_count("s1"), 0);
    }

    #[test]
    fn test_unknown_action_fails_closed() {
        let m = machine();
        let request = ModerationRequest::parse("pardon", None);
        assert_eq!(request, ModerationRequest::Unknown("pardon".into()));
        let outcome = m.handle_request("s1", &request, "?");
        assert_eq!(outcome.final_action, ModerationAction::Blocked);
        assert!(!outcome.should_ban);
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(
            ModerationRequest::parse(" Warning ", Some(2)),
            ModerationRequest::Warning { level: 2 }
        );
        assert_eq!(ModerationRequest::parse("BAN", None), ModerationRequest::Ban);
    }

    #[test]
    fn test_clear_warnings() {
        let m = machine();
        m.request_warning("s1", 1, "a");
        assert!(m.clear_warnings("s1"));
        assert!(!m.clear_warnings("s1"));
        assert_eq!(m.warning_count("s1"), 0);
    }
}
