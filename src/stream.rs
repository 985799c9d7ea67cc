//! 标准输入 JSON 行协议
//!
//! 每行一个请求，每个请求输出一行 JSON：
//! - 消息检查：`{"sessionId":"s1","message":"hi","peerAddr":"203.0.113.5","headers":{}}`
//! - 处置请求：`{"sessionId":"s1","action":"warn","level":1,"reason":"spam"}`
//! - 结束会话：`{"sessionId":"s1","action":"end_session"}`

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::security::{
    ClientMeta, ModerationOutcome, ModerationRequest, PublicDecision, SecurityResult,
    SecurityService,
};

/// 单行请求
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub session_id: String,
    #[serde(default)]
    pub message: String,
    pub peer_addr: Option<IpAddr>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub action: Option<String>,
    pub level: Option<u8>,
    pub reason: Option<String>,
}

impl StreamRequest {
    pub fn client_meta(&self) -> ClientMeta {
        self.headers
            .iter()
            .fold(ClientMeta::new(self.peer_addr), |meta, (name, value)| {
                meta.with_header(name, value)
            })
    }
}

/// 单行响应
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StreamResponse {
    Check {
        session_id: String,
        decision: PublicDecision,
        result: SecurityResult,
    },
    Moderation {
        session_id: String,
        outcome: ModerationOutcome,
    },
    SessionEnded {
        session_id: String,
    },
    Error {
        message: String,
    },
}

/// 处理一行输入
pub async fn handle_line(service: &SecurityService, line: &str) -> StreamResponse {
    let request: StreamRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return StreamResponse::Error {
                message: format!("invalid request: {}", e),
            }
        }
    };
    if request.session_id.trim().is_empty() {
        return StreamResponse::Error {
            message: "sessionId is required".to_string(),
        };
    }

    match request.action.as_deref() {
        None => {
            let result = service
                .check_security(&request.session_id, &request.message, request.client_meta())
                .await;
            StreamResponse::Check {
                decision: PublicDecision::from(&result),
                session_id: request.session_id,
                result,
            }
        }
        Some("end_session") => {
            service.end_session(&request.session_id);
            StreamResponse::SessionEnded {
                session_id: request.session_id,
            }
        }
        Some(action) => {
            let moderation = ModerationRequest::parse(action, request.level);
            let reason = request.reason.as_deref().unwrap_or("unspecified");
            let outcome = service.handle_moderation(&request.session_id, &moderation, reason);
            StreamResponse::Moderation {
                session_id: request.session_id,
                outcome,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{ModerationAction, PatternClassifier, SecurityConfig};
    use std::sync::Arc;

    fn service() -> SecurityService {
        SecurityService::new(
            SecurityConfig::default(),
            Arc::new(PatternClassifier::with_defaults().unwrap()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_check_line() {
        let service = service();
        let line = r#"{"sessionId":"s1","message":"We need a quote for 40 laptops","peerAddr":"203.0.113.5"}"#;
        match handle_line(&service, line).await {
            StreamResponse::Check { decision, result, .. } => {
                assert!(decision.is_allowed());
                assert!(result.allowed);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_moderation_line_is_sequence_checked() {
        let service = service();
        let line = r#"{"sessionId":"s1","action":"warn","level":3,"reason":"abuse"}"#;
        match handle_line(&service, line).await {
            StreamResponse::Moderation { outcome, .. } => {
                assert_eq!(outcome.final_action, ModerationAction::Warning);
                assert_eq!(outcome.warning_level, 1);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_lines_reported() {
        let service = service();
        assert!(matches!(
            handle_line(&service, "not json").await,
            StreamResponse::Error { .. }
        ));
        assert!(matches!(
            handle_line(&service, r#"{"sessionId":"  "}"#).await,
            StreamResponse::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_response_fields_are_camel_case() {
        let service = service();
        let line = r#"{"sessionId":"s1","action":"end_session"}"#;
        let json = serde_json::to_value(handle_line(&service, line).await).unwrap();
        assert_eq!(json["kind"], "sessionEnded");
        assert_eq!(json["sessionId"], "s1");
        assert!(json.get("session_id").is_none());

        let line = r#"{"sessionId":"s2","message":"hello"}"#;
        let json = serde_json::to_value(handle_line(&service, line).await).unwrap();
        assert_eq!(json["kind"], "check");
        assert_eq!(json["sessionId"], "s2");
    }

    #[test]
    fn test_headers_become_meta() {
        let request: StreamRequest = serde_json::from_str(
            r#"{"sessionId":"s1","headers":{"X-Forwarded-For":"8.8.8.8"}}"#,
        )
        .unwrap();
        assert_eq!(request.client_meta().client_identity(), "8.8.8.8");
    }
}
