//! LeadGuard
//!
//! 对话式线索收集 agent 的滥用防护与敏感信息保护引擎：
//! - `security`: 警告状态机、信任分限流、安全检查流水线、封禁记录
//! - `crypto`: 线索敏感字段的带上下文认证加密
//! - `maintenance`: 限流清理、过期封禁清理、密钥轮换等后台任务

pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod infra;
pub mod logging;
pub mod maintenance;
pub mod middleware;
pub mod model;
pub mod security;
pub mod store;
pub mod stream;

pub use config::GuardConfig;
pub use crypto::FieldCipher;
pub use error::{ErrorCode, ErrorResponse, GuardError, Result};
pub use middleware::SecurityMiddleware;
pub use model::{LeadRecord, SealedLead};
pub use security::{
    ClientMeta, ModerationOutcome, ModerationRequest, PublicDecision, SecurityResult,
    SecurityService,
};
pub use store::{KeyedStore, MemoryStore};
