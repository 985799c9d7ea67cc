use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 引擎错误类型
///
/// 对外只暴露少量、无内部细节的结果（见 `PublicDecision`），
/// 这里的错误用于宿主程序与审计日志。
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum GuardError {
    /// 配置错误（启动时致命）
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 身份校验失败（疑似伪造来源地址）
    #[error("Identity validation failed: {0}")]
    IdentityValidation(String),

    /// 安全检查执行失败（会被转换为封禁结果）
    #[error("Security check '{check}' failed: {reason}")]
    CheckFailure { check: String, reason: String },

    /// 加解密失败（不携带任何密钥或明文）
    #[error("Crypto operation failed: {0}")]
    Crypto(CryptoFailure),

    /// 超时
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(String),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

/// 加解密失败的阶段
///
/// 只记录阶段，不记录原因细节，避免泄露密文结构之外的信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CryptoFailure {
    /// 主密钥或操作密钥派生失败
    KeyDerivation,
    /// 加密失败
    Encrypt,
    /// 解密或认证标签校验失败
    Decrypt,
    /// 信封格式无法解析
    MalformedEnvelope,
}

impl std::fmt::Display for CryptoFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self {
            CryptoFailure::KeyDerivation => "key derivation",
            CryptoFailure::Encrypt => "encrypt",
            CryptoFailure::Decrypt => "decrypt",
            CryptoFailure::MalformedEnvelope => "malformed envelope",
        };
        f.write_str(stage)
    }
}

impl GuardError {
    pub fn check_failure(check: impl Into<String>, reason: impl Into<String>) -> Self {
        GuardError::CheckFailure {
            check: check.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for GuardError {
    fn from(err: std::io::Error) -> Self {
        GuardError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        GuardError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GuardError {
    fn from(err: toml::de::Error) -> Self {
        GuardError::Configuration(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GuardError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        GuardError::Timeout(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, GuardError>;

/// 错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// 成功
    Success = 0,
    /// 配置错误
    Configuration = 1000,
    /// 身份校验失败
    IdentityValidation = 2000,
    /// 安全检查失败
    CheckFailure = 2001,
    /// 加解密失败
    Crypto = 3000,
    /// 超时
    Timeout = 4000,
    /// IO 错误
    Io = 5000,
    /// 序列化错误
    Serialization = 5001,
    /// 内部错误
    Internal = 9999,
}

impl From<&GuardError> for ErrorCode {
    fn from(error: &GuardError) -> Self {
        match error {
            GuardError::Configuration(_) => ErrorCode::Configuration,
            GuardError::IdentityValidation(_) => ErrorCode::IdentityValidation,
            GuardError::CheckFailure { .. } => ErrorCode::CheckFailure,
            GuardError::Crypto(_) => ErrorCode::Crypto,
            GuardError::Timeout(_) => ErrorCode::Timeout,
            GuardError::Io(_) => ErrorCode::Io,
            GuardError::Serialization(_) => ErrorCode::Serialization,
            GuardError::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// 错误响应（供宿主程序返回给上游）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// 错误代码
    pub code: ErrorCode,
    /// 错误消息
    pub message: String,
    /// 时间戳
    pub timestamp: i64,
}

impl ErrorResponse {
    /// 创建错误响应
    ///
    /// 身份校验、检查失败一律折叠为通用消息，不暴露内部判定依据
    pub fn new(error: &GuardError) -> Self {
        let message = match error {
            GuardError::IdentityValidation(_) | GuardError::CheckFailure { .. } => {
                "Request denied".to_string()
            }
            GuardError::Crypto(_) => "Crypto operation failed".to_string(),
            other => other.to_string(),
        };
        Self {
            code: ErrorCode::from(error),
            message,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = GuardError::check_failure("ban_check", "store unavailable");
        assert_eq!(ErrorCode::from(&err), ErrorCode::CheckFailure);
        assert_eq!(
            ErrorCode::from(&GuardError::Crypto(CryptoFailure::Decrypt)),
            ErrorCode::Crypto
        );
    }

    #[test]
    fn test_error_response_hides_internal_reason() {
        let err = GuardError::IdentityValidation("10.0.0.1 via x-forwarded-for".into());
        let resp = ErrorResponse::new(&err);
        assert_eq!(resp.message, "Request denied");
        assert!(!resp.message.contains("10.0.0.1"));
    }
}
