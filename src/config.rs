use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::crypto::key_manager::{KeyConfig, MIN_SECRET_LEN};
#[cfg(test)]
use crate::crypto::key_manager::MIN_PBKDF2_ITERATIONS;
use crate::crypto::FieldCipher;
use crate::error::GuardError;
use crate::security::checks::TrollConfig;
use crate::security::{
    ChatRateLimits, RateLimitConfig, RetentionConfig, SecurityConfig, WarningConfig,
};

/// 引擎配置
///
/// 加载优先级：命令行 > 环境变量（LEADGUARD_*，含 .env）> 配置文件 > 默认值
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// 警告状态机
    pub warning: WarningConfig,
    /// 限流
    pub rate_limit: RateLimitSection,
    /// 周期清理
    pub cleanup: CleanupConfig,
    /// 检查流水线
    pub pipeline: PipelineConfig,
    /// 字段加密
    pub encryption: EncryptionConfig,
    /// 日志
    pub logging: LoggingConfig,
    /// 监控指标
    pub metrics: MetricsConfig,
}

/// 各作用域的限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub api: RateLimitConfig,
    pub chat_ip: RateLimitConfig,
    pub chat_session: RateLimitConfig,
    pub chat_suspicious: RateLimitConfig,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            api: RateLimitConfig::api(),
            chat_ip: RateLimitConfig::chat_ip(),
            chat_session: RateLimitConfig::chat_session(),
            chat_suspicious: RateLimitConfig::chat_suspicious(),
        }
    }
}

/// 周期清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// 清理间隔（秒）
    pub interval_secs: u64,
    /// 闲置多久删除身份记录（秒）
    pub retention_secs: u64,
    /// 闲置多久开始恢复信任（秒）
    pub recovery_secs: u64,
    /// 每次清理恢复的信任分
    pub recovery_trust_step: i32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            retention_secs: 24 * 60 * 60,
            recovery_secs: 60 * 60,
            recovery_trust_step: 5,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// 流水线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 内容分类器超时（毫秒）
    pub classifier_timeout_ms: u64,
    /// 捣乱检测
    pub troll: TrollConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classifier_timeout_ms: 2_000,
            troll: TrollConfig::default(),
        }
    }
}

/// 字段加密配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// 主密钥原始材料（建议通过 LEADGUARD_MASTER_SECRET 提供，永不输出）
    #[serde(skip_serializing)]
    pub master_secret: Option<String>,
    #[serde(flatten)]
    pub keys: KeyConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// compact / pretty / json
    pub format: Option<String>,
    /// 日志文件（按天滚动）
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
            file: None,
        }
    }
}

/// 监控指标配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Prometheus 抓取端点监听地址
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:9184".to_string(),
        }
    }
}

/// 启动早期只需要的日志配置（在完整配置加载前初始化日志）
#[derive(Debug, Default, Deserialize)]
pub struct EarlyLoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EarlyConfigFile {
    #[serde(default)]
    logging: EarlyLoggingConfig,
}

/// 快速读取配置文件的 [logging] 段；文件缺失或格式错误时返回空配置
pub fn load_early_logging_config(config_file: Option<&str>) -> EarlyLoggingConfig {
    let path = config_file.unwrap_or("config.toml");
    fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<EarlyConfigFile>(&content).ok())
        .map(|file| file.logging)
        .unwrap_or_default()
}

impl GuardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content).with_context(|| "配置文件格式错误")
    }

    pub fn from_toml_str(content: &str) -> crate::error::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// 从环境变量加载配置（LEADGUARD_ 前缀）
    pub fn merge_from_env(&mut self) {
        if let Ok(secret) = env::var("LEADGUARD_MASTER_SECRET") {
            self.encryption.master_secret = Some(secret);
        }
        if let Ok(iterations) = env::var("LEADGUARD_PBKDF2_ITERATIONS") {
            self.encryption.keys.pbkdf2_iterations = iterations
                .parse()
                .unwrap_or(self.encryption.keys.pbkdf2_iterations);
        }
        if let Ok(secs) = env::var("LEADGUARD_BAN_DURATION_SECS") {
            self.warning.ban_duration_secs = secs.parse().unwrap_or(self.warning.ban_duration_secs);
        }
        if let Ok(ms) = env::var("LEADGUARD_CLASSIFIER_TIMEOUT_MS") {
            self.pipeline.classifier_timeout_ms =
                ms.parse().unwrap_or(self.pipeline.classifier_timeout_ms);
        }
        if let Ok(secs) = env::var("LEADGUARD_CLEANUP_INTERVAL_SECS") {
            self.cleanup.interval_secs = secs.parse().unwrap_or(self.cleanup.interval_secs);
        }
        if let Ok(level) = env::var("LEADGUARD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("LEADGUARD_LOG_FORMAT") {
            self.logging.format = Some(format);
        }
        if let Ok(file) = env::var("LEADGUARD_LOG_FILE") {
            self.logging.file = Some(file);
        }
        if let Ok(listen) = env::var("LEADGUARD_METRICS_LISTEN") {
            self.metrics.listen = listen;
        }
    }

    /// 从命令行参数合并配置
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(level) = cli.get_log_level() {
            self.logging.level = level;
        }
        if let Some(format) = cli.get_log_format() {
            self.logging.format = Some(format);
        }
        if let Some(file) = &cli.log_file {
            self.logging.file = Some(file.clone());
        }
        if cli.enable_metrics {
            self.metrics.enabled = true;
        }
        if let Some(listen) = &cli.metrics_listen {
            self.metrics.listen = listen.clone();
        }
        if let Some(secs) = cli.cleanup_interval {
            self.cleanup.interval_secs = secs;
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if let Some(config_file) = &cli.config_file {
            if Path::new(config_file).exists() {
                info!("📄 从配置文件加载: {}", config_file);
                Self::from_toml_file(config_file)?
            } else {
                tracing::warn!("⚠️ 配置文件不存在: {}", config_file);
                Self::new()
            }
        } else if Path::new("config.toml").exists() {
            info!("📄 从默认配置文件加载: config.toml");
            Self::from_toml_file("config.toml")?
        } else {
            Self::new()
        };

        config.merge_from_env();
        config.merge_from_cli(cli);
        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    /// 校验阈值；任何错误在启动时都是致命的
    pub fn validate(&self) -> crate::error::Result<()> {
        fn invalid(msg: String) -> GuardError {
            GuardError::Configuration(msg)
        }

        if self.warning.ban_duration_secs == 0 {
            return Err(invalid("warning.ban_duration_secs must be positive".into()));
        }

        for (name, limit) in [
            ("api", &self.rate_limit.api),
            ("chat_ip", &self.rate_limit.chat_ip),
            ("chat_session", &self.rate_limit.chat_session),
            ("chat_suspicious", &self.rate_limit.chat_suspicious),
        ] {
            if limit.scope.is_empty() {
                return Err(invalid(format!("rate_limit.{}.scope must not be empty", name)));
            }
            if limit.window_ms == 0 || limit.max_requests == 0 || limit.block_duration_ms == 0 {
                return Err(invalid(format!(
                    "rate_limit.{}: window_ms, max_requests and block_duration_ms must be positive",
                    name
                )));
            }
        }
        // scope 是限流记录的 key 前缀，不能重复
        let scopes = [
            &self.rate_limit.api.scope,
            &self.rate_limit.chat_ip.scope,
            &self.rate_limit.chat_session.scope,
            &self.rate_limit.chat_suspicious.scope,
        ];
        for (i, scope) in scopes.iter().enumerate() {
            if scopes[i + 1..].contains(scope) {
                return Err(invalid(format!(
                    "rate limit scope {:?} is used by more than one limit",
                    scope
                )));
            }
        }

        if self.cleanup.interval_secs == 0 {
            return Err(invalid("cleanup.interval_secs must be positive".into()));
        }
        if self.cleanup.recovery_secs > self.cleanup.retention_secs {
            return Err(invalid(
                "cleanup.recovery_secs must not exceed cleanup.retention_secs".into(),
            ));
        }
        if self.cleanup.recovery_trust_step < 0 {
            return Err(invalid("cleanup.recovery_trust_step must not be negative".into()));
        }

        if self.pipeline.classifier_timeout_ms == 0 {
            return Err(invalid("pipeline.classifier_timeout_ms must be positive".into()));
        }
        let troll = &self.pipeline.troll;
        if troll.history_size == 0 || troll.flood_run < 2 || troll.gibberish_run < 2 {
            return Err(invalid(
                "pipeline.troll: history_size must be positive, runs must be at least 2".into(),
            ));
        }
        if !(0.0..=1.0).contains(&troll.caps_ratio) || !(0.0..=1.0).contains(&troll.troll_score) {
            return Err(invalid(
                "pipeline.troll: caps_ratio and troll_score must be within [0, 1]".into(),
            ));
        }

        self.encryption.keys.validate()?;
        if let Some(secret) = &self.encryption.master_secret {
            if secret.len() < MIN_SECRET_LEN {
                return Err(invalid(format!(
                    "encryption master secret must be at least {} bytes",
                    MIN_SECRET_LEN
                )));
            }
        }

        if let Some(format) = &self.logging.format {
            if !matches!(format.as_str(), "compact" | "pretty" | "dev" | "json") {
                return Err(invalid(format!("logging.format '{}' is not supported", format)));
            }
        }

        if self.metrics.enabled {
            self.metrics_addr()?;
        }
        Ok(())
    }

    /// 安全服务配置
    pub fn security_config(&self) -> SecurityConfig {
        SecurityConfig {
            warning: self.warning.clone(),
            api_limit: self.rate_limit.api.clone(),
            chat_limits: ChatRateLimits {
                per_address: self.rate_limit.chat_ip.clone(),
                per_session: self.rate_limit.chat_session.clone(),
                suspicious: self.rate_limit.chat_suspicious.clone(),
            },
            retention: RetentionConfig {
                retention_ms: self.cleanup.retention_secs * 1000,
                recovery_ms: self.cleanup.recovery_secs * 1000,
                recovery_trust_step: self.cleanup.recovery_trust_step,
            },
            troll: self.pipeline.troll.clone(),
            classifier_timeout: Duration::from_millis(self.pipeline.classifier_timeout_ms),
        }
    }

    /// 构造字段加密器；未配置主密钥时返回配置错误
    pub fn field_cipher(&self) -> crate::error::Result<FieldCipher> {
        let secret = self.encryption.master_secret.as_deref().ok_or_else(|| {
            GuardError::Configuration(
                "master secret missing: set LEADGUARD_MASTER_SECRET".to_string(),
            )
        })?;
        FieldCipher::new(secret, self.encryption.keys.clone())
    }

    pub fn metrics_addr(&self) -> crate::error::Result<SocketAddr> {
        self.metrics.listen.parse().map_err(|_| {
            GuardError::Configuration(format!(
                "metrics.listen '{}' is not a socket address",
                self.metrics.listen
            ))
        })
    }
}
