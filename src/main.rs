use anyhow::{anyhow, Context, Result};
use leadguard::{
    cli::{Cli, Commands},
    config::{self, GuardConfig},
    infra::metrics,
    logging,
    maintenance::{BanPurge, RateLimiterSweep, Scheduler, TrollHistorySweep},
    security::PatternClassifier,
    stream, SecurityService,
};
use std::fs;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // 不需要日志的子命令
    match &cli.command {
        Some(Commands::GenerateConfig { path }) => return generate_config(path),
        Some(Commands::ValidateConfig { path }) => return validate_config(path),
        _ => {}
    }

    // 快速读取 config.toml 的 [logging] 段（不加载完整配置）
    let early_log = config::load_early_logging_config(cli.config_file.as_deref());

    // 合并日志配置（优先级：CLI > 环境变量 > config.toml > 默认值）
    let log_level = cli
        .get_log_level()
        .or_else(|| std::env::var("LEADGUARD_LOG_LEVEL").ok())
        .or(early_log.level)
        .unwrap_or_else(|| "info".to_string());
    let log_format = cli
        .get_log_format()
        .or_else(|| std::env::var("LEADGUARD_LOG_FORMAT").ok())
        .or(early_log.format);
    let log_file = cli
        .log_file
        .clone()
        .or_else(|| std::env::var("LEADGUARD_LOG_FILE").ok())
        .or(early_log.file);

    let _log_guard = logging::init_logging(
        &log_level,
        log_format.as_deref(),
        log_file.as_deref(),
        cli.quiet,
    )?;

    let config = GuardConfig::load(&cli).context("加载配置失败")?;

    if cli.dev {
        tracing::info!("🔧 开发模式已启用");
    }

    match cli.command.clone().unwrap_or(Commands::Check) {
        Commands::ShowConfig => show_config(&config),
        Commands::Encrypt { context, plaintext } => {
            let cipher = config.field_cipher()?;
            println!("{}", cipher.encrypt(&plaintext, &context)?);
            Ok(())
        }
        Commands::Decrypt { context, envelope } => {
            let cipher = config.field_cipher()?;
            println!("{}", cipher.decrypt(&envelope, &context)?);
            Ok(())
        }
        Commands::Check => run_check(config).await,
        Commands::GenerateConfig { .. } | Commands::ValidateConfig { .. } => Ok(()),
    }
}

/// 逐行处理标准输入，直到 EOF 或 Ctrl-C
async fn run_check(config: GuardConfig) -> Result<()> {
    tracing::info!("🚀 LeadGuard starting...");
    tracing::info!("📊 Guard Configuration:");
    tracing::info!("  - Ban Duration: {}s", config.warning.ban_duration_secs);
    tracing::info!(
        "  - Chat Limits: ip={}/{}ms session={}/{}ms suspicious={}/{}ms",
        config.rate_limit.chat_ip.max_requests,
        config.rate_limit.chat_ip.window_ms,
        config.rate_limit.chat_session.max_requests,
        config.rate_limit.chat_session.window_ms,
        config.rate_limit.chat_suspicious.max_requests,
        config.rate_limit.chat_suspicious.window_ms
    );
    tracing::info!("  - Classifier Timeout: {}ms", config.pipeline.classifier_timeout_ms);
    tracing::info!("  - Cleanup Interval: {}s", config.cleanup.interval_secs);

    if config.metrics.enabled {
        let addr = config.metrics_addr()?;
        metrics::init_with_listener(addr).map_err(|e| anyhow!("监控指标启动失败: {}", e))?;
        tracing::info!("📈 监控指标已启动: http://{}/metrics", addr);
    }

    let classifier = Arc::new(PatternClassifier::with_defaults()?);
    let service = SecurityService::new(config.security_config(), classifier)?;

    let mut scheduler = Scheduler::new();
    scheduler.add(
        Arc::new(RateLimiterSweep::new(service.rate_limiter().clone())),
        config.cleanup.interval(),
    )?;
    scheduler.add(
        Arc::new(BanPurge::new(service.ban_store().clone())),
        config.cleanup.interval(),
    )?;
    scheduler.add(
        Arc::new(TrollHistorySweep::new(
            service.troll_check().clone(),
            config.cleanup.retention(),
        )),
        config.cleanup.interval(),
    )?;
    scheduler.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("🛑 收到中断信号");
                None
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let response = stream::handle_line(&service, &line).await;
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    scheduler.shutdown().await;
    tracing::info!("👋 LeadGuard stopped, stats: {:?}", service.stats());
    Ok(())
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    let default_config = r#"# LeadGuard 配置文件
# 此文件由 leadguard generate-config 生成
# 主密钥请通过环境变量 LEADGUARD_MASTER_SECRET 提供（至少 32 字节）

[warning]
ban_duration_secs = 86400

[rate_limit.api]
scope = "api"
window_ms = 60000
max_requests = 100
block_duration_ms = 300000

[rate_limit.chat_ip]
scope = "chat_ip"
window_ms = 60000
max_requests = 30
block_duration_ms = 300000

[rate_limit.chat_session]
scope = "chat_session"
window_ms = 60000
max_requests = 20
block_duration_ms = 300000

[rate_limit.chat_suspicious]
scope = "chat_suspicious"
window_ms = 300000
max_requests = 5
block_duration_ms = 1800000

[cleanup]
interval_secs = 300
retention_secs = 86400
recovery_secs = 3600
recovery_trust_step = 5

[pipeline]
classifier_timeout_ms = 2000

[pipeline.troll]
history_size = 5
repeat_threshold = 2
caps_ratio = 0.7
caps_min_letters = 12
flood_run = 6
gibberish_run = 6
link_threshold = 3
troll_score = 0.6

[encryption]
kdf_salt = "leadguard-master-key"
pbkdf2_iterations = 100000
bucket_ms = 86400000
max_key_uses = 10000
max_key_age_ms = 3600000
rotation_interval_secs = 3600

[logging]
level = "info"
format = "compact"
# file = "./logs/leadguard.log"

[metrics]
enabled = false
listen = "127.0.0.1:9184"
"#;

    fs::write(path, default_config).with_context(|| format!("无法写入配置文件: {}", path))?;

    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config = GuardConfig::from_toml_file(path)
        .with_context(|| format!("配置文件验证失败: {}", path))?;
    config
        .validate()
        .with_context(|| format!("配置文件验证失败: {}", path))?;

    println!("✅ 配置文件有效: {}", path);
    println!("📊 配置摘要:");
    println!("  - Ban Duration: {}s", config.warning.ban_duration_secs);
    println!("  - Chat IP Limit: {}", config.rate_limit.chat_ip.max_requests);
    println!("  - Chat Session Limit: {}", config.rate_limit.chat_session.max_requests);
    println!("  - PBKDF2 Iterations: {}", config.encryption.keys.pbkdf2_iterations);

    Ok(())
}

/// 显示最终配置（合并后的配置，主密钥不输出）
fn show_config(config: &GuardConfig) -> Result<()> {
    println!("📊 最终配置（合并后的配置）:");
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
