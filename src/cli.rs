use clap::{Parser, Subcommand};

impl Cli {
    /// 解析命令行参数
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// LeadGuard - 线索收集对话的滥用防护与敏感信息加密引擎
#[derive(Parser, Debug, Default)]
#[command(name = "leadguard")]
#[command(version)]
#[command(about = "会话警告状态机、信任分限流、安全检查流水线与字段加密", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(long, value_name = "FILE", help = "指定配置文件路径")]
    pub config_file: Option<String>,

    /// 日志级别
    #[arg(
        long,
        value_name = "LEVEL",
        help = "日志级别: trace, debug, info, warn, error"
    )]
    pub log_level: Option<String>,

    /// 日志格式
    #[arg(long, value_name = "FORMAT", help = "日志格式: pretty, json, compact")]
    pub log_format: Option<String>,

    /// 日志文件路径
    #[arg(long, value_name = "PATH", help = "日志输出文件路径（按天滚动）")]
    pub log_file: Option<String>,

    /// 启用监控指标
    #[arg(long, help = "启用 Prometheus 监控指标")]
    pub enable_metrics: bool,

    /// 监控地址
    #[arg(long, value_name = "ADDR", help = "监控指标监听地址，例如 127.0.0.1:9184")]
    pub metrics_listen: Option<String>,

    /// 清理间隔
    #[arg(long, value_name = "SECS", help = "限流记录与过期封禁的清理间隔（秒）")]
    pub cleanup_interval: Option<u64>,

    /// 详细输出（可重复使用：-v, -vv, -vvv）
    #[arg(short, action = clap::ArgAction::Count, help = "详细输出级别")]
    pub verbose: u8,

    /// 静默模式
    #[arg(long, short = 'q', help = "静默模式（只输出错误日志）")]
    pub quiet: bool,

    /// 开发模式（等同于 --log-level debug --log-format pretty）
    #[arg(long, help = "启用开发模式")]
    pub dev: bool,

    /// 子命令（缺省为 check）
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// 生成默认配置文件
    GenerateConfig {
        /// 输出文件路径
        #[arg(value_name = "PATH", default_value = "config.toml")]
        path: String,
    },
    /// 验证配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(value_name = "PATH", default_value = "config.toml")]
        path: String,
    },
    /// 显示最终配置（合并后的配置，不含主密钥）
    ShowConfig,
    /// 从标准输入逐行读取 JSON 请求并输出判定
    ///
    /// 消息检查：{"sessionId","message","peerAddr","headers"}
    /// 处置请求：{"sessionId","action":"warn|ban","level","reason"}
    Check,
    /// 加密一个字段
    Encrypt {
        /// 加密上下文，例如 lead.contact
        #[arg(long, value_name = "CONTEXT")]
        context: String,
        /// 明文
        #[arg(value_name = "PLAINTEXT")]
        plaintext: String,
    },
    /// 解密一个字段信封（同时支持旧格式）
    Decrypt {
        #[arg(long, value_name = "CONTEXT")]
        context: String,
        #[arg(value_name = "ENVELOPE")]
        envelope: String,
    },
}

impl Cli {
    /// 获取日志级别（考虑 verbose 和 quiet）
    pub fn get_log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }

        if self.dev {
            return Some("debug".to_string());
        }

        if let Some(level) = &self.log_level {
            return Some(level.clone());
        }

        match self.verbose {
            0 => None,
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// 获取日志格式
    pub fn get_log_format(&self) -> Option<String> {
        if self.dev {
            return Some("pretty".to_string());
        }
        self.log_format.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_encrypt() {
        let cli = <Cli as Parser>::try_parse_from([
            "leadguard",
            "-vv",
            "encrypt",
            "--context",
            "lead.contact",
            "ada@example.com",
        ])
        .unwrap();
        assert_eq!(cli.get_log_level().as_deref(), Some("debug"));
        assert_eq!(
            cli.command,
            Some(Commands::Encrypt {
                context: "lead.contact".into(),
                plaintext: "ada@example.com".into(),
            })
        );
    }

    #[test]
    fn test_quiet_wins() {
        let cli = <Cli as Parser>::try_parse_from(["leadguard", "--dev", "-q"]).unwrap();
        assert_eq!(cli.get_log_level().as_deref(), Some("error"));
        assert_eq!(cli.get_log_format().as_deref(), Some("pretty"));
        assert!(cli.command.is_none());
    }
}
