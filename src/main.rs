//! Inbox Relay CLI
//!
//! 轮询 Gmail 收件箱和已发送邮件，把新邮件推送到 Discord webhook

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use inbox_relay::app::{self, RunOptions};
use inbox_relay::infra::signal;
use inbox_relay::notification::RateLimitPolicy;
use inbox_relay::RelayConfig;

#[derive(Parser)]
#[command(name = "inbox-relay")]
#[command(about = "Inbox Relay - 把新邮件转发到 Discord webhook")]
#[command(version)]
struct Cli {
    /// 配置文件路径（默认 <data-dir>/config.json）
    #[arg(long, short, env = "INBOX_RELAY_CONFIG")]
    config: Option<PathBuf>,
    /// 数据目录（checkpoint、错误队列、实例锁）
    #[arg(long, env = "INBOX_RELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// 主 webhook
    #[arg(long, env = "DISCORD_WEBHOOK_URL", hide_env_values = true)]
    webhook_url: Option<String>,
    /// 错误告警 webhook（默认与主 webhook 相同）
    #[arg(long, env = "DISCORD_MONITOR_WEBHOOK_URL", hide_env_values = true)]
    monitor_webhook_url: Option<String>,
    /// OAuth token.json 路径
    #[arg(long, env = "GMAIL_TOKEN_PATH")]
    token_path: Option<PathBuf>,
    /// 每页列出的消息数
    #[arg(long, env = "MAX_MESSAGES")]
    max_messages: Option<u32>,
    /// 轮询间隔（秒）
    #[arg(long, short = 'i', env = "CHECK_INTERVAL")]
    check_interval: Option<u64>,
    /// webhook 请求超时（秒）
    #[arg(long, env = "WEBHOOK_TIMEOUT")]
    webhook_timeout: Option<u64>,
    /// 单次投递最多尝试次数
    #[arg(long, env = "RETRY_ATTEMPTS")]
    retry_attempts: Option<u32>,
    /// 每个流每轮最多投递条数
    #[arg(long, env = "BATCH_SIZE")]
    batch_size: Option<usize>,
    /// 429 时的处理方式
    #[arg(long, value_enum)]
    on_rate_limit: Option<RateLimitPolicy>,
    /// 同时追加写入的日志文件
    #[arg(long, env = "INBOX_RELAY_LOG_FILE")]
    log_file: Option<PathBuf>,
    /// 只运行一轮后退出
    #[arg(long)]
    once: bool,
}

impl Cli {
    /// 加载配置文件并应用命令行覆盖
    fn into_config(self) -> Result<(RelayConfig, RunOptions)> {
        let mut config = RelayConfig::discover(self.config.as_deref(), self.data_dir.as_deref())?;

        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(url) = self.webhook_url {
            config.webhook_url = Some(url);
        }
        if let Some(url) = self.monitor_webhook_url {
            config.monitor_webhook_url = Some(url);
        }
        if let Some(path) = self.token_path {
            config.token_path = Some(path);
        }
        if let Some(v) = self.max_messages {
            config.max_messages = v;
        }
        if let Some(v) = self.check_interval {
            config.check_interval_secs = v;
        }
        if let Some(v) = self.webhook_timeout {
            config.webhook_timeout_secs = v;
        }
        if let Some(v) = self.retry_attempts {
            config.retry_attempts = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(policy) = self.on_rate_limit {
            config.on_rate_limit = policy;
        }
        if let Some(path) = self.log_file {
            config.log_file = Some(path);
        }

        Ok((config, RunOptions { once: self.once }))
    }
}

/// stderr 始终输出；配置了日志文件时再追加一份（无颜色）
///
/// 日志文件打不开时仍完成 stderr 初始化，并返回错误供调用方记录。
fn init_tracing(log_path: Option<&Path>) -> Result<()> {
    // 通过 RUST_LOG 控制日志级别，默认为 info
    // 例如: RUST_LOG=inbox_relay=debug inbox-relay --once
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("inbox_relay=info"));

    let (file, file_error) = match log_path.map(open_log_file).transpose() {
        Ok(file) => (file, None),
        Err(e) => (None, Some(e)),
    };
    let file_layer = file.map(|file| {
        fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false),
        )
        .with(file_layer)
        .init();

    match file_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let loaded = Cli::parse().into_config();
    let log_path = loaded.as_ref().ok().and_then(|(config, _)| config.log_path());

    if let Err(e) = init_tracing(log_path.as_deref()) {
        warn!(error = %format!("{:#}", e), "Log file unavailable, logging to stderr only");
    }

    let result = match loaded {
        Ok((config, options)) => run(config, options).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Fatal error, exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: RelayConfig, options: RunOptions) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let listener = signal::spawn_listener(shutdown.clone());

    let worker_flag = shutdown.clone();
    let result = tokio::task::spawn_blocking(move || app::run(config, options, worker_flag))
        .await
        .context("Relay worker panicked")?;

    listener.abort();
    result?;
    info!("Goodbye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_rate_limit_flag_parses_policy() {
        let cli = Cli::try_parse_from(["inbox-relay", "--on-rate-limit", "queue"]).unwrap();
        assert_eq!(cli.on_rate_limit, Some(RateLimitPolicy::Queue));

        assert!(Cli::try_parse_from(["inbox-relay", "--on-rate-limit", "drop"]).is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"on_rate_limit": "queue", "batch_size": 5}"#).unwrap();

        let cli = Cli::try_parse_from([
            "inbox-relay",
            "--data-dir",
            data_dir,
            "--on-rate-limit",
            "retry",
            "--log-file",
            "relay.log",
            "--once",
        ])
        .unwrap();
        let (config, options) = cli.into_config().unwrap();

        assert_eq!(config.on_rate_limit, RateLimitPolicy::Retry);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.log_path(), Some(dir.path().join("relay.log")));
        assert!(options.once);
    }

    #[test]
    fn test_log_file_is_created_and_appended() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("relay.log");

        use std::io::Write;
        writeln!(open_log_file(&path).unwrap(), "first").unwrap();
        writeln!(open_log_file(&path).unwrap(), "second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
