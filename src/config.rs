//! 运行配置
//!
//! 来源优先级（高 → 低）：命令行参数 / 环境变量 → 配置文件 → 默认值。
//! 配置文件默认位置 `~/.config/inbox-relay/config.json`，不存在时全部使用默认值。

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::infra::json_file::read_json;
use crate::notification::delivery::{DeliverySettings, RateLimitPolicy};
use crate::notification::normalizer::DEFAULT_HIDDEN_PATTERNS;
use crate::notification::style::Identity;
use crate::scheduler::SchedulerSettings;
use crate::source::gmail::{GmailConfig, DEFAULT_API_BASE};
use crate::source::Stream;

pub const CONFIG_FILE: &str = "config.json";
pub const CHECKPOINT_FILE: &str = "checkpoints.json";
pub const QUEUE_FILE: &str = "error_queue.json";
pub const LOCK_FILE: &str = "relay.lock";
pub const TOKEN_FILE: &str = "token.json";

/// 默认数据目录
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".config/inbox-relay"))
        .unwrap_or_else(|| PathBuf::from(".inbox-relay"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// 每页列出的消息数
    pub max_messages: u32,
    pub check_interval_secs: u64,
    pub webhook_timeout_secs: u64,
    pub retry_attempts: u32,
    /// 每个流每轮最多投递的条数
    pub batch_size: usize,
    pub webhook_url: Option<String>,
    pub monitor_webhook_url: Option<String>,
    pub data_dir: PathBuf,
    /// 未设置时为 `<data_dir>/token.json`
    pub token_path: Option<PathBuf>,
    pub flush_interval_secs: u64,
    pub on_rate_limit: RateLimitPolicy,
    pub max_pages: u32,
    pub lock_timeout_ms: u64,
    pub min_request_interval_ms: u64,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub incoming_query: String,
    pub outgoing_query: String,
    pub hidden_recipient_patterns: Vec<String>,
    pub gmail_api_base: String,
    /// 额外追加写入的日志文件，相对路径基于 `data_dir`
    pub log_file: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            check_interval_secs: 60,
            webhook_timeout_secs: 10,
            retry_attempts: 3,
            batch_size: 25,
            webhook_url: None,
            monitor_webhook_url: None,
            data_dir: default_data_dir(),
            token_path: None,
            flush_interval_secs: 3600,
            on_rate_limit: RateLimitPolicy::Retry,
            max_pages: 10,
            lock_timeout_ms: 1000,
            min_request_interval_ms: 1000,
            username: None,
            avatar_url: None,
            incoming_query: "in:inbox".to_string(),
            outgoing_query: "in:sent".to_string(),
            hidden_recipient_patterns: DEFAULT_HIDDEN_PATTERNS.iter().map(|p| p.to_string()).collect(),
            gmail_api_base: DEFAULT_API_BASE.to_string(),
            log_file: None,
        }
    }
}

impl RelayConfig {
    /// 从指定文件加载，文件必须存在
    pub fn load(path: &Path) -> Result<Self> {
        read_json::<Self>(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?
            .with_context(|| format!("Config file {} is missing or empty", path.display()))
    }

    /// 显式路径优先；否则读取数据目录下的 config.json（不存在则用默认值）
    pub fn discover(explicit: Option<&Path>, data_dir: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let dir = data_dir.map(Path::to_path_buf).unwrap_or_else(default_data_dir);
        let candidate = dir.join(CONFIG_FILE);
        let mut config = match read_json::<Self>(&candidate)
            .with_context(|| format!("Failed to load config from {}", candidate.display()))?
        {
            Some(config) => config,
            None => Self::default(),
        };
        if data_dir.is_some() {
            config.data_dir = dir;
        }
        Ok(config)
    }

    /// 启动前校验，失败即为致命错误
    pub fn validate(&self) -> Result<()> {
        match self.webhook_url.as_deref() {
            None | Some("") => bail!("webhook_url is required (set DISCORD_WEBHOOK_URL or --webhook-url)"),
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                bail!("webhook_url must be an http(s) URL, got '{}'", url)
            }
            _ => {}
        }

        let positive = [
            ("max_messages", self.max_messages as u64),
            ("check_interval_secs", self.check_interval_secs),
            ("webhook_timeout_secs", self.webhook_timeout_secs),
            ("retry_attempts", self.retry_attempts as u64),
            ("batch_size", self.batch_size as u64),
            ("flush_interval_secs", self.flush_interval_secs),
            ("max_pages", self.max_pages as u64),
            ("lock_timeout_ms", self.lock_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        Ok(())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(CHECKPOINT_FILE)
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join(QUEUE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }

    pub fn token_path(&self) -> PathBuf {
        self.token_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(TOKEN_FILE))
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_file.as_ref().map(|file| self.data_dir.join(file))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    /// 调用前须已通过 `validate`
    pub fn delivery_settings(&self) -> DeliverySettings {
        let mut settings = DeliverySettings::new(self.webhook_url.clone().unwrap_or_default());
        settings.monitor_webhook_url = self.monitor_webhook_url.clone().filter(|u| !u.is_empty());
        settings.max_attempts = self.retry_attempts;
        settings.on_rate_limit = self.on_rate_limit;
        settings.min_interval = Duration::from_millis(self.min_request_interval_ms);
        settings.identity = Identity {
            username: self.username.clone(),
            avatar_url: self.avatar_url.clone(),
        };
        settings
    }

    pub fn gmail_config(&self) -> GmailConfig {
        GmailConfig {
            api_base: self.gmail_api_base.clone(),
            incoming_query: self.incoming_query.clone(),
            outgoing_query: self.outgoing_query.clone(),
            timeout_secs: self.webhook_timeout_secs.max(30),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: Duration::from_secs(self.check_interval_secs),
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            batch_size: self.batch_size,
            streams: Stream::ALL.to_vec(),
        }
    }
}
