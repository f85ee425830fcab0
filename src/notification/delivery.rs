//! Webhook 投递客户端 - 本地限流 + 服务端限流 + 有限重试
//!
//! ## 限流
//! 1. 上次 429 的 retry-after 未到期：等待
//! 2. 服务端报告剩余配额为 0 且重置窗口未结束：等待
//! 3. 相邻请求最小间隔（默认 1 秒）
//! 4. 滑动窗口：60 秒内最多 25 次（Discord 上限约 30 次/分钟）
//!
//! ## 重试
//! - 429：按服务端给出的 retry-after 等待后重试，或直接返回 `RateLimited` 交给外部入队
//! - 5xx / 超时 / 连接失败：指数退避重试，最多 `max_attempts` 次
//! - 其他 4xx：立即返回 `Rejected`

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::record::NotificationRecord;
use super::reporter::ErrorReport;
use super::style::{render_error, render_notification, Identity, WebhookPayload};
use crate::infra::clock::Clock;

/// 指数退避上限
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 服务端给出的等待时间上限，更大的值按此截断
pub const MAX_SERVER_WAIT: Duration = Duration::from_secs(3600);

/// 429 时如何处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPolicy {
    /// 等待 retry-after 后在同一次调用内重试
    #[default]
    Retry,
    /// 直接返回失败，由调用方入队
    Queue,
}

/// Webhook 响应中与投递相关的部分
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkResponse {
    pub status: u16,
    /// `X-RateLimit-Remaining`
    pub remaining: Option<u32>,
    /// `X-RateLimit-Reset-After`
    pub reset_after: Option<Duration>,
    /// 429 时的 `Retry-After` 头或 body 中的 `retry_after`
    pub retry_after: Option<Duration>,
}

impl SinkResponse {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 从状态码、响应头和响应体解析
    ///
    /// 429 时 `Retry-After` 头优先，缺失时读 body 的 `retry_after`；
    /// 无法解析的值当作未给出。
    pub fn from_parts(status: u16, headers: &HeaderMap, body: &str) -> Self {
        let mut parsed = Self {
            status,
            remaining: headers
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok()),
            reset_after: header_secs(headers, "x-ratelimit-reset-after"),
            retry_after: header_secs(headers, "retry-after"),
        };

        if status == 429 && parsed.retry_after.is_none() {
            parsed.retry_after = serde_json::from_str::<RateLimitBody>(body)
                .ok()
                .and_then(|b| secs_to_duration(b.retry_after));
        }
        parsed
    }
}

fn header_secs(headers: &HeaderMap, name: &str) -> Option<Duration> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(secs_to_duration)
}

/// 负数和 NaN 视为无效；超出范围的值截断到 `MAX_SERVER_WAIT`
fn secs_to_duration(secs: f64) -> Option<Duration> {
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    Some(
        Duration::try_from_secs_f64(secs)
            .map_or(MAX_SERVER_WAIT, |d| d.min(MAX_SERVER_WAIT)),
    )
}

/// `now + wait`，溢出时退回 `now + MAX_SERVER_WAIT`
fn deadline(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait)
        .or_else(|| now.checked_add(MAX_SERVER_WAIT))
        .unwrap_or(now)
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

/// 发送 webhook 请求
pub trait WebhookTransport: Send + Sync {
    fn post(&self, url: &str, payload: &WebhookPayload) -> Result<SinkResponse, TransportError>;
}

/// 429 响应体
#[derive(Debug, Deserialize)]
struct RateLimitBody {
    /// 秒（可为小数）
    retry_after: f64,
}

/// reqwest 实现
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl WebhookTransport for HttpTransport {
    fn post(&self, url: &str, payload: &WebhookPayload) -> Result<SinkResponse, TransportError> {
        let response = self.client.post(url).json(payload).send().map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(e.to_string())
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        // 读 body 失败时退回默认等待
        let body = if status == 429 {
            response.text().unwrap_or_default()
        } else {
            String::new()
        };

        Ok(SinkResponse::from_parts(status, &headers, &body))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("rate limited by sink, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },
    #[error("sink rejected payload with HTTP {status}")]
    Rejected { status: u16 },
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// 投递配置
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub webhook_url: String,
    /// 错误告警 webhook，未配置时使用 `webhook_url`
    pub monitor_webhook_url: Option<String>,
    pub max_attempts: u32,
    pub on_rate_limit: RateLimitPolicy,
    pub min_interval: Duration,
    pub window_limit: u32,
    pub window: Duration,
    /// 首次重试前的退避，之后翻倍
    pub retry_backoff: Duration,
    /// 429 未给出 retry-after 时的等待
    pub default_retry_after: Duration,
    pub identity: Identity,
}

impl DeliverySettings {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            monitor_webhook_url: None,
            max_attempts: 3,
            on_rate_limit: RateLimitPolicy::Retry,
            min_interval: Duration::from_secs(1),
            window_limit: 25,
            window: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(2),
            default_retry_after: Duration::from_secs(5),
            identity: Identity::default(),
        }
    }
}

/// 进程级限流状态，仅由 webhook 响应和本地请求推导，不持久化
#[derive(Debug, Clone, Default)]
pub struct RateLimitState {
    pub remaining: Option<u32>,
    /// 服务端配额重置时刻
    pub reset_at: Option<Instant>,
    /// 429 要求的最早下次请求时刻
    pub retry_at: Option<Instant>,
    pub last_request_at: Option<Instant>,
    recent: VecDeque<Instant>,
}

impl RateLimitState {
    /// 在 `now` 发请求之前需要等待多久
    fn wait_needed(&mut self, now: Instant, settings: &DeliverySettings) -> Duration {
        let mut wait = Duration::ZERO;
        let mut wait_until = |until: Instant| {
            wait = wait.max(until.saturating_duration_since(now));
        };

        if let Some(retry_at) = self.retry_at {
            wait_until(retry_at);
        }
        if self.remaining == Some(0) {
            if let Some(reset_at) = self.reset_at {
                wait_until(reset_at);
            }
        }
        if let Some(last) = self.last_request_at {
            wait_until(last + settings.min_interval);
        }

        while self
            .recent
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= settings.window)
        {
            self.recent.pop_front();
        }
        if settings.window_limit > 0 && self.recent.len() >= settings.window_limit as usize {
            if let Some(oldest) = self.recent.front() {
                wait_until(*oldest + settings.window);
            }
        }

        wait
    }

    fn record_request(&mut self, at: Instant) {
        self.last_request_at = Some(at);
        self.recent.push_back(at);
    }

    fn observe(&mut self, response: &SinkResponse, now: Instant) {
        if let Some(remaining) = response.remaining {
            self.remaining = Some(remaining);
        }
        if let Some(reset_after) = response.reset_after {
            self.reset_at = Some(deadline(now, reset_after));
        }
    }
}

/// Webhook 投递客户端
pub struct DeliveryClient {
    transport: Box<dyn WebhookTransport>,
    clock: Arc<dyn Clock>,
    settings: DeliverySettings,
    state: Mutex<RateLimitState>,
}

impl DeliveryClient {
    pub fn new(
        transport: Box<dyn WebhookTransport>,
        clock: Arc<dyn Clock>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            transport,
            clock,
            settings,
            state: Mutex::new(RateLimitState::default()),
        }
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    /// 当前限流状态快照
    pub fn rate_limit_state(&self) -> RateLimitState {
        self.lock_state().clone()
    }

    /// 投递邮件通知
    pub fn deliver(&self, record: &NotificationRecord) -> Result<(), DeliveryError> {
        let payload = render_notification(record, &self.settings.identity);
        self.post(&self.settings.webhook_url, &payload)?;
        info!(
            direction = %record.direction,
            message_id = %record.source_message_id,
            "Notification delivered"
        );
        Ok(())
    }

    /// 发送错误告警到监控 webhook
    pub fn send_report(&self, report: &ErrorReport) -> Result<(), DeliveryError> {
        let url = self
            .settings
            .monitor_webhook_url
            .as_deref()
            .unwrap_or(&self.settings.webhook_url);
        let payload = render_error(report, &self.settings.identity);
        self.post(url, &payload)?;
        debug!(operation = %report.operation, "Error report sent to monitor channel");
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, RateLimitState> {
        // 状态只含时间戳，poison 后继续使用
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait_for_budget(&self) {
        let wait = {
            let mut state = self.lock_state();
            state.wait_needed(self.clock.now(), &self.settings)
        };
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "Waiting for webhook rate-limit budget");
            self.clock.sleep(wait);
        }
        let now = self.clock.now();
        self.lock_state().record_request(now);
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.settings.retry_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    fn post(&self, url: &str, payload: &WebhookPayload) -> Result<(), DeliveryError> {
        let attempts = self.settings.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.wait_for_budget();

            match self.transport.post(url, payload) {
                Ok(response) => {
                    let now = self.clock.now();
                    self.lock_state().observe(&response, now);

                    if response.is_success() {
                        return Ok(());
                    }

                    if response.status == 429 {
                        let retry_after = response
                            .retry_after
                            .unwrap_or(self.settings.default_retry_after);
                        self.lock_state().retry_at = Some(deadline(now, retry_after));
                        warn!(
                            attempt,
                            retry_after_ms = retry_after.as_millis() as u64,
                            "Webhook rate limited"
                        );
                        if self.settings.on_rate_limit == RateLimitPolicy::Queue {
                            return Err(DeliveryError::RateLimited { retry_after });
                        }
                        last_error = format!("HTTP 429, retry after {}ms", retry_after.as_millis());
                        // 下一轮 wait_for_budget 负责等待 retry-after
                        continue;
                    }

                    if response.status < 500 {
                        warn!(status = response.status, "Webhook rejected payload");
                        return Err(DeliveryError::Rejected {
                            status: response.status,
                        });
                    }

                    last_error = format!("HTTP {}", response.status);
                    warn!(attempt, max_attempts = attempts, status = response.status, "Webhook server error");
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(attempt, max_attempts = attempts, error = %e, "Webhook request failed");
                }
            }

            if attempt < attempts {
                self.clock.sleep(self.backoff(attempt));
            }
        }

        Err(DeliveryError::Exhausted {
            attempts,
            last_error,
        })
    }
}
