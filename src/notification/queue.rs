//! 错误/重试队列 - 投递失败和运行错误的持久化列表
//!
//! 存储位置：`<data_dir>/error_queue.json`（JSON 数组，按入队顺序）
//!
//! - 入队：文件锁内读-改-写，原子替换
//! - flush：同一把锁内按顺序重放，只保留仍失败的条目；全部成功则删除文件
//! - 无法解析的条目原样保留并报错，绝不丢弃

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::delivery::DeliveryError;
use super::record::NotificationRecord;
use super::reporter::ErrorReport;
use crate::infra::json_file::{lock_path_for, read_json, write_json_atomic};
use crate::infra::lock::lock_exclusive;

/// 队列条目内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailurePayload {
    /// 邮件通知投递失败
    FailedDelivery {
        record: NotificationRecord,
        reason: String,
    },
    /// 运行错误，重放时发往监控 webhook
    OperationalError { report: ErrorReport },
}

impl FailurePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            FailurePayload::FailedDelivery { .. } => "failed_delivery",
            FailurePayload::OperationalError { .. } => "operational_error",
        }
    }
}

/// 队列条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedFailure {
    pub payload: FailurePayload,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub replay_attempts: u32,
}

/// flush 结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub replayed: usize,
    pub remaining: usize,
}

/// 文件队列
pub struct ErrorQueue {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ErrorQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一条失败记录
    pub fn enqueue(&self, payload: FailurePayload) -> Result<()> {
        let kind = payload.kind();
        let item = QueuedFailure {
            payload,
            enqueued_at: Utc::now(),
            replay_attempts: 0,
        };

        let _guard = lock_exclusive(&self.lock_path)?;
        let mut entries = self.read_entries()?;
        entries.push(serde_json::to_value(&item)?);
        self.write_entries(&entries)
            .with_context(|| format!("Failed to enqueue {} into {}", kind, self.path.display()))?;

        debug!(kind, queued = entries.len(), "Failure queued");
        Ok(())
    }

    /// 可解析的待重放条目（按顺序）
    pub fn pending(&self) -> Result<Vec<QueuedFailure>> {
        let _guard = lock_exclusive(&self.lock_path)?;
        Ok(self
            .read_entries()?
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    /// 条目总数（含无法解析的）
    pub fn len(&self) -> Result<usize> {
        let _guard = lock_exclusive(&self.lock_path)?;
        Ok(self.read_entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// 按顺序重放所有条目
    ///
    /// `replay` 失败的条目保留在原位置；一旦出现 sink 不可用（限流或重试耗尽），
    /// 后续条目不再尝试，原样保留到下次 flush。
    pub fn flush<F>(&self, mut replay: F) -> Result<FlushSummary>
    where
        F: FnMut(&QueuedFailure) -> Result<(), DeliveryError>,
    {
        let _guard = lock_exclusive(&self.lock_path)?;
        let entries = self.read_entries()?;
        if entries.is_empty() {
            return Ok(FlushSummary::default());
        }

        let total = entries.len();
        let mut remaining = Vec::new();
        let mut replayed = 0;
        let mut sink_down = false;

        for value in entries {
            if sink_down {
                remaining.push(value);
                continue;
            }

            let mut item: QueuedFailure = match serde_json::from_value(value.clone()) {
                Ok(item) => item,
                Err(e) => {
                    error!(error = %e, entry = %value, "Unreadable queue entry kept for inspection");
                    remaining.push(value);
                    continue;
                }
            };

            match replay(&item) {
                Ok(()) => replayed += 1,
                Err(e) => {
                    warn!(
                        kind = item.payload.kind(),
                        attempts = item.replay_attempts + 1,
                        error = %e,
                        "Queued failure still failing"
                    );
                    sink_down = !matches!(e, DeliveryError::Rejected { .. });
                    item.replay_attempts += 1;
                    remaining.push(serde_json::to_value(&item)?);
                }
            }
        }

        self.write_entries(&remaining)?;

        let summary = FlushSummary {
            replayed,
            remaining: remaining.len(),
        };
        info!(total, replayed = summary.replayed, remaining = summary.remaining, "Error queue flushed");
        Ok(summary)
    }

    /// 调用方必须持有锁
    fn read_entries(&self) -> Result<Vec<Value>> {
        match read_json::<Value>(&self.path) {
            Ok(None) => Ok(Vec::new()),
            Ok(Some(Value::Array(entries))) => Ok(entries),
            Ok(Some(_)) => {
                self.quarantine("top-level value is not an array")?;
                Ok(Vec::new())
            }
            Err(e) => {
                self.quarantine(&format!("{:#}", e))?;
                Ok(Vec::new())
            }
        }
    }

    /// 调用方必须持有锁；空列表时删除文件
    fn write_entries(&self, entries: &[Value]) -> Result<()> {
        if entries.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)
                    .with_context(|| format!("Failed to remove {}", self.path.display()))?;
            }
            return Ok(());
        }
        write_json_atomic(&self.path, entries)
    }

    /// 损坏的队列文件移到一边，保留给人工处理
    fn quarantine(&self, reason: &str) -> Result<()> {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%d-%H%M%S")));
        let target = self.path.with_file_name(name);

        fs::rename(&self.path, &target)
            .with_context(|| format!("Failed to move corrupt queue {}", self.path.display()))?;
        error!(
            path = %self.path.display(),
            moved_to = %target.display(),
            reason,
            "Error queue file corrupt, moved aside"
        );
        Ok(())
    }
}
