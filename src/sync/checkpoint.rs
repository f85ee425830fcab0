//! Checkpoint 存储 - 每个流最后一条已确认送达（或已入队）的消息
//!
//! 存储位置：`<data_dir>/checkpoints.json`
//! ```json
//! {
//!   "incoming": { "id": "18c2f", "internal_date_ms": 1760000000000 },
//!   "outgoing": { "id": "18c30", "internal_date_ms": 1760000100000 }
//! }
//! ```
//!
//! 旧格式（值只有消息 ID 字符串）仍可读取，下次推进时改写为新格式。
//! 记录时间用于 watermark 消息从列表中消失（归档、删除）后定位边界。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::infra::json_file::{lock_path_for, read_json, write_json_atomic};
use crate::infra::lock::lock_exclusive;
use crate::source::{MessageId, RawMessage, Stream};

/// 单个流的 watermark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredWatermark")]
pub struct Watermark {
    pub id: MessageId,
    /// 消息的 internalDate（毫秒），来源未提供时为 `None`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_date_ms: Option<i64>,
}

impl Watermark {
    pub fn new(id: MessageId) -> Self {
        Self {
            id,
            internal_date_ms: None,
        }
    }

    pub fn with_internal_date(mut self, ms: i64) -> Self {
        self.internal_date_ms = Some(ms);
        self
    }

    /// 以这条消息作为 watermark
    pub fn of(raw: &RawMessage) -> Self {
        Self {
            id: raw.id.clone(),
            internal_date_ms: raw.internal_date_ms,
        }
    }
}

/// 磁盘上的两种写法：旧版纯 ID 字符串，新版带时间的对象
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredWatermark {
    Bare(MessageId),
    Full {
        id: MessageId,
        #[serde(default)]
        internal_date_ms: Option<i64>,
    },
}

impl From<StoredWatermark> for Watermark {
    fn from(stored: StoredWatermark) -> Self {
        match stored {
            StoredWatermark::Bare(id) => Watermark::new(id),
            StoredWatermark::Full { id, internal_date_ms } => Watermark { id, internal_date_ms },
        }
    }
}

/// 流名 -> watermark（`null` 表示尚未处理过）
pub type Checkpoints = BTreeMap<String, Option<Watermark>>;

/// watermark 持久化接口
pub trait CheckpointStore: Send + Sync {
    /// 读取流的 watermark，冷启动时为 `None`
    fn load(&self, stream: Stream) -> Result<Option<Watermark>>;

    /// 将流的 watermark 设为 `mark`
    ///
    /// 调用方保证 `mark` 比当前 watermark 新，且对应消息已送达或已入队。
    fn advance(&self, stream: Stream, mark: &Watermark) -> Result<()>;
}

/// JSON 文件实现，读-改-写在文件锁内完成
pub struct FileCheckpointStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取所有流的 checkpoint
    pub fn snapshot(&self) -> Result<Checkpoints> {
        let _guard = lock_exclusive(&self.lock_path)?;
        self.read_unlocked()
    }

    fn read_unlocked(&self) -> Result<Checkpoints> {
        Ok(read_json::<Checkpoints>(&self.path)?.unwrap_or_default())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, stream: Stream) -> Result<Option<Watermark>> {
        Ok(self.snapshot()?.get(stream.name()).cloned().flatten())
    }

    fn advance(&self, stream: Stream, mark: &Watermark) -> Result<()> {
        let _guard = lock_exclusive(&self.lock_path)?;
        let mut checkpoints = self.read_unlocked()?;
        checkpoints.insert(stream.name().to_string(), Some(mark.clone()));
        write_json_atomic(&self.path, &checkpoints)
            .with_context(|| format!("Failed to advance {} watermark to {}", stream, mark.id))?;

        debug!(
            stream = %stream,
            message_id = %mark.id,
            internal_date_ms = ?mark.internal_date_ms,
            "Watermark advanced"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mark(id: &str) -> Watermark {
        Watermark::new(MessageId::new(id))
    }

    #[test]
    fn test_cold_start_has_no_watermark() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints.json"));

        assert_eq!(store.load(Stream::Incoming).unwrap(), None);
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_streams_are_independent() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints.json"));

        store.advance(Stream::Incoming, &mark("5")).unwrap();
        store.advance(Stream::Outgoing, &mark("9")).unwrap();
        store.advance(Stream::Incoming, &mark("8")).unwrap();

        assert_eq!(store.load(Stream::Incoming).unwrap(), Some(mark("8")));
        assert_eq!(store.load(Stream::Outgoing).unwrap(), Some(mark("9")));
    }

    #[test]
    fn test_checkpoint_survives_reopen_with_date() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        FileCheckpointStore::new(&path)
            .advance(Stream::Outgoing, &mark("abc").with_internal_date(1_760_000_000_000))
            .unwrap();

        let reopened = FileCheckpointStore::new(&path);
        let loaded = reopened.load(Stream::Outgoing).unwrap().unwrap();
        assert_eq!(loaded.id, MessageId::new("abc"));
        assert_eq!(loaded.internal_date_ms, Some(1_760_000_000_000));
    }

    #[test]
    fn test_bare_id_entries_still_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        std::fs::write(&path, r#"{"incoming": "42", "outgoing": null}"#).unwrap();

        let store = FileCheckpointStore::new(&path);
        assert_eq!(store.load(Stream::Incoming).unwrap(), Some(mark("42")));
        assert_eq!(store.load(Stream::Outgoing).unwrap(), None);
    }

    #[test]
    fn test_advance_rewrites_bare_entry_as_object() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        std::fs::write(&path, r#"{"incoming": "42"}"#).unwrap();

        let store = FileCheckpointStore::new(&path);
        store
            .advance(Stream::Incoming, &mark("43").with_internal_date(7))
            .unwrap();

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["incoming"]["id"], "43");
        assert_eq!(raw["incoming"]["internal_date_ms"], 7);
    }
}
