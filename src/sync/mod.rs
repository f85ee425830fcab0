//! 增量同步 - watermark 持久化与拉取

pub mod checkpoint;
pub mod fetcher;

pub use checkpoint::{CheckpointStore, Checkpoints, FileCheckpointStore, Watermark};
pub use fetcher::WatermarkFetcher;
