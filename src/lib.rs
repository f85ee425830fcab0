//! Inbox Relay - 把新邮件转发到 Discord webhook，重启后从上次位置继续

pub mod app;
pub mod config;
pub mod infra;
pub mod notification;
pub mod scheduler;
pub mod source;
pub mod sync;

pub use config::RelayConfig;
pub use notification::{
    DeliveryClient, DeliveryError, Direction, ErrorQueue, ErrorReport, ErrorReporter,
    NotificationRecord, Normalizer,
};
pub use scheduler::{CycleSummary, MessageOutcome, Scheduler, SchedulerSettings, StreamOutcome};
pub use source::{MessageId, MessageSource, RawMessage, Stream};
pub use sync::{CheckpointStore, FileCheckpointStore, Watermark, WatermarkFetcher};
