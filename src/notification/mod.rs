//! 通知层 - 规范化、渲染、投递、失败队列
//!
//! # 数据流
//! 1. `Normalizer` 把原始消息变成 `NotificationRecord`（或过滤掉）
//! 2. `DeliveryClient` 按样式渲染后发往 webhook，遵守限流
//! 3. 失败交给 `ErrorReporter`，写入 `ErrorQueue`，稍后 flush 重放

pub mod delivery;
pub mod normalizer;
pub mod queue;
pub mod record;
pub mod reporter;
pub mod style;

pub use delivery::{
    DeliveryClient, DeliveryError, DeliverySettings, HttpTransport, RateLimitPolicy, RateLimitState,
    SinkResponse, TransportError, WebhookTransport,
};
pub use normalizer::{FilterReason, NormalizeError, Normalized, Normalizer};
pub use queue::{ErrorQueue, FailurePayload, FlushSummary, QueuedFailure};
pub use record::{Direction, NotificationRecord, Timestamp};
pub use reporter::{ErrorReport, ErrorReporter};
pub use style::{Identity, WebhookPayload};
