//! 错误上报 - 运行错误经队列发往监控 webhook
//!
//! 上报只做两件事：写日志、入队。真正的发送发生在 flush 时，
//! 重放失败的告警留在队列里，不会再触发新的上报。

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};

use super::delivery::{DeliveryClient, DeliveryError};
use super::queue::{ErrorQueue, FailurePayload, FlushSummary};
use super::record::NotificationRecord;

/// 一条运行错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub timestamp: DateTime<Utc>,
    /// 出错的操作，如 `fetch:incoming`、`deliver`
    pub operation: String,
    pub error_type: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl ErrorReport {
    pub fn new(
        operation: impl Into<String>,
        error_type: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            error_type: error_type.into(),
            error: error.into(),
            message_id: None,
            context: None,
        }
    }

    pub fn with_message_id(mut self, id: impl ToString) -> Self {
        self.message_id = Some(id.to_string());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// 失败处理入口：上报、入队、flush
pub struct ErrorReporter {
    client: Arc<DeliveryClient>,
    queue: Arc<ErrorQueue>,
}

impl ErrorReporter {
    pub fn new(client: Arc<DeliveryClient>, queue: Arc<ErrorQueue>) -> Self {
        Self { client, queue }
    }

    pub fn queue(&self) -> &ErrorQueue {
        &self.queue
    }

    /// 记录一条运行错误，返回是否已持久化
    ///
    /// 入队失败只写日志，不再上报。
    pub fn report(&self, report: ErrorReport) -> bool {
        error!(
            operation = %report.operation,
            error_type = %report.error_type,
            message_id = report.message_id.as_deref().unwrap_or("-"),
            error = %report.error,
            "Operational error"
        );

        match self.queue.enqueue(FailurePayload::OperationalError { report }) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to queue error report, dropping it");
                false
            }
        }
    }

    /// 投递失败的通知入队，失败时返回错误（调用方不得推进水位）
    pub fn queue_failed_delivery(
        &self,
        record: &NotificationRecord,
        reason: &DeliveryError,
    ) -> Result<()> {
        warn!(
            message_id = %record.source_message_id,
            direction = %record.direction,
            error = %reason,
            "Delivery failed, queued for replay"
        );
        self.queue.enqueue(FailurePayload::FailedDelivery {
            record: record.clone(),
            reason: reason.to_string(),
        })
    }

    /// 重放队列：通知走主 webhook，运行错误走监控 webhook
    pub fn flush(&self) -> Result<FlushSummary> {
        self.queue.flush(|item| match &item.payload {
            FailurePayload::FailedDelivery { record, .. } => self.client.deliver(record),
            FailurePayload::OperationalError { report } => self.client.send_report(report),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::clock::Clock;
    use crate::notification::delivery::{
        DeliverySettings, SinkResponse, TransportError, WebhookTransport,
    };
    use crate::notification::record::{Direction, Timestamp};
    use crate::notification::style::WebhookPayload;
    use crate::source::MessageId;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    struct NoWaitClock;

    impl Clock for NoWaitClock {
        fn now(&self) -> Instant {
            Instant::now()
        }

        fn sleep(&self, _duration: Duration) {}
    }

    /// 可切换健康状态的 sink，记录收到的 URL 和标题
    struct SwitchableSink {
        healthy: Arc<AtomicBool>,
        received: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl WebhookTransport for SwitchableSink {
        fn post(&self, url: &str, payload: &WebhookPayload) -> Result<SinkResponse, TransportError> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(TransportError::Connect("connection refused".to_string()));
            }
            self.received
                .lock()
                .unwrap()
                .push((url.to_string(), payload.embeds[0].title.clone()));
            Ok(SinkResponse::with_status(204))
        }
    }

    struct Harness {
        reporter: ErrorReporter,
        healthy: Arc<AtomicBool>,
        received: Arc<Mutex<Vec<(String, String)>>>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let healthy = Arc::new(AtomicBool::new(true));
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = SwitchableSink {
            healthy: healthy.clone(),
            received: received.clone(),
        };

        let mut settings = DeliverySettings::new("https://sink/main");
        settings.monitor_webhook_url = Some("https://sink/monitor".to_string());
        let client = Arc::new(DeliveryClient::new(Box::new(sink), Arc::new(NoWaitClock), settings));
        let queue = Arc::new(ErrorQueue::new(dir.path().join("error_queue.json")));

        Harness {
            reporter: ErrorReporter::new(client, queue),
            healthy,
            received,
            _dir: dir,
        }
    }

    fn record(id: &str) -> NotificationRecord {
        NotificationRecord {
            direction: Direction::Incoming,
            subject: "Hello".to_string(),
            sender: "a@example.com".to_string(),
            recipient: "me@example.com".to_string(),
            timestamp: Timestamp::Verbatim("now".to_string()),
            source_message_id: MessageId::new(id),
        }
    }

    #[test]
    fn test_report_is_queued_not_sent() {
        let h = harness();

        assert!(h.reporter.report(ErrorReport::new("fetch:incoming", "Transport", "timeout")));

        assert!(h.received.lock().unwrap().is_empty());
        let pending = h.reporter.queue().pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.kind(), "operational_error");
    }

    #[test]
    fn test_flush_routes_by_kind() {
        let h = harness();
        h.reporter
            .queue_failed_delivery(&record("1"), &DeliveryError::Rejected { status: 400 })
            .unwrap();
        h.reporter.report(ErrorReport::new("deliver", "Exhausted", "boom").with_message_id("1"));

        let summary = h.reporter.flush().unwrap();

        assert_eq!(summary, FlushSummary { replayed: 2, remaining: 0 });
        let received = h.received.lock().unwrap();
        assert_eq!(received[0].0, "https://sink/main");
        assert_eq!(received[0].1, "📬 **New Email Received**");
        assert_eq!(received[1].0, "https://sink/monitor");
        assert_eq!(received[1].1, "❌ Error Alert");
    }

    #[test]
    fn test_unreachable_monitor_keeps_report_queued() {
        let h = harness();
        h.healthy.store(false, Ordering::SeqCst);
        h.reporter.report(ErrorReport::new("fetch:outgoing", "Transport", "dns failure"));

        let summary = h.reporter.flush().unwrap();

        // 仍只有一条：重放失败不会产生新的上报
        assert_eq!(summary, FlushSummary { replayed: 0, remaining: 1 });
        let pending = h.reporter.queue().pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].replay_attempts, 1);

        h.healthy.store(true, Ordering::SeqCst);
        assert_eq!(h.reporter.flush().unwrap().replayed, 1);
        assert!(h.reporter.queue().is_empty().unwrap());
    }

    #[test]
    fn test_report_serialization_omits_empty_fields() {
        let json = serde_json::to_value(ErrorReport::new("flush", "Io", "disk full")).unwrap();
        assert!(json.get("message_id").is_none());
        assert!(json.get("context").is_none());

        let report = ErrorReport::new("normalize", "UnknownDirection", "no label")
            .with_context(serde_json::json!({"labels": ["CATEGORY_SOCIAL"]}));
        let back: ErrorReport = serde_json::from_value(serde_json::to_value(&report).unwrap()).unwrap();
        assert_eq!(back, report);
    }
}
