//! 调度循环 - 定时轮询两个流，投递新邮件，推进 watermark
//!
//! 每个周期按顺序处理所有流，单个流的失败只影响该流本轮：
//! 错误经 `ErrorReporter` 入队，watermark 保持不变，下轮重试。
//!
//! 队列 flush 时机：启动时、有活动的周期之后、距上次 flush 超过
//! `flush_interval` 时、退出前。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::infra::clock::Clock;
use crate::notification::delivery::DeliveryClient;
use crate::notification::normalizer::{FilterReason, Normalized, Normalizer};
use crate::notification::reporter::{ErrorReport, ErrorReporter};
use crate::source::{RawMessage, SourceError, Stream};
use crate::sync::{CheckpointStore, Watermark, WatermarkFetcher};

/// 休眠检查退出信号的粒度
const SLEEP_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub flush_interval: Duration,
    /// 每个流每轮最多投递（或入队）的条数
    pub batch_size: usize,
    pub streams: Vec<Stream>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            flush_interval: Duration::from_secs(3600),
            batch_size: 25,
            streams: Stream::ALL.to_vec(),
        }
    }
}

/// 单条消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Delivered,
    /// 投递失败，已入队
    Queued,
    Filtered(FilterReason),
    /// 数据错误，已上报并跳过
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCounts {
    pub delivered: usize,
    pub queued: usize,
    pub filtered: usize,
    pub skipped: usize,
}

impl StreamCounts {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Delivered => self.delivered += 1,
            MessageOutcome::Queued => self.queued += 1,
            MessageOutcome::Filtered(_) => self.filtered += 1,
            MessageOutcome::Skipped => self.skipped += 1,
        }
    }

    /// 已推进 watermark 的条数
    fn accounted(&self) -> usize {
        self.delivered + self.queued + self.skipped
    }
}

/// 单个流一轮的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    NoChange,
    Processed(StreamCounts),
    /// 本轮中止，错误已上报
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub streams: Vec<(Stream, StreamOutcome)>,
}

impl CycleSummary {
    /// 有投递、入队、上报或失败时为 true
    pub fn has_activity(&self) -> bool {
        self.streams.iter().any(|(_, outcome)| match outcome {
            StreamOutcome::NoChange => false,
            StreamOutcome::Processed(counts) => counts.accounted() > 0,
            StreamOutcome::Failed => true,
        })
    }

    pub fn totals(&self) -> StreamCounts {
        let mut totals = StreamCounts::default();
        for (_, outcome) in &self.streams {
            if let StreamOutcome::Processed(c) = outcome {
                totals.delivered += c.delivered;
                totals.queued += c.queued;
                totals.filtered += c.filtered;
                totals.skipped += c.skipped;
            }
        }
        totals
    }
}

/// 中止一个流本轮处理的错误
#[derive(Debug, Error)]
enum StreamError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("checkpoint store failed: {0:#}")]
    Checkpoint(anyhow::Error),
    #[error("error queue failed: {0:#}")]
    Queue(anyhow::Error),
}

impl StreamError {
    fn operation(&self) -> &'static str {
        match self {
            StreamError::Source(_) => "fetch",
            StreamError::Checkpoint(_) => "checkpoint",
            StreamError::Queue(_) => "queue",
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            StreamError::Source(_) => "SourceError",
            StreamError::Checkpoint(_) => "CheckpointError",
            StreamError::Queue(_) => "QueueError",
        }
    }
}

pub struct Scheduler {
    fetcher: WatermarkFetcher,
    normalizer: Normalizer,
    client: Arc<DeliveryClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    reporter: ErrorReporter,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    last_flush: Option<Instant>,
}

impl Scheduler {
    pub fn new(
        fetcher: WatermarkFetcher,
        normalizer: Normalizer,
        client: Arc<DeliveryClient>,
        checkpoints: Arc<dyn CheckpointStore>,
        reporter: ErrorReporter,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            fetcher,
            normalizer,
            client,
            checkpoints,
            reporter,
            clock,
            settings,
            last_flush: None,
        }
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// 主循环，直到 `shutdown` 被置位
    ///
    /// 返回运行的周期数。
    pub fn run(&mut self, shutdown: &AtomicBool) -> u64 {
        info!(
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            streams = ?self.settings.streams,
            "Relay started"
        );
        self.flush("startup");

        let mut cycles = 0;
        while !shutdown.load(Ordering::SeqCst) {
            let summary = self.run_cycle(shutdown);
            cycles += 1;

            if summary.has_activity() || self.flush_due() {
                self.flush("cycle");
            }

            self.sleep_interruptible(self.settings.poll_interval, shutdown);
        }

        info!(cycles, "Shutdown requested, flushing error queue");
        self.flush("shutdown");
        cycles
    }

    /// 单轮：先 flush 上次遗留的队列，运行一个周期后再 flush
    pub fn run_once(&mut self, shutdown: &AtomicBool) -> CycleSummary {
        self.flush("startup");
        let summary = self.run_cycle(shutdown);
        self.flush("once");
        summary
    }

    /// 依次处理所有流
    pub fn run_cycle(&mut self, shutdown: &AtomicBool) -> CycleSummary {
        let mut summary = CycleSummary::default();

        for stream in self.settings.streams.clone() {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            let outcome = match self.process_stream(stream, shutdown) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.reporter.report(ErrorReport::new(
                        format!("{}:{}", e.operation(), stream),
                        e.error_type(),
                        e.to_string(),
                    ));
                    StreamOutcome::Failed
                }
            };

            if let StreamOutcome::Processed(counts) = outcome {
                info!(
                    stream = %stream,
                    delivered = counts.delivered,
                    queued = counts.queued,
                    filtered = counts.filtered,
                    skipped = counts.skipped,
                    "Stream processed"
                );
            }
            summary.streams.push((stream, outcome));
        }

        summary
    }

    fn process_stream(&self, stream: Stream, shutdown: &AtomicBool) -> Result<StreamOutcome, StreamError> {
        let watermark = self.checkpoints.load(stream).map_err(StreamError::Checkpoint)?;
        let messages = self.fetcher.fetch_since(stream, watermark.as_ref())?;

        if messages.is_empty() {
            debug!(stream = %stream, "No new messages");
            return Ok(StreamOutcome::NoChange);
        }

        let mut counts = StreamCounts::default();
        for raw in &messages {
            if shutdown.load(Ordering::SeqCst) {
                info!(stream = %stream, "Shutdown requested, stopping stream");
                break;
            }
            if counts.delivered + counts.queued >= self.settings.batch_size {
                info!(
                    stream = %stream,
                    batch_size = self.settings.batch_size,
                    pending = messages.len() - counts.accounted() - counts.filtered,
                    "Batch limit reached, rest deferred to next cycle"
                );
                break;
            }

            let outcome = self.process_message(stream, raw)?;
            counts.record(outcome);
        }

        Ok(StreamOutcome::Processed(counts))
    }

    /// 投递（或入队）后立即推进 watermark
    fn process_message(&self, stream: Stream, raw: &RawMessage) -> Result<MessageOutcome, StreamError> {
        let record = match self.normalizer.normalize(raw, stream) {
            Ok(Normalized::Record(record)) => record,
            Ok(Normalized::Filtered(reason)) => {
                debug!(stream = %stream, message_id = %raw.id, reason = ?reason, "Message filtered");
                return Ok(MessageOutcome::Filtered(reason));
            }
            Err(e) => {
                let report = ErrorReport::new(format!("normalize:{}", stream), "UnknownDirection", e.to_string())
                    .with_message_id(&raw.id)
                    .with_context(json!({ "labels": raw.label_ids }));
                if !self.reporter.report(report) {
                    return Err(StreamError::Queue(anyhow::anyhow!(
                        "could not record data error for message {}",
                        raw.id
                    )));
                }
                self.advance(stream, raw)?;
                return Ok(MessageOutcome::Skipped);
            }
        };

        let outcome = match self.client.deliver(&record) {
            Ok(()) => MessageOutcome::Delivered,
            Err(e) => {
                self.reporter
                    .queue_failed_delivery(&record, &e)
                    .map_err(StreamError::Queue)?;
                MessageOutcome::Queued
            }
        };
        self.advance(stream, raw)?;
        Ok(outcome)
    }

    fn advance(&self, stream: Stream, raw: &RawMessage) -> Result<(), StreamError> {
        self.checkpoints.advance(stream, &Watermark::of(raw)).map_err(|e| {
            error!(stream = %stream, message_id = %raw.id, error = %e, "Failed to advance watermark");
            StreamError::Checkpoint(e)
        })
    }

    fn flush_due(&self) -> bool {
        match self.last_flush {
            Some(at) => self.clock.now().saturating_duration_since(at) >= self.settings.flush_interval,
            None => true,
        }
    }

    fn flush(&mut self, trigger: &str) {
        self.last_flush = Some(self.clock.now());
        match self.reporter.flush() {
            Ok(summary) if summary.remaining > 0 => {
                warn!(trigger, remaining = summary.remaining, "Error queue not fully drained");
            }
            Ok(_) => {}
            Err(e) => error!(trigger, error = %e, "Error queue flush failed"),
        }
    }

    fn sleep_interruptible(&self, duration: Duration, shutdown: &AtomicBool) {
        let mut remaining = duration;
        while !remaining.is_zero() && !shutdown.load(Ordering::SeqCst) {
            let step = remaining.min(SLEEP_STEP);
            self.clock.sleep(step);
            remaining -= step;
        }
    }
}
