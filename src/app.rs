//! 启动流程 - 校验配置、独占实例锁、组装组件、运行调度循环
//!
//! 任何一步失败都是致命错误（进程以非零状态退出）；
//! 凭证不可用时会先尽力上报并 flush 一次。

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::config::RelayConfig;
use crate::infra::clock::{Clock, SystemClock};
use crate::infra::lock::{acquire_exclusive, LockError};
use crate::notification::delivery::{DeliveryClient, HttpTransport, TransportError, WebhookTransport};
use crate::notification::normalizer::Normalizer;
use crate::notification::queue::ErrorQueue;
use crate::notification::reporter::{ErrorReport, ErrorReporter};
use crate::scheduler::Scheduler;
use crate::source::{CredentialError, CredentialProvider, GmailSource, MessageSource, SourceError, TokenFileCredentials};
use crate::sync::{FileCheckpointStore, WatermarkFetcher};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("credential unavailable at {path}: {source}")]
    Credential {
        path: PathBuf,
        #[source]
        source: CredentialError,
    },
    #[error("failed to build mail source: {0}")]
    Source(#[from] SourceError),
    #[error("failed to build webhook client: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// 只跑一轮
    pub once: bool,
}

/// 用给定的来源、传输和时钟组装调度器（测试可替换任意一项）
pub fn build_scheduler(
    config: &RelayConfig,
    source: Arc<dyn MessageSource>,
    transport: Box<dyn WebhookTransport>,
    clock: Arc<dyn Clock>,
) -> Scheduler {
    let client = Arc::new(DeliveryClient::new(transport, clock.clone(), config.delivery_settings()));
    let queue = Arc::new(ErrorQueue::new(config.queue_path()));
    let reporter = ErrorReporter::new(client.clone(), queue);

    Scheduler::new(
        WatermarkFetcher::new(source, config.max_messages, config.max_pages),
        Normalizer::new(&config.hidden_recipient_patterns),
        client,
        Arc::new(FileCheckpointStore::new(config.checkpoint_path())),
        reporter,
        clock,
        config.scheduler_settings(),
    )
}

/// 阻塞运行，直到 `shutdown` 置位（或 `once` 模式下跑完一轮）
pub fn run(config: RelayConfig, options: RunOptions, shutdown: Arc<AtomicBool>) -> Result<(), BootstrapError> {
    config.validate().map_err(BootstrapError::Config)?;

    let lock_path = config.lock_path();
    let _instance = acquire_exclusive(&lock_path, config.lock_timeout()).map_err(|e| {
        if let LockError::Busy { .. } = e {
            error!(path = %lock_path.display(), "Another instance is already running");
        }
        e
    })?;
    info!(data_dir = %config.data_dir.display(), "Instance lock acquired");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport = HttpTransport::new(config.webhook_timeout())?;

    let token_path = config.token_path();
    let credentials = Arc::new(
        TokenFileCredentials::new(&token_path, config.webhook_timeout()).map_err(|source| {
            BootstrapError::Credential {
                path: token_path.clone(),
                source,
            }
        })?,
    );

    if let Err(e) = credentials.bearer_token() {
        // 致命前尽力发出告警
        let client = Arc::new(DeliveryClient::new(Box::new(transport), clock, config.delivery_settings()));
        let reporter = ErrorReporter::new(client, Arc::new(ErrorQueue::new(config.queue_path())));
        reporter.report(
            ErrorReport::new("bootstrap:credentials", "CredentialError", e.to_string())
                .with_context(serde_json::json!({ "token_path": token_path.display().to_string() })),
        );
        if let Err(flush_err) = reporter.flush() {
            error!(error = %flush_err, "Error queue flush failed during startup abort");
        }
        return Err(BootstrapError::Credential {
            path: token_path,
            source: e,
        });
    }

    let source = Arc::new(GmailSource::new(config.gmail_config(), credentials)?);
    let mut scheduler = build_scheduler(&config, source, Box::new(transport), clock);

    if options.once {
        let summary = scheduler.run_once(&shutdown);
        let totals = summary.totals();
        info!(
            delivered = totals.delivered,
            queued = totals.queued,
            filtered = totals.filtered,
            skipped = totals.skipped,
            "Single cycle finished"
        );
    } else {
        scheduler.run(&shutdown);
    }

    info!("Relay stopped");
    Ok(())
}
