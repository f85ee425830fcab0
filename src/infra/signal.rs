//! 退出信号 - SIGINT / SIGTERM 置位共享标志
//!
//! 工作线程只在休眠和消息之间检查标志，正在进行的投递和 checkpoint 会先完成。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// 等待 SIGINT 或 SIGTERM
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(i), Ok(t)) => (i, t),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to install unix signal handlers, falling back to Ctrl-C");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "Signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "Signal received"),
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(signal = "Ctrl-C", "Signal received"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl-C, shutdown only via process kill");
            std::future::pending::<()>().await;
        }
    }
}

/// 后台任务：收到信号后置位 `flag`
pub fn spawn_listener(flag: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        flag.store(true, Ordering::SeqCst);
    })
}
