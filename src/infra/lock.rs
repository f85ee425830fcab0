//! 文件锁 - 基于 fs2 的跨进程咨询锁
//!
//! - `lock_exclusive`：阻塞获取，用于 checkpoint / error queue 的读-改-写
//! - `acquire_exclusive`：短时限内获取实例锁，保证同一数据目录只运行一个 relay

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

/// 实例锁轮询间隔
const TRY_LOCK_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance holds {path} (waited {waited_ms}ms)")]
    Busy { path: PathBuf, waited_ms: u128 },
    #[error("cannot open lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 持有中的文件锁，drop 时释放
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "Failed to release file lock");
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }

    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// 获取排他锁（阻塞等待）
pub fn lock_exclusive(path: &Path) -> Result<LockGuard, LockError> {
    let file = open_lock_file(path)?;
    file.lock_exclusive().map_err(|source| LockError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(LockGuard {
        file,
        path: path.to_path_buf(),
    })
}

/// 实例锁句柄
///
/// 进程正常退出、出错返回或 panic 展开时都会经由 drop 释放锁。
#[derive(Debug)]
pub struct InstanceGuard {
    _lock: LockGuard,
}

/// 在 `timeout` 内尝试获取实例锁，不做额外重试
pub fn acquire_exclusive(path: &Path, timeout: Duration) -> Result<InstanceGuard, LockError> {
    let file = open_lock_file(path)?;
    let start = Instant::now();

    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Instance lock acquired");
                return Ok(InstanceGuard {
                    _lock: LockGuard {
                        file,
                        path: path.to_path_buf(),
                    },
                });
            }
            Err(_) if start.elapsed() < timeout => {
                std::thread::sleep(TRY_LOCK_POLL.min(timeout.saturating_sub(start.elapsed())));
            }
            Err(_) => {
                return Err(LockError::Busy {
                    path: path.to_path_buf(),
                    waited_ms: start.elapsed().as_millis(),
                });
            }
        }
    }
}
