//! 基础设施层 - 时钟、文件锁、JSON 文件读写、退出信号

pub mod clock;
pub mod json_file;
pub mod lock;
pub mod signal;

pub use clock::{Clock, SystemClock};
pub use lock::{acquire_exclusive, lock_exclusive, InstanceGuard, LockError, LockGuard};
