//! 时钟抽象 - 限流等待和轮询休眠都经由此 trait，测试中可替换为虚拟时钟

use std::time::{Duration, Instant};

/// 时间来源
pub trait Clock: Send + Sync {
    /// 当前单调时间
    fn now(&self) -> Instant;

    /// 阻塞当前线程指定时长
    fn sleep(&self, duration: Duration);
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_sleep_advances_now() {
        let clock = SystemClock;
        let before = clock.now();
        clock.sleep(Duration::from_millis(20));
        assert!(clock.now().duration_since(before) >= Duration::from_millis(20));
    }

    #[test]
    fn test_system_clock_zero_sleep_returns() {
        SystemClock.sleep(Duration::ZERO);
    }
}
