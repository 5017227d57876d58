//! 单调时钟与 OS 睡眠

use std::time::Duration;

/// 单调时钟读数（纳秒）
///
/// 只保证非递减，零点无意义。
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

/// OS 级睡眠（阻塞当前 OS 线程，不经过调度器）
pub fn sleep_os_ns(ns: u64) {
    std::thread::sleep(Duration::from_nanos(ns));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = monotonic_now_ns();
        let b = monotonic_now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_sleep_advances_clock() {
        let a = monotonic_now_ns();
        sleep_os_ns(2_000_000); // 2ms
        let b = monotonic_now_ns();
        assert!(b - a >= 1_000_000);
    }
}
