//! 一次性事件 (Note)
//!
//! 语义等价于一把单次使用的条件变量：
//! - wakeup 之后所有 sleep 立即返回，直到下一次 clear
//! - clear 复位事件
//!
//! worker 停靠、任务 join 都建立在它之上。

use crate::os;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// 一次性事件
pub struct Note {
    set: AtomicBool,
    mu: Mutex<()>,
    cond: Condvar,
}

impl Note {
    pub fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            mu: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// 复位事件
    pub fn clear(&self) {
        self.set.store(false, Ordering::Release);
    }

    /// 触发事件：置永久，唤醒全部停靠者
    pub fn wakeup(&self) {
        let _guard = self.mu.lock();
        self.set.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// 事件是否已触发
    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// 停靠直到事件触发
    pub fn sleep(&self) {
        if self.is_set() {
            return;
        }
        let mut guard = self.mu.lock();
        while !self.is_set() {
            self.cond.wait(&mut guard);
        }
    }

    /// 带超时停靠，返回 true 表示事件触发，false 表示超时
    pub fn sleep_timeout_ns(&self, timeout_ns: u64) -> bool {
        if self.is_set() {
            return true;
        }
        let deadline = os::time::monotonic_now_ns().saturating_add(timeout_ns);
        let mut guard = self.mu.lock();
        while !self.is_set() {
            let now = os::time::monotonic_now_ns();
            if now >= deadline {
                return self.is_set();
            }
            let remain = Duration::from_nanos(deadline - now);
            let result = self.cond.wait_for(&mut guard, remain);
            if result.timed_out() {
                return self.is_set();
            }
        }
        true
    }
}

impl Default for Note {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Note {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Note").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_note_wakeup_before_sleep() {
        let n = Note::new();
        n.wakeup();
        // 已触发：立即返回
        n.sleep();
        n.sleep();
        n.clear();
        assert!(!n.is_set());
    }

    #[test]
    fn test_note_cross_thread() {
        let n = Arc::new(Note::new());
        let n2 = Arc::clone(&n);
        let handle = thread::spawn(move || {
            n2.sleep();
        });
        thread::sleep(Duration::from_millis(10));
        n.wakeup();
        handle.join().unwrap();
    }

    #[test]
    fn test_note_timeout() {
        let n = Note::new();
        let woken = n.sleep_timeout_ns(5_000_000); // 5ms
        assert!(!woken);

        n.wakeup();
        assert!(n.sleep_timeout_ns(1_000_000));
    }
}
