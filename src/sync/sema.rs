//! 用户态计数信号量
//!
//! 计数为正时 acquire 走无锁快路径；否则退到内核阻塞。
//! 供 Lock 的慢路径和 GC 的停世界汇合使用。

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI64, Ordering};

/// 计数信号量
pub struct Usema {
    /// 可用计数（可为负值表示有等待者欠账，仅在慢路径下出现）
    value: AtomicI64,
    mu: Mutex<()>,
    cond: Condvar,
}

impl Usema {
    /// 创建初始计数为 n 的信号量
    pub fn new(n: i64) -> Self {
        Self {
            value: AtomicI64::new(n),
            mu: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// 获取一个计数，必要时阻塞
    pub fn acquire(&self) {
        loop {
            let v = self.value.load(Ordering::Acquire);
            if v > 0 {
                if self
                    .value
                    .compare_exchange(v, v - 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            // 慢路径：在锁下复核后停靠
            let mut guard = self.mu.lock();
            while self.value.load(Ordering::Acquire) <= 0 {
                self.cond.wait(&mut guard);
            }
        }
    }

    /// 非阻塞获取
    pub fn try_acquire(&self) -> bool {
        loop {
            let v = self.value.load(Ordering::Acquire);
            if v <= 0 {
                return false;
            }
            if self
                .value
                .compare_exchange(v, v - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// 释放 n 个计数并唤醒等待者
    pub fn release(&self, n: i64) {
        debug_assert!(n > 0);
        let _guard = self.mu.lock();
        self.value.fetch_add(n, Ordering::Release);
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    /// 当前计数（仅诊断用）
    pub fn count(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Usema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Usema").field("count", &self.count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sema_fast_path() {
        let s = Usema::new(2);
        assert!(s.try_acquire());
        assert!(s.try_acquire());
        assert!(!s.try_acquire());
        s.release(1);
        assert!(s.try_acquire());
    }

    #[test]
    fn test_sema_blocking() {
        let s = Arc::new(Usema::new(0));
        let s2 = Arc::clone(&s);
        let handle = thread::spawn(move || {
            s2.acquire();
        });
        thread::sleep(std::time::Duration::from_millis(10));
        s.release(1);
        handle.join().unwrap();
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn test_sema_rendezvous_count() {
        let s = Arc::new(Usema::new(0));
        let n = 4;
        let mut handles = Vec::new();
        for _ in 0..n {
            let s2 = Arc::clone(&s);
            handles.push(thread::spawn(move || {
                s2.release(1);
            }));
        }
        for _ in 0..n {
            s.acquire();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.count(), 0);
    }
}
