//! 三态互斥锁
//!
//! 状态机：unlocked → locked → locked-with-waiters。
//! 无竞争时 acquire/release 各一条 CAS；出现竞争才惰性分配
//! 内核信号量并停靠。被唤醒的等待者保证能观测到锁已释放
//! （release 先置 unlocked 再唤醒），不存在丢失唤醒。

use super::sema::Usema;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// 自旋次数：转入内核停靠前的礼让轮数
const SPIN_COUNT: u32 = 40;

/// 三态互斥锁
pub struct Lock {
    state: AtomicU32,
    /// 首次竞争时分配，单次且线程安全
    sema: OnceLock<Usema>,
}

impl Lock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            sema: OnceLock::new(),
        }
    }

    /// 获取锁，返回 RAII 守卫
    pub fn lock(&self) -> LockGuard<'_> {
        self.acquire();
        LockGuard { lock: self }
    }

    /// 获取锁
    pub fn acquire(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.acquire_slow();
    }

    fn acquire_slow(&self) {
        // 短自旋：锁持有时间通常是 O(1)
        for _ in 0..SPIN_COUNT {
            if self
                .state
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }

        let sema = self.sema.get_or_init(|| Usema::new(0));
        loop {
            // 标记有等待者；swap 返回 UNLOCKED 说明拿到了锁
            let prev = self.state.swap(CONTENDED, Ordering::AcqRel);
            if prev == UNLOCKED {
                return;
            }
            sema.acquire();
        }
    }

    /// 非阻塞获取
    pub fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// 释放锁
    pub fn release(&self) {
        let prev = self.state.swap(UNLOCKED, Ordering::Release);
        debug_assert!(prev != UNLOCKED, "release of unlocked lock");
        if prev == CONTENDED {
            if let Some(sema) = self.sema.get() {
                sema.release(1);
            }
        }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

/// Lock 的 RAII 守卫
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_uncontended() {
        let l = Lock::new();
        l.acquire();
        assert!(!l.try_acquire());
        l.release();
        assert!(l.try_acquire());
        l.release();
    }

    #[test]
    fn test_lock_guard() {
        let l = Lock::new();
        {
            let _g = l.lock();
            assert!(!l.try_acquire());
        }
        assert!(l.try_acquire());
        l.release();
    }

    #[test]
    fn test_lock_mutual_exclusion() {
        struct Shared {
            lock: Lock,
            counter: std::cell::UnsafeCell<u64>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: Lock::new(),
            counter: std::cell::UnsafeCell::new(0),
        });

        let threads = 4;
        let iters = 10_000u64;
        let mut handles = Vec::new();
        for _ in 0..threads {
            let s = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for _ in 0..iters {
                    let _g = s.lock.lock();
                    unsafe {
                        *s.counter.get() += 1;
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let total = unsafe { *shared.counter.get() };
        assert_eq!(total, threads as u64 * iters);
    }
}
