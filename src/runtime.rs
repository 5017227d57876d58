//! 运行时门面
//!
//! 对外入口的汇集点：Runtime 负责"跑一个主任务到结束"，自由函数
//! 对应运行时的各个入口（spawn、channel、select、睡眠、分配、
//! finalizer、收集、栈检查）。

use crate::chan::Chan;
use crate::config::RuntimeConfig;
use crate::sched::{self, get_scheduler, TaskHandle};
use parking_lot::Mutex;
use std::sync::Arc;

/// Z 运行时
///
/// 调度器是进程级单例：第一个 Runtime（或第一次 spawn）的配置
/// 生效，之后的配置被忽略。
pub struct Runtime {
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        crate::sched::scheduler::init_scheduler(config.clone());
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(RuntimeConfig::default())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// 以主任务身份运行 f 并等待它结束，返回其结果
    pub fn run<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let result: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        let handle = get_scheduler().spawn(Box::new(move || {
            let v = f();
            *slot.lock() = Some(v);
        }));
        handle.join();
        let taken = result.lock().take();
        match taken {
            Some(v) => v,
            None => crate::diag::rt_fatal("main task finished without result"),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// 运行时入口（自由函数）
// ============================================================================

/// 创建新任务，立即返回
pub fn spawn<F>(f: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    get_scheduler().spawn(Box::new(f))
}

/// 主动让出当前任务
pub fn gosched() {
    sched::yield_now();
}

/// 当前任务睡眠 d 纳秒
pub fn sleep_ns(d: u64) {
    get_scheduler().sleep_current_ns(d);
}

/// 创建元素类型为 T 的 channel
pub fn chan_make<T: Copy + Default + Send + 'static>(cap: usize) -> Chan<T> {
    Chan::new(cap)
}

/// d 纳秒后收到时间戳的一次性 channel（select 超时用）
pub fn after_ns(d: u64) -> Chan<u64> {
    Chan::from_raw(get_scheduler().after_ns(d))
}

/// 序言栈检查：当前栈指针仍在警戒字之上则为 true
pub fn stack_check() -> bool {
    let probe = 0u8;
    let sp = &probe as *const u8 as usize;
    match sched::current_task() {
        Some(task) => {
            let stack = task.stack.lock();
            stack.as_ref().map(|s| s.check(sp)).unwrap_or(true)
        }
        None => true,
    }
}

/// 栈增长入口（编译器在警戒字检查失败时调用）
///
/// 保留区耗尽是不可恢复的：直接中止。
pub fn stack_grow() {
    match sched::current_task() {
        Some(task) => {
            if task.stack_grow().is_err() {
                crate::diag::rt_fatal("stack overflow");
            }
        }
        None => crate::diag::rt_fatal("stack_grow outside task"),
    }
}
