//! 调度器模块
//!
//! N 个任务复用 M 个 worker 的协作式调度：
//! - queue：全局 FIFO 运行队列
//! - worker：OS 工作线程与调度循环
//! - scheduler：全局单例，spawn / 停靠 / 唤醒 / 停世界汇合
//! - timer：定时器堆
//!
//! 安全点 = 函数序言栈检查（编译器契约）、channel 操作、分配入口、
//! 显式让出、经运行时的阻塞。

pub mod queue;
pub mod scheduler;
pub mod timer;
pub mod worker;

pub use queue::RunQueue;
pub use scheduler::{get_scheduler, try_get_scheduler, Scheduler, SchedulerStats, TaskHandle};
pub use timer::{TimerHeap, TimerKind};
pub use worker::Worker;

use crate::task::context::ctx_swap;
use crate::task::{Task, TaskStatus};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

std::thread_local! {
    /// 本线程正在运行的任务
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
    /// 本线程对应的 worker 下标（-1 表示非 worker 线程）
    static CURRENT_WORKER: Cell<isize> = const { Cell::new(-1) };
}

/// 当前任务（非任务线程返回 None）
pub fn current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

pub(crate) fn set_current_task(task: Option<Arc<Task>>) {
    CURRENT_TASK.with(|c| *c.borrow_mut() = task);
}

pub(crate) fn current_worker_index() -> isize {
    CURRENT_WORKER.with(|c| c.get())
}

pub(crate) fn set_current_worker(idx: isize) {
    CURRENT_WORKER.with(|c| c.set(idx));
}

/// 本线程是 worker 时返回其下标（分配器缓存快路径用）
pub(crate) fn worker_index_for_cache() -> Option<usize> {
    let i = current_worker_index();
    if i >= 0 {
        Some(i as usize)
    } else {
        None
    }
}

/// 切回当前 worker 的调度栈；任务被再次调度时从这里返回
pub(crate) fn switch_to_worker() {
    let widx = current_worker_index();
    if widx < 0 {
        crate::diag::rt_fatal("switch_to_worker outside worker thread");
    }
    let sched = get_scheduler();
    let worker = &sched.workers[widx as usize];
    let task = match current_task() {
        Some(t) => t,
        None => crate::diag::rt_fatal("switch_to_worker without current task"),
    };
    unsafe {
        ctx_swap(task.ctx.get(), worker.sched_ctx.get());
    }
}

/// 主动让出：回到队尾，让其他可运行任务先走
pub fn yield_now() {
    if current_worker_index() >= 0 {
        if let Some(task) = current_task() {
            task.set_status(TaskStatus::Runnable);
            switch_to_worker();
            return;
        }
    }
    crate::os::thread::os_yield();
}

/// 协作式安全点：停世界挂起时让出，worker 随即静默
pub(crate) fn safepoint() {
    if let Some(sched) = try_get_scheduler() {
        if sched.stop_world() && current_worker_index() >= 0 && current_task().is_some() {
            yield_now();
        }
    }
}

/// 任务入口返回后的退出路径：标记死亡并永久切出
pub(crate) fn task_exit() -> ! {
    let task = match current_task() {
        Some(t) => t,
        None => crate::diag::rt_fatal("task_exit outside task"),
    };
    task.set_status(TaskStatus::Dead);
    drop(task);
    switch_to_worker();
    crate::diag::rt_fatal("dead task resumed");
}

/// 打印任务转储（panic 终结路径）
pub fn dump_tasks() {
    if let Some(sched) = try_get_scheduler() {
        sched.dump();
    }
}
