//! 工作线程 (Worker)
//!
//! 每个 worker 是一个 OS 线程：循环取队头任务、切入执行、按任务
//! 切出时的状态收尾。队空时在自己的 Note 上停靠；停世界标志升起
//! 时刷回分配器缓存并在 GC 汇合点静默。

use crate::mem::cache::WorkerCache;
use crate::os;
use crate::sync::Note;
use crate::task::context::ctx_swap;
use crate::task::{Task, TaskContext, TaskStatus};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::scheduler::{get_scheduler, Scheduler};
use super::{set_current_task, set_current_worker};

/// 空闲停靠的上限：周期性醒来复查停世界标志与队列，
/// 杜绝唤醒与清零竞争下的永久沉睡
const IDLE_PARK_MAX_NS: u64 = 100_000_000;

/// 工作线程
pub struct Worker {
    /// 线程 ID
    pub id: usize,
    /// OS 线程句柄
    thread: Mutex<Option<JoinHandle<()>>>,
    /// 停靠 Note
    pub(crate) note: Note,
    /// 是否正在停靠
    parking: AtomicBool,
    /// worker 调度栈的上下文（切出任务时回到这里）
    pub(crate) sched_ctx: UnsafeCell<TaskContext>,
    /// 当前任务
    current: Mutex<Option<Arc<Task>>>,
    /// 每-worker 分配器缓存
    pub(crate) cache: Mutex<WorkerCache>,
    /// 调度计数（统计用）
    sched_count: CachePadded<AtomicU64>,
}

// sched_ctx 只被本 worker 的线程访问
unsafe impl Send for Worker {}
unsafe impl Sync for Worker {}

impl Worker {
    pub fn new(id: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            thread: Mutex::new(None),
            note: Note::new(),
            parking: AtomicBool::new(false),
            sched_ctx: UnsafeCell::new(TaskContext::new()),
            current: Mutex::new(None),
            cache: Mutex::new(WorkerCache::new()),
            sched_count: CachePadded::new(AtomicU64::new(0)),
        })
    }

    /// 启动工作线程
    pub fn start(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        let handle = os::thread::spawn_thread(format!("worker-{}", self.id), move || {
            worker.run_loop();
        });
        match handle {
            Ok(h) => *self.thread.lock() = Some(h),
            Err(_) => crate::diag::rt_fatal("worker thread spawn failed"),
        }
    }

    /// 是否正在停靠
    #[inline]
    pub fn is_parking(&self) -> bool {
        self.parking.load(Ordering::Acquire)
    }

    /// 调度计数
    #[inline]
    pub fn sched_count(&self) -> u64 {
        self.sched_count.load(Ordering::Relaxed)
    }

    /// 主调度循环
    fn run_loop(&self) {
        set_current_worker(self.id as isize);
        let sched = get_scheduler();
        loop {
            // 停世界优先：在安全点静默
            if sched.stop_world() {
                self.quiesce(sched);
                continue;
            }

            // 调度入口检查定时器堆顶
            if sched.fire_due_timers() > 0 {
                continue;
            }

            if let Some(task) = sched.pop_runnable() {
                self.run_task(sched, task);
                continue;
            }

            // 队空：登记空闲后停靠
            self.note.clear();
            sched.push_idle(self.id);
            if sched.has_pending_work() {
                sched.remove_idle(self.id);
                continue;
            }
            self.parking.store(true, Ordering::Release);
            let timeout = match sched.next_timer_deadline() {
                Some(when) => {
                    let now = os::time::monotonic_now_ns();
                    when.saturating_sub(now).min(IDLE_PARK_MAX_NS)
                }
                None => IDLE_PARK_MAX_NS,
            };
            if timeout > 0 {
                self.note.sleep_timeout_ns(timeout);
            }
            self.parking.store(false, Ordering::Release);
            sched.remove_idle(self.id);
        }
    }

    /// 切入一个任务执行，返回后按状态收尾
    fn run_task(&self, sched: &'static Scheduler, task: Arc<Task>) {
        task.set_status(TaskStatus::Running);
        task.set_worker(self.id as i64);
        *self.current.lock() = Some(Arc::clone(&task));
        set_current_task(Some(Arc::clone(&task)));
        self.sched_count.fetch_add(1, Ordering::Relaxed);

        unsafe {
            ctx_swap(self.sched_ctx.get(), task.ctx.get());
        }

        // 任务已切出：让出 / 停靠 / 结束
        set_current_task(None);
        *self.current.lock() = None;
        task.set_worker(-1);

        match task.status() {
            TaskStatus::Runnable => {
                // 主动让出：回队尾
                sched.enqueue(task);
            }
            TaskStatus::Parking => {
                // 完成停靠转换；唤醒者若已抢先标记则立即回队
                if task.take_park_ready() {
                    task.set_status(TaskStatus::Runnable);
                    sched.enqueue(task);
                } else {
                    task.set_status(TaskStatus::Waiting);
                    if task.take_park_ready()
                        && task.cas_status(TaskStatus::Waiting, TaskStatus::Runnable)
                    {
                        sched.enqueue(task);
                    }
                }
            }
            TaskStatus::Dead => {
                sched.retire_task(&task);
            }
            other => {
                let _ = other;
                crate::diag::rt_fatal("task left scheduler in unexpected state");
            }
        }
    }

    /// 停世界静默：刷回缓存，向收集者报到，等待世界恢复
    fn quiesce(&self, sched: &'static Scheduler) {
        self.cache.lock().flush();
        sched.gc_stop_sema.release(1);
        sched.gc_resume_sema.acquire();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("parking", &self.is_parking())
            .field("sched_count", &self.sched_count())
            .finish()
    }
}
