//! 全局调度器
//!
//! 进程级单例：全局运行队列 + 固定 worker 池 + 任务注册表 +
//! 定时器堆 + 停世界汇合。运行队列与空闲表各自一把锁，持锁
//! 时间 O(1)。

use crate::chan::Channel;
use crate::config::RuntimeConfig;
use crate::os;
use crate::sync::Usema;
use crate::task::{StackPool, Task, TaskId, TaskStatus, WaitReason};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use super::queue::RunQueue;
use super::timer::{TimerHeap, TimerKind};
use super::worker::Worker;
use super::{current_task, current_worker_index, switch_to_worker};

/// 全局调度器单例
pub static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

/// 获取全局调度器（首次调用完成初始化并启动 worker 池）
pub fn get_scheduler() -> &'static Scheduler {
    let sched = SCHEDULER.get_or_init(|| Scheduler::new(RuntimeConfig::default()));
    sched.ensure_started();
    sched
}

/// 不触发初始化地获取调度器
pub fn try_get_scheduler() -> Option<&'static Scheduler> {
    SCHEDULER.get()
}

/// 用指定配置初始化调度器；已初始化则配置被忽略，返回 false
pub fn init_scheduler(config: RuntimeConfig) -> bool {
    let mut applied = false;
    let sched = SCHEDULER.get_or_init(|| {
        applied = true;
        Scheduler::new(config)
    });
    sched.ensure_started();
    applied
}

/// 任务句柄（供运行时外部线程等待任务结束）
pub struct TaskHandle {
    pub(crate) task: Arc<Task>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn is_done(&self) -> bool {
        self.task.is_dead()
    }

    /// 阻塞当前 OS 线程直到任务结束
    ///
    /// 只应从运行时外部（非任务）线程调用；任务之间的等待用 channel。
    pub fn join(&self) {
        self.task.join_note.sleep();
    }
}

/// 调度统计信息
#[derive(Debug)]
pub struct SchedulerStats {
    pub task_count: u64,
    pub runq_len: usize,
    pub idle_workers: usize,
    pub timer_count: usize,
    pub worker_sched_counts: Vec<u64>,
}

/// 全局调度器
pub struct Scheduler {
    /// 配置
    pub(crate) config: RuntimeConfig,
    /// worker 池（进程生命周期）
    pub(crate) workers: Vec<Arc<Worker>>,
    /// 全局运行队列
    runq: RunQueue,
    /// 空闲 worker 表
    idle: Mutex<Vec<usize>>,
    /// 任务注册表（GC 扫描栈根时遍历）
    pub(crate) tasks: DashMap<TaskId, Arc<Task>>,
    /// 任务 ID 计数器
    next_id: AtomicU64,
    /// 存活任务数
    live: AtomicU64,
    /// 定时器堆
    timers: Mutex<TimerHeap>,
    /// 停世界标志
    stop_world: AtomicBool,
    /// worker 静默报到（worker → 收集者）
    pub(crate) gc_stop_sema: Usema,
    /// 世界恢复放行（收集者 → worker）
    pub(crate) gc_resume_sema: Usema,
    /// 收集者互斥
    pub(crate) gc_mu: Mutex<()>,
    /// worker 池是否已启动
    started: AtomicBool,
    /// 空闲栈缓存
    pub(crate) stack_pool: StackPool,
    /// 调度器级伪随机状态（select 洗牌）
    rand_state: AtomicU64,
}

impl Scheduler {
    /// 使用指定配置创建调度器（worker 线程由 ensure_started 启动）
    pub fn new(config: RuntimeConfig) -> Self {
        let num_workers = config.num_workers.max(1);
        let workers: Vec<_> = (0..num_workers).map(Worker::new).collect();
        let seed = os::time::monotonic_now_ns() | 1;
        Self {
            config,
            workers,
            runq: RunQueue::new(),
            idle: Mutex::new(Vec::new()),
            tasks: DashMap::new(),
            next_id: AtomicU64::new(0),
            live: AtomicU64::new(0),
            timers: Mutex::new(TimerHeap::new()),
            stop_world: AtomicBool::new(false),
            gc_stop_sema: Usema::new(0),
            gc_resume_sema: Usema::new(0),
            gc_mu: Mutex::new(()),
            started: AtomicBool::new(false),
            stack_pool: StackPool::new(),
            rand_state: AtomicU64::new(seed),
        }
    }

    /// 启动 worker 池（只执行一次）
    pub fn ensure_started(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        for w in &self.workers {
            w.start();
        }
    }

    // ========================================================================
    // 任务生命周期
    // ========================================================================

    /// 创建并调度新任务
    pub fn spawn(&self, f: Box<dyn FnOnce() + Send + 'static>) -> TaskHandle {
        super::safepoint();
        let stack = match self.stack_pool.alloc(self.config.stack_reserve) {
            Ok(s) => s,
            Err(_) => {
                // 先强制一次收集再试；仍失败按资源耗尽处理
                crate::gc::collect_now();
                match self.stack_pool.alloc(self.config.stack_reserve) {
                    Ok(s) => s,
                    Err(_) => crate::diag::rt_fatal("out of memory: task stack"),
                }
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let task = Arc::new(Task::new(id, f, stack));
        task.init_context();
        self.tasks.insert(id, Arc::clone(&task));
        self.live.fetch_add(1, Ordering::Relaxed);
        self.enqueue(Arc::clone(&task));
        TaskHandle { task }
    }

    /// 任务结束后的收尾（由 worker 在切出后调用）
    pub(crate) fn retire_task(&self, task: &Arc<Task>) {
        self.tasks.remove(&task.id);
        if let Some(stack) = task.stack.lock().take() {
            self.stack_pool.free(stack);
        }
        self.live.fetch_sub(1, Ordering::Relaxed);
        task.join_note.wakeup();
    }

    /// 存活任务数
    pub fn task_count(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    // ========================================================================
    // 运行队列与 worker 停靠
    // ========================================================================

    /// 入队并唤醒一个空闲 worker
    pub(crate) fn enqueue(&self, task: Arc<Task>) {
        if self.runq.push(task) {
            self.wake_one_idle();
        }
    }

    pub(crate) fn pop_runnable(&self) -> Option<Arc<Task>> {
        self.runq.pop()
    }

    fn wake_one_idle(&self) {
        let popped = self.idle.lock().pop();
        if let Some(i) = popped {
            self.workers[i].note.wakeup();
        }
    }

    pub(crate) fn push_idle(&self, id: usize) {
        let mut idle = self.idle.lock();
        if !idle.contains(&id) {
            idle.push(id);
        }
    }

    pub(crate) fn remove_idle(&self, id: usize) {
        self.idle.lock().retain(|&i| i != id);
    }

    /// 入空闲表后的复核：有任何待处理工作则不停靠
    pub(crate) fn has_pending_work(&self) -> bool {
        if !self.runq.is_empty() || self.stop_world() {
            return true;
        }
        match self.timers.lock().next_deadline() {
            Some(when) => when <= os::time::monotonic_now_ns(),
            None => false,
        }
    }

    // ========================================================================
    // 停靠 / 唤醒
    // ========================================================================

    /// 宣布当前任务即将阻塞
    ///
    /// 必须在仍持有资源锁（channel、定时器堆）时调用，保证唤醒者
    /// 观测到的状态不早于 Parking；随后释放资源锁再 park_commit。
    pub(crate) fn park_begin(&self, task: &Task, reason: WaitReason) {
        debug_assert_eq!(task.status(), TaskStatus::Running);
        task.clear_park_ready();
        task.set_wait_reason(Some(reason));
        task.set_status(TaskStatus::Parking);
    }

    /// 完成停靠：切回 worker 调度栈，直到被唤醒才返回
    pub(crate) fn park_commit(&self) {
        switch_to_worker();
        if let Some(task) = current_task() {
            task.set_wait_reason(None);
        }
    }

    /// 唤醒一个阻塞任务
    ///
    /// 与 park_begin/worker 收尾之间用 park_ready 标志握手，
    /// 不存在丢失唤醒。
    pub fn ready(&self, task: &Arc<Task>) {
        loop {
            match task.status() {
                TaskStatus::Parking => {
                    task.set_park_ready();
                    // worker 可能恰在标志置位前完成了 Parking→Waiting
                    if task.status() == TaskStatus::Waiting
                        && task.take_park_ready()
                        && task.cas_status(TaskStatus::Waiting, TaskStatus::Runnable)
                    {
                        self.enqueue(Arc::clone(task));
                    }
                    return;
                }
                TaskStatus::Waiting => {
                    if task.cas_status(TaskStatus::Waiting, TaskStatus::Runnable) {
                        self.enqueue(Arc::clone(task));
                        return;
                    }
                }
                // Runnable / Running：已在队中或尚未停靠；Dead：忽略
                _ => return,
            }
        }
    }

    // ========================================================================
    // 定时器
    // ========================================================================

    /// 当前任务睡眠 d 纳秒
    pub fn sleep_current_ns(&self, d: u64) {
        match current_task() {
            Some(task) if current_worker_index() >= 0 => {
                let when = os::time::monotonic_now_ns().saturating_add(d);
                let mut timers = self.timers.lock();
                self.park_begin(&task, WaitReason::Sleep);
                timers.push(when, TimerKind::WakeTask(Arc::clone(&task)));
                drop(timers);
                self.wake_one_idle();
                self.park_commit();
            }
            _ => os::time::sleep_os_ns(d),
        }
    }

    /// 返回 d 纳秒后收到时间戳的一次性 channel
    pub fn after_ns(&self, d: u64) -> Arc<Channel> {
        let ch = Channel::new(8, 1);
        let when = os::time::monotonic_now_ns().saturating_add(d);
        self.timers.lock().push(when, TimerKind::ChanPing(Arc::clone(&ch)));
        self.wake_one_idle();
        ch
    }

    /// 弹出并执行到期定时器，返回执行个数
    pub(crate) fn fire_due_timers(&self) -> usize {
        let now = os::time::monotonic_now_ns();
        let due = {
            let mut timers = self.timers.lock();
            if timers.next_deadline().map_or(true, |w| w > now) {
                return 0;
            }
            timers.pop_due(now)
        };
        let n = due.len();
        for entry in due {
            match entry.kind {
                TimerKind::WakeTask(task) => self.ready(&task),
                TimerKind::ChanPing(ch) => ch.timer_ping(),
            }
        }
        n
    }

    pub(crate) fn next_timer_deadline(&self) -> Option<u64> {
        self.timers.lock().next_deadline()
    }

    // ========================================================================
    // 停世界汇合
    // ========================================================================

    #[inline]
    pub fn stop_world(&self) -> bool {
        self.stop_world.load(Ordering::Acquire)
    }

    /// 需要静默的 worker 数（收集者自己占用的 worker 除外）
    fn rendezvous_target(&self) -> usize {
        let on_worker = current_worker_index() >= 0;
        self.workers.len() - usize::from(on_worker)
    }

    /// 停世界：升旗、唤醒空闲 worker、等待全部静默
    ///
    /// 调用者必须持有 gc_mu。
    pub(crate) fn stop_the_world(&self) {
        let target = self.rendezvous_target();
        self.stop_world.store(true, Ordering::Release);
        for w in &self.workers {
            w.note.wakeup();
        }
        for _ in 0..target {
            self.gc_stop_sema.acquire();
        }
    }

    /// 恢复世界：落旗、放行静默的 worker
    pub(crate) fn start_the_world(&self) {
        let target = self.rendezvous_target();
        self.stop_world.store(false, Ordering::Release);
        if target > 0 {
            self.gc_resume_sema.release(target as i64);
        }
    }

    // ========================================================================
    // 杂项
    // ========================================================================

    /// 调度器级伪随机数（xorshift64）
    pub(crate) fn next_rand(&self) -> u64 {
        let mut x = self.rand_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rand_state.store(x, Ordering::Relaxed);
        x
    }

    /// 打印所有任务的状态（panic 终结时的转储）
    pub fn dump(&self) {
        eprintln!("tasks: {} live", self.task_count());
        for entry in self.tasks.iter() {
            let t = entry.value();
            eprintln!(
                "  task {}: {:?} wait={:?} worker={}",
                t.id,
                t.status(),
                t.wait_reason(),
                t.worker()
            );
        }
    }

    /// 获取调度统计信息
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            task_count: self.task_count(),
            runq_len: self.runq.len(),
            idle_workers: self.idle.lock().len(),
            timer_count: self.timers.lock().len(),
            worker_sched_counts: self.workers.iter().map(|w| w.sched_count()).collect(),
        }
    }
}
