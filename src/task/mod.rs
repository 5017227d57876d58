//! 任务 (Task) 模块
//!
//! 任务是调度的基本单位：一段独立的栈 + 保存的寄存器文件 +
//! panic/defer 链。任务由 spawn 创建，入口函数返回后销毁，
//! 栈回收进空闲栈缓存。
//!
//! - stack：连续栈与空闲栈缓存
//! - context：寄存器文件与汇编切换
//! - panic：defer / panic / recover

pub mod context;
pub mod panic;
pub mod stack;

pub use context::TaskContext;
pub use stack::{StackOverflow, StackPool, TaskStack};

use crate::sync::Note;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

/// 任务 ID 类型
pub type TaskId = u64;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// 可运行，等待被调度
    Runnable = 0,
    /// 正在 worker 上执行
    Running = 1,
    /// 正在停靠（已宣布阻塞、尚未完成切出）
    Parking = 2,
    /// 阻塞等待唤醒
    Waiting = 3,
    /// 已结束
    Dead = 4,
}

impl From<u8> for TaskStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => TaskStatus::Runnable,
            1 => TaskStatus::Running,
            2 => TaskStatus::Parking,
            3 => TaskStatus::Waiting,
            _ => TaskStatus::Dead,
        }
    }
}

/// 等待原因（调试与任务转储用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// 等待 channel 发送
    ChannelSend,
    /// 等待 channel 接收
    ChannelRecv,
    /// select 多路等待
    Select,
    /// 定时睡眠
    Sleep,
    /// finalizer 任务等待工作
    Finalizer,
}

/// 任务
pub struct Task {
    /// 任务唯一 ID
    pub id: TaskId,
    /// 状态（原子操作）
    status: AtomicU8,
    /// park/ready 握手标志：唤醒者发现任务还在 Parking 时置位
    park_ready: AtomicBool,
    /// 防重复入队标志
    pub(crate) on_runq: AtomicBool,
    /// 保存的寄存器文件；持有者为运行它的 worker（或 STW 期间的收集者）
    pub(crate) ctx: UnsafeCell<TaskContext>,
    /// 任务栈；死亡后被 worker 取走回收
    pub(crate) stack: Mutex<Option<TaskStack>>,
    /// 入口闭包，首次运行时取走
    entry: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    /// 正在运行它的 worker id（-1 表示未在运行）
    worker: AtomicI64,
    /// 等待原因
    wait_reason: Mutex<Option<WaitReason>>,
    /// panic / defer 链
    pub(crate) panic_state: Mutex<panic::PanicState>,
    /// 结束通知（join 用）
    pub(crate) join_note: Arc<Note>,
}

// ctx/stack 的访问由调度协议约束：同一时刻只有运行它的 worker
// 或停世界期间的收集者触碰
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    /// 创建新任务（状态 Runnable，上下文待 init_context 填写）
    pub fn new(
        id: TaskId,
        entry: Box<dyn FnOnce() + Send + 'static>,
        stack: TaskStack,
    ) -> Self {
        Self {
            id,
            status: AtomicU8::new(TaskStatus::Runnable as u8),
            park_ready: AtomicBool::new(false),
            on_runq: AtomicBool::new(false),
            ctx: UnsafeCell::new(TaskContext::new()),
            stack: Mutex::new(Some(stack)),
            entry: Mutex::new(Some(entry)),
            worker: AtomicI64::new(-1),
            wait_reason: Mutex::new(None),
            panic_state: Mutex::new(panic::PanicState::new()),
            join_note: Arc::new(Note::new()),
        }
    }

    /// 初始化执行上下文：入口蹦床 + 任务指针
    ///
    /// 必须在任务入队之前调用一次。
    pub(crate) fn init_context(self: &Arc<Self>) {
        let top = {
            let stack = self.stack.lock();
            stack.as_ref().expect("task has stack").top()
        };
        let arg = Arc::as_ptr(self) as usize;
        unsafe {
            (*self.ctx.get()).init(top, arg);
        }
    }

    /// 获取任务状态
    #[inline]
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from(self.status.load(Ordering::Acquire))
    }

    /// 设置任务状态
    #[inline]
    pub fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// 尝试把状态从 expected 改为 new
    #[inline]
    pub fn cas_status(&self, expected: TaskStatus, new: TaskStatus) -> bool {
        self.status
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.status() == TaskStatus::Dead
    }

    /// park/ready 握手：置位并返回旧值
    #[inline]
    pub(crate) fn set_park_ready(&self) -> bool {
        self.park_ready.swap(true, Ordering::AcqRel)
    }

    /// park/ready 握手：消费标志
    #[inline]
    pub(crate) fn take_park_ready(&self) -> bool {
        self.park_ready.swap(false, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn clear_park_ready(&self) {
        self.park_ready.store(false, Ordering::Release);
    }

    /// 记录当前 worker
    #[inline]
    pub(crate) fn set_worker(&self, id: i64) {
        self.worker.store(id, Ordering::Release);
    }

    #[inline]
    pub fn worker(&self) -> i64 {
        self.worker.load(Ordering::Acquire)
    }

    /// 设置等待原因
    pub(crate) fn set_wait_reason(&self, reason: Option<WaitReason>) {
        *self.wait_reason.lock() = reason;
    }

    pub fn wait_reason(&self) -> Option<WaitReason> {
        *self.wait_reason.lock()
    }

    /// 取走入口闭包（只成功一次）
    pub(crate) fn take_entry(&self) -> Option<Box<dyn FnOnce() + Send + 'static>> {
        self.entry.lock().take()
    }

    /// 栈顶与保存的 sp（GC 扫描用；仅 STW 期间对非运行任务调用）
    pub(crate) fn stack_scan_range(&self) -> Option<(usize, usize)> {
        let stack = self.stack.lock();
        let stack = stack.as_ref()?;
        let top = stack.top() as usize;
        let sp = unsafe { (*self.ctx.get()).sp } as usize;
        if sp == 0 || sp >= top || sp <= stack.base() as usize {
            return None;
        }
        Some((sp, top))
    }

    /// 序言栈检查失败时的增长入口（编译器契约）
    pub fn stack_grow(&self) -> Result<(), StackOverflow> {
        let mut stack = self.stack.lock();
        match stack.as_mut() {
            Some(s) => s.grow(),
            None => Err(StackOverflow),
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("worker", &self.worker())
            .finish()
    }
}

/// 任务入口（由汇编蹦床以 C 约定调用）
///
/// 运行入口闭包后进入调度器的退出路径，永不返回。
pub(crate) extern "C" fn task_entry_raw(arg: *mut core::ffi::c_void) -> ! {
    let task_ptr = arg as *const Task;
    {
        let task = unsafe { &*task_ptr };
        match task.take_entry() {
            Some(f) => panic::run_task_body(task, f),
            None => crate::diag::rt_fatal("task started without entry"),
        }
    }
    crate::sched::task_exit();
}
