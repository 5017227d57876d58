//! finalizer 注册表
//!
//! 对象地址 → (回调, 返回区大小) 的哈希表。键列不作为 GC 根：
//! 仅有登记不会让对象存活。收集的标记阶段结束后遍历表，未标记
//! 且带 finalizer 位的对象复活一轮并移入工作队列；队列里的待办
//! 地址在下一轮标记中作为根，保证回调执行前对象不被回收。专用
//! finalizer 任务排空队列；回调 panic 传播到该任务的终结器（除非
//! 回调内 recover，否则进程退出）。
//!
//! 在非堆指针上安装、或未先移除就重复安装，都是致命错误。

use crate::mem::{with_heap, Heap};
use crate::sched::{current_task, get_scheduler};
use crate::task::{Task, WaitReason};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// 表项
struct FinEntry {
    callback: Box<dyn FnOnce(*mut u8) + Send>,
    /// 回调返回区大小（编译器 ABI 记录，调用时据此预留）
    ret_size: usize,
}

/// 待执行的 finalizer
pub(crate) struct FinWork {
    addr: usize,
    callback: Box<dyn FnOnce(*mut u8) + Send>,
    ret_size: usize,
}

static TABLE: OnceLock<Mutex<HashMap<usize, FinEntry>>> = OnceLock::new();
static QUEUE: OnceLock<Mutex<VecDeque<FinWork>>> = OnceLock::new();
static FIN_TASK: OnceLock<Mutex<Option<Arc<Task>>>> = OnceLock::new();
static FIN_STARTED: AtomicBool = AtomicBool::new(false);

fn table() -> &'static Mutex<HashMap<usize, FinEntry>> {
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn queue() -> &'static Mutex<VecDeque<FinWork>> {
    QUEUE.get_or_init(|| Mutex::new(VecDeque::new()))
}

fn fin_task_slot() -> &'static Mutex<Option<Arc<Task>>> {
    FIN_TASK.get_or_init(|| Mutex::new(None))
}

enum InstallCheck {
    Ok,
    NotHeap,
    Double,
}

/// 给堆对象登记 finalizer
///
/// obj 必须指向存活的堆对象；重复登记（未先移除）是致命错误。
pub fn install_finalizer(
    obj: *mut u8,
    callback: Box<dyn FnOnce(*mut u8) + Send>,
    ret_size: usize,
) {
    if obj.is_null() {
        crate::diag::rt_fatal("finalizer on nil pointer");
    }
    let addr = obj as usize;
    let check = with_heap(|h| {
        if !h.contains_object(addr) {
            return InstallCheck::NotHeap;
        }
        if h.has_finalizer_bit(addr) {
            return InstallCheck::Double;
        }
        h.set_finalizer_bit(addr, true);
        InstallCheck::Ok
    });
    match check {
        InstallCheck::NotHeap => crate::diag::rt_fatal("finalizer on non-heap pointer"),
        InstallCheck::Double => crate::diag::rt_fatal("finalizer already installed"),
        InstallCheck::Ok => {}
    }
    table().lock().insert(addr, FinEntry { callback, ret_size });
    ensure_task();
}

/// 移除 finalizer；有登记则返回 true
pub fn remove_finalizer(obj: *mut u8) -> bool {
    let addr = obj as usize;
    let removed = table().lock().remove(&addr).is_some();
    if removed {
        with_heap(|h| {
            h.set_finalizer_bit(addr, false);
        });
    }
    removed
}

/// 登记的 finalizer 数量（诊断用）
pub fn pending_count() -> usize {
    table().lock().len() + queue().lock().len()
}

// ============================================================================
// 收集器接口（STW 期间调用）
// ============================================================================

/// 标记结束后遍历表：未标记的登记对象复活一轮、清位、移入待办
pub(crate) fn scan_unmarked(h: &mut Heap) -> Vec<FinWork> {
    let mut tab = table().lock();
    if tab.is_empty() {
        return Vec::new();
    }
    let targets: Vec<usize> = tab
        .keys()
        .copied()
        .filter(|&addr| h.unmarked_with_finalizer(addr))
        .collect();

    let mut out = Vec::with_capacity(targets.len());
    let mut work = Vec::new();
    for addr in targets {
        let entry = tab.remove(&addr).expect("entry exists");
        // 复活：对象连同其可达子图活过本轮清扫
        h.mark_candidate(addr, &mut work);
        while let Some(p) = work.pop() {
            h.mark_candidate(p, &mut work);
        }
        // 清位：下一轮未标记时正常回收
        h.set_finalizer_bit(addr, false);
        out.push(FinWork {
            addr,
            callback: entry.callback,
            ret_size: entry.ret_size,
        });
    }
    out
}

/// 把本轮扫出的待办并入队列（仍在 STW 中，世界恢复后 kick）
pub(crate) fn stash_pending(work: Vec<FinWork>) {
    if work.is_empty() {
        return;
    }
    queue().lock().extend(work);
}

/// 队列中待办对象的地址作为根（回调执行前对象必须存活）
pub(crate) fn queue_roots(out: &mut Vec<usize>) {
    for w in queue().lock().iter() {
        out.push(w.addr);
    }
}

/// 世界恢复后唤醒 finalizer 任务
///
/// 任务刚生成、句柄尚未入槽的窗口里直接跳过：新任务起步就排
/// 队列，待办不会丢。
pub(crate) fn kick() {
    if queue().lock().is_empty() {
        return;
    }
    ensure_task();
    let slot = fin_task_slot().lock();
    if let Some(task) = slot.as_ref() {
        get_scheduler().ready(task);
    }
}

/// 懒生成专用 finalizer 任务
///
/// spawn 过程中不持有槽锁：spawn 内部的安全点可能让出，
/// 持锁让出会把其他安装者的 worker 卡在锁上。
fn ensure_task() {
    if FIN_STARTED.swap(true, Ordering::AcqRel) {
        return;
    }
    let handle = get_scheduler().spawn(Box::new(fin_loop));
    *fin_task_slot().lock() = Some(Arc::clone(&handle.task));
}

/// finalizer 任务主循环：排空队列，空了停靠等 kick
fn fin_loop() {
    let sched = get_scheduler();
    loop {
        let work = {
            let mut q = queue().lock();
            match q.pop_front() {
                Some(w) => Some(w),
                None => {
                    let cur = match current_task() {
                        Some(t) => t,
                        None => crate::diag::rt_fatal("finalizer loop outside task"),
                    };
                    sched.park_begin(&cur, WaitReason::Finalizer);
                    None
                }
            }
        };
        match work {
            Some(w) => {
                debug_assert!(w.ret_size < (1 << 20));
                let ptr = w.addr as *mut u8;
                (w.callback)(ptr);
            }
            None => sched.park_commit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::collect_now;
    use crate::mem::{alloc, AllocFlags};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_finalizer_runs_exactly_once() {
        let _gc = crate::test_support::gc_guard();
        // 主线程栈不在根集内：不加根即不可达
        let p = alloc(56, AllocFlags::NO_POINTERS);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        install_finalizer(
            p,
            Box::new(move |_obj| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );

        collect_now(); // 第一轮：复活 + 入队
        collect_now(); // 第二轮：回收
        assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1));

        collect_now();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalizer_sees_object_contents() {
        let _gc = crate::test_support::gc_guard();
        let p = alloc(16, AllocFlags::NO_POINTERS);
        unsafe {
            *(p as *mut u64) = 0xFEED;
        }
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = Arc::clone(&seen);
        install_finalizer(
            p,
            Box::new(move |obj| {
                let v = unsafe { *(obj as *const u64) };
                seen2.store(v, Ordering::SeqCst);
            }),
            8,
        );
        collect_now();
        assert!(wait_until(|| seen.load(Ordering::SeqCst) == 0xFEED));
    }

    #[test]
    fn test_remove_finalizer_cancels() {
        let _gc = crate::test_support::gc_guard();
        let p = alloc(32, AllocFlags::NO_POINTERS);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        install_finalizer(
            p,
            Box::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );
        assert!(remove_finalizer(p));
        assert!(!remove_finalizer(p));

        collect_now();
        collect_now();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rooted_object_not_finalized() {
        let _gc = crate::test_support::gc_guard();
        let p = alloc(48, AllocFlags::NO_POINTERS);
        crate::gc::add_root(p);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        install_finalizer(
            p,
            Box::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );
        collect_now();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // 去根后才触发
        crate::gc::remove_root(p);
        collect_now();
        assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1));
    }
}
