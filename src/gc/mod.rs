//! 垃圾收集器
//!
//! Stop-the-world、非分代、非移动的标记-清除。阶段：
//! 1. 汇合：worker 在安全点静默并刷回分配器缓存
//! 2. 标记：根 = 手工根 + 静态区间 + 全部任务栈（[保存的 sp, 栈顶)
//!    与寄存器文件的保守扫描）；堆内按类型描述符精确追指针，
//!    无描述符的 scan 对象整体保守
//! 3. finalizer 扫描：未标记且带 finalizer 位的对象复活一轮并入队
//! 4. 清扫：位图回收，空 span 归还页堆，标记位顺带清除
//!
//! 触发：自上轮以来的分配字节数达到阈值（活跃字节 × 触发比，
//! 比值可由 ZLANG_GC_RATIO 调整）；或显式 collect_now。STW 保证
//! 标记期间写集为空，不需要写屏障。

pub mod finalizer;

pub use finalizer::{install_finalizer, remove_finalizer};

use crate::config::{self, GC_MIN_TRIGGER};
use crate::mem::with_heap;
use crate::os;
use crate::sched::{current_task, get_scheduler, try_get_scheduler};
use crate::task::context::{ctx_save, TaskContext};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// 自上轮收集以来的分配字节
static ALLOC_SINCE: AtomicUsize = AtomicUsize::new(0);
/// 下一次触发阈值
static NEXT_TRIGGER: AtomicUsize = AtomicUsize::new(GC_MIN_TRIGGER);
/// 收集轮数
static CYCLES: AtomicU64 = AtomicU64::new(0);

/// 手工根与静态区间（嵌入方与测试用）
struct Roots {
    manual: Vec<usize>,
    ranges: Vec<(usize, usize)>,
}

static ROOTS: OnceLock<Mutex<Roots>> = OnceLock::new();

fn roots() -> &'static Mutex<Roots> {
    ROOTS.get_or_init(|| {
        Mutex::new(Roots {
            manual: Vec::new(),
            ranges: Vec::new(),
        })
    })
}

/// 登记一个手工根
pub fn add_root(ptr: *const u8) {
    if ptr.is_null() {
        return;
    }
    roots().lock().manual.push(ptr as usize);
}

/// 移除一个手工根
pub fn remove_root(ptr: *const u8) {
    let addr = ptr as usize;
    roots().lock().manual.retain(|&p| p != addr);
}

/// 登记一段静态数据区间（逐字保守扫描）
pub fn register_static(begin: *const u8, end: *const u8) {
    if begin.is_null() || end <= begin {
        return;
    }
    roots().lock().ranges.push((begin as usize, end as usize));
}

/// 记账一次分配（分配入口调用）
pub(crate) fn note_alloc(bytes: usize) {
    ALLOC_SINCE.fetch_add(bytes, Ordering::Relaxed);
}

/// 收集轮数
pub fn cycles() -> u64 {
    CYCLES.load(Ordering::Relaxed)
}

/// 阈值触发检查；正在收集时让路，不阻塞在收集锁上
pub(crate) fn maybe_collect() {
    if ALLOC_SINCE.load(Ordering::Relaxed) < NEXT_TRIGGER.load(Ordering::Relaxed) {
        return;
    }
    let sched = get_scheduler();
    if let Some(guard) = sched.gc_mu.try_lock() {
        collect_locked(&guard);
    }
    // try_lock 失败：别人正在收集，本次触发由它消化
}

/// 显式收集入口
///
/// 等待进行中的收集完成后自己跑一轮。等待用让出而不是阻塞，
/// 避免 worker 在停世界汇合前卡死在收集锁上。
pub fn collect_now() {
    let sched = get_scheduler();
    loop {
        if let Some(guard) = sched.gc_mu.try_lock() {
            collect_locked(&guard);
            return;
        }
        crate::sched::yield_now();
    }
}

fn collect_locked(_gc_guard: &parking_lot::MutexGuard<'_, ()>) {
    let sched = get_scheduler();
    let start = os::time::monotonic_now_ns();

    sched.stop_the_world();

    // 缓存刷回：世界已停，逐个 worker 清空（worker 静默时也会自刷，幂等）
    for w in &sched.workers {
        w.cache.lock().flush();
    }

    let (live_before, freed, live_after) = with_heap(|h| {
        let live_before = h.stats.live_bytes;
        mark(h);
        let fin_work = finalizer::scan_unmarked(h);
        let freed = h.sweep();
        h.stats.collections += 1;
        finalizer::stash_pending(fin_work);
        (live_before, freed, h.stats.live_bytes)
    });

    let ratio = config::gc_ratio();
    let next = live_after.saturating_mul(ratio).max(GC_MIN_TRIGGER);
    NEXT_TRIGGER.store(next, Ordering::Relaxed);
    ALLOC_SINCE.store(0, Ordering::Relaxed);
    CYCLES.fetch_add(1, Ordering::Relaxed);

    sched.start_the_world();

    // 世界恢复后再调度 finalizer 任务
    finalizer::kick();

    if config::env_bool("ZLANG_GC_TRACE", false) {
        let dur_us = (os::time::monotonic_now_ns() - start) / 1000;
        eprintln!(
            "gc {}: {}KB -> {}KB, freed {} objs {}KB, {}us",
            cycles(),
            live_before / 1024,
            live_after / 1024,
            freed.objects,
            freed.bytes / 1024,
            dur_us,
        );
    }
}

/// 标记阶段
fn mark(h: &mut crate::mem::Heap) {
    let mut work: Vec<usize> = Vec::with_capacity(256);

    // finalizer 待办队列里的对象必须活到回调执行
    finalizer::queue_roots(&mut work);

    // 手工根与静态区间
    {
        let r = roots().lock();
        work.extend_from_slice(&r.manual);
        for &(begin, end) in &r.ranges {
            let mut p = begin;
            while p + std::mem::size_of::<usize>() <= end {
                let word = unsafe { (p as *const usize).read_unaligned() };
                work.push(word);
                p += std::mem::size_of::<usize>();
            }
        }
    }

    // 任务栈与寄存器文件：世界已停，所有任务的 sp 都已保存；
    // 唯一例外是收集者自己的任务，用 ctx_save 取此刻的寄存器与 sp
    if let Some(sched) = try_get_scheduler() {
        let collector = current_task();
        for entry in sched.tasks.iter() {
            let task = entry.value();
            if task.is_dead() {
                continue;
            }
            if let Some(cur) = &collector {
                if cur.id == task.id {
                    continue;
                }
            }
            if let Some((sp, top)) = task.stack_scan_range() {
                scan_words(sp, top, &mut work);
            }
            let ctx = unsafe { &*task.ctx.get() };
            work.extend_from_slice(ctx.words());
        }
        if let Some(cur) = collector {
            let mut ctx = TaskContext::new();
            unsafe {
                ctx_save(&mut ctx);
            }
            let sp = ctx.sp as usize;
            let top = {
                let stack = cur.stack.lock();
                stack.as_ref().map(|s| s.top() as usize)
            };
            if let Some(top) = top {
                if sp < top {
                    scan_words(sp, top, &mut work);
                }
            }
            work.extend_from_slice(ctx.words());
        }
    }

    // 灰对象工作队列排空
    while let Some(addr) = work.pop() {
        h.mark_candidate(addr, &mut work);
    }
}

fn scan_words(lo: usize, hi: usize, work: &mut Vec<usize>) {
    let word = std::mem::size_of::<usize>();
    let mut p = lo & !(word - 1);
    if p < lo {
        p += word;
    }
    while p + word <= hi {
        let v = unsafe { (p as *const usize).read() };
        work.push(v);
        p += word;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{alloc, AllocFlags};

    #[test]
    fn test_rooted_object_survives() {
        let _gc = crate::test_support::gc_guard();
        let p = alloc(40, AllocFlags::empty());
        add_root(p);
        collect_now();
        assert!(with_heap(|h| h.contains_object(p as usize)));
        collect_now();
        assert!(with_heap(|h| h.contains_object(p as usize)));
        remove_root(p);
    }

    #[test]
    fn test_reachable_chain_survives() {
        let _gc = crate::test_support::gc_guard();
        static DESC: crate::mem::TypeDesc = crate::mem::TypeDesc::new(24, 8, &[0]);
        let child = alloc(16, AllocFlags::NO_POINTERS);
        let parent = crate::mem::alloc_typed(&DESC);
        unsafe {
            *(parent as *mut usize) = child as usize;
        }
        add_root(parent);
        collect_now();
        assert!(with_heap(|h| h.contains_object(parent as usize)));
        assert!(with_heap(|h| h.contains_object(child as usize)));
        remove_root(parent);
    }

    #[test]
    fn test_trigger_threshold_updates() {
        let _gc = crate::test_support::gc_guard();
        collect_now();
        let t = NEXT_TRIGGER.load(Ordering::Relaxed);
        assert!(t >= GC_MIN_TRIGGER);
    }

    #[test]
    fn test_collect_from_task() {
        let _gc = crate::test_support::gc_guard();
        let sched = crate::sched::get_scheduler();
        let handle = sched.spawn(Box::new(|| {
            let p = alloc(64, AllocFlags::empty());
            add_root(p);
            collect_now();
            assert!(with_heap(|h| h.contains_object(p as usize)));
            remove_root(p);
        }));
        handle.join();
    }
}
