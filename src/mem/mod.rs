//! 分配器
//!
//! 两级结构：每-worker 缓存（cache）在上，共享页堆（heap）在下。
//! 小的无指针对象走缓存快路径；其余在堆锁下按尺寸类分配；大对象
//! 独占整 span。分配入口是安全点，也是 GC 触发点。

pub mod cache;
pub mod class;
pub mod heap;
pub mod span;

pub use class::SMALL_CUTOFF;
pub use heap::{Heap, HeapStats, SweepStats};
pub use span::{Span, TypeDesc};

pub(crate) use heap::with_heap;

use bitflags::bitflags;

bitflags! {
    /// 分配标志位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// 对象不含指针，GC 不扫描其内容
        const NO_POINTERS = 1 << 0;
        /// 调用者自行初始化，跳过清零
        const NO_ZERO = 1 << 1;
        /// 跳过分配采样
        const NO_PROFILE = 1 << 2;
    }
}

/// 分配 size 字节
///
/// 默认清零；OOM 时强制一次收集重试，再失败按规格 panic。
pub fn alloc(size: usize, flags: AllocFlags) -> *mut u8 {
    alloc_desc(size, flags, None)
}

/// 按类型描述符分配（清零，GC 精确扫描）
pub fn alloc_typed(desc: &'static TypeDesc) -> *mut u8 {
    alloc_desc(desc.size, AllocFlags::empty(), Some(desc))
}

/// 分配入口
pub fn alloc_desc(
    size: usize,
    flags: AllocFlags,
    desc: Option<&'static TypeDesc>,
) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }
    crate::sched::safepoint();
    crate::gc::note_alloc(size);
    crate::gc::maybe_collect();

    // 快路径：小的无指针对象从本 worker 缓存取
    if size <= SMALL_CUTOFF && flags.contains(AllocFlags::NO_POINTERS) && desc.is_none() {
        if let Some(ptr) = cache_alloc(size, !flags.contains(AllocFlags::NO_ZERO)) {
            return ptr;
        }
    }

    match with_heap(|h| h.alloc(size, flags, desc)) {
        Ok((ptr, _)) => ptr,
        Err(_) => {
            // 先收集一次再试
            crate::gc::collect_now();
            match with_heap(|h| h.alloc(size, flags, desc)) {
                Ok((ptr, _)) => ptr,
                Err(_) => crate::task::panic::panic_str("runtime: out of memory"),
            }
        }
    }
}

fn cache_alloc(size: usize, zero: bool) -> Option<*mut u8> {
    let widx = crate::sched::worker_index_for_cache()?;
    let sched = crate::sched::try_get_scheduler()?;
    let worker = sched.workers.get(widx)?;
    let mut cache = worker.cache.lock();
    cache.alloc(size, zero)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_zero_size() {
        let _gc = crate::test_support::gc_guard();
        assert!(alloc(0, AllocFlags::empty()).is_null());
    }

    #[test]
    fn test_alloc_returns_zeroed() {
        let _gc = crate::test_support::gc_guard();
        let p = alloc(64, AllocFlags::empty());
        assert!(!p.is_null());
        unsafe {
            for i in 0..64 {
                assert_eq!(*p.add(i), 0);
            }
        }
    }

    #[test]
    fn test_alloc_typed_has_desc() {
        let _gc = crate::test_support::gc_guard();
        static DESC: TypeDesc = TypeDesc::new(24, 8, &[8]);
        let p = alloc_typed(&DESC);
        assert!(!p.is_null());
        assert!(with_heap(|h| h.contains_object(p as usize)));
    }

    #[test]
    fn test_alloc_no_pointers_flag() {
        let _gc = crate::test_support::gc_guard();
        let p = alloc(128, AllocFlags::NO_POINTERS);
        assert!(!p.is_null());
        assert!(with_heap(|h| h.contains_object(p as usize)));
    }
}
