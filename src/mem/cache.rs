//! 每-worker 分配器缓存
//!
//! 每个 worker 为每个小尺寸类持有一条空闲指针表，分配时弹出，
//! 空了再批量从共享堆补充。只缓存 noscan 通道（无指针对象不需要
//! 记录类型描述符）。GC 汇合时全量刷回共享堆。

use crate::config::CACHE_REFILL_BATCH;

use super::class::{build_size_classes, size_class_for, SMALL_CUTOFF};
use super::heap::with_heap;

/// worker 私有缓存
pub struct WorkerCache {
    /// 每尺寸类一条空闲表
    lists: Vec<Vec<*mut u8>>,
    classes: Vec<usize>,
}

// 缓存只被持有它的 worker（或 STW 期间的收集者）访问
unsafe impl Send for WorkerCache {}

impl WorkerCache {
    pub fn new() -> Self {
        let classes = build_size_classes();
        let lists = (0..classes.len()).map(|_| Vec::new()).collect();
        Self { lists, classes }
    }

    /// 从缓存取一个 size 字节的无指针对象；补充失败返回 None
    pub fn alloc(&mut self, size: usize, zero: bool) -> Option<*mut u8> {
        debug_assert!(size > 0 && size <= SMALL_CUTOFF);
        let class_index = size_class_for(&self.classes, size);
        if self.lists[class_index].is_empty() {
            let list = &mut self.lists[class_index];
            let got = with_heap(|h| h.refill_cache(class_index, list, CACHE_REFILL_BATCH));
            match got {
                Ok(n) if n > 0 => {}
                _ => return None,
            }
        }
        let ptr = self.lists[class_index].pop()?;
        if zero {
            unsafe {
                std::ptr::write_bytes(ptr, 0, self.classes[class_index]);
            }
        }
        Some(ptr)
    }

    /// 把全部缓存槽刷回共享堆（GC 汇合时调用）
    pub fn flush(&mut self) {
        let mut any = false;
        for list in &self.lists {
            if !list.is_empty() {
                any = true;
                break;
            }
        }
        if !any {
            return;
        }
        with_heap(|h| {
            for list in &mut self.lists {
                for ptr in list.drain(..) {
                    h.free_slot_ptr(ptr);
                }
            }
        });
    }

    /// 缓存中的对象总数（诊断用）
    pub fn cached(&self) -> usize {
        self.lists.iter().map(|l| l.len()).sum()
    }
}

impl Default for WorkerCache {
    fn default() -> Self {
        Self::new()
    }
}
