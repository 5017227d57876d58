//! 共享页堆
//!
//! 把地址空间划分为段（一次向 OS 保留/提交 1MB），段内按页切出
//! span。页号 → span 的边表让任意堆指针 O(1) 反查所属对象。空闲
//! 页段首次适应分配、相邻合并；全空 span 连续多轮未用后把物理页
//! 还给 OS。整个堆一把锁，持锁时间 O(1)～O(span)。

use crate::config::{PAGE_SIZE, SEGMENT_PAGES, SPAN_RELEASE_SWEEPS};
use crate::os::page::{self, PageError};
use crate::sync::Lock;
use std::cell::UnsafeCell;
use std::sync::OnceLock;

use super::class::{align_up, build_size_classes, size_class_for, SMALL_CUTOFF};
use super::span::{Span, TypeDesc};
use super::AllocFlags;

const SPAN_NONE: usize = usize::MAX;

/// 段内空闲页段
struct PageRun {
    start: usize,
    len: usize,
}

/// 段：一次保留/提交的连续区域，页从这里切给 span
struct Segment {
    data: *mut u8,
    len: usize,
    /// 页号 → span id；SPAN_NONE 表示空闲
    page_map: Vec<usize>,
    /// 尚未切出的页的起点
    next_page: usize,
    free_runs: Vec<PageRun>,
}

impl Segment {
    fn new(pages: usize) -> Result<Self, PageError> {
        let bytes = pages * PAGE_SIZE;
        let data = page::reserve(bytes);
        page::commit(data, bytes)?;
        Ok(Self {
            data,
            len: bytes,
            page_map: vec![SPAN_NONE; pages],
            next_page: 0,
            free_runs: Vec::new(),
        })
    }

    fn base(&self) -> usize {
        self.data as usize
    }

    fn page_count(&self) -> usize {
        self.page_map.len()
    }

    /// 首次适应取页；空闲段不够则用段尾未切出的部分
    fn alloc_pages(&mut self, pages: usize) -> Option<usize> {
        if pages == 0 {
            return None;
        }
        for i in 0..self.free_runs.len() {
            if self.free_runs[i].len >= pages {
                let start = self.free_runs[i].start;
                self.free_runs[i].start += pages;
                self.free_runs[i].len -= pages;
                if self.free_runs[i].len == 0 {
                    self.free_runs.swap_remove(i);
                }
                return Some(start);
            }
        }
        if self.next_page + pages <= self.page_count() {
            let start = self.next_page;
            self.next_page += pages;
            return Some(start);
        }
        None
    }

    /// 归还页并合并相邻空闲段
    fn free_pages(&mut self, start: usize, pages: usize) {
        if pages == 0 {
            return;
        }
        self.free_runs.push(PageRun { start, len: pages });
        self.free_runs.sort_by_key(|r| r.start);
        let mut merged: Vec<PageRun> = Vec::with_capacity(self.free_runs.len());
        for run in self.free_runs.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.start + last.len == run.start {
                    last.len += run.len;
                    continue;
                }
            }
            merged.push(run);
        }
        self.free_runs = merged;
    }

    fn map_span(&mut self, span_id: usize, start_page: usize, pages: usize) {
        for p in start_page..start_page + pages {
            self.page_map[p] = span_id;
        }
    }

    fn unmap_span(&mut self, start_page: usize, pages: usize) {
        for p in start_page..start_page + pages {
            self.page_map[p] = SPAN_NONE;
        }
    }
}

/// 按基址排序的段区间索引（二分查找指针归属）
struct SegmentRange {
    base: usize,
    end: usize,
    index: usize,
}

/// 堆统计
#[derive(Debug, Default)]
pub struct HeapStats {
    pub collections: u64,
    pub total_allocs: u64,
    pub total_frees: u64,
    pub total_alloc_bytes: usize,
    pub total_freed_bytes: usize,
    pub live_objects: usize,
    pub live_bytes: usize,
    /// 分配采样计数（NO_PROFILE 跳过）
    pub sample_count: u64,
    pub last_freed_objects: usize,
    pub last_freed_bytes: usize,
    pub segment_count: usize,
}

impl HeapStats {
    fn record_alloc(&mut self, bytes: usize, profiled: bool) {
        self.total_allocs += 1;
        self.total_alloc_bytes += bytes;
        self.live_objects += 1;
        self.live_bytes += bytes;
        if profiled {
            self.sample_count += 1;
        }
    }

    fn record_free(&mut self, bytes: usize) {
        self.total_frees += 1;
        self.total_freed_bytes += bytes;
        self.live_objects = self.live_objects.saturating_sub(1);
        self.live_bytes = self.live_bytes.saturating_sub(bytes);
    }
}

/// 清扫结果
#[derive(Debug, Default)]
pub struct SweepStats {
    pub objects: usize,
    pub bytes: usize,
}

/// 共享堆
pub struct Heap {
    segments: Vec<Segment>,
    ranges: Vec<SegmentRange>,
    pub(crate) spans: Vec<Option<Span>>,
    classes: Vec<usize>,
    /// 每尺寸类两条通道：[scan, noscan]
    class_spans: Vec<[Vec<usize>; 2]>,
    pub stats: HeapStats,
}

fn span_lane(has_pointers: bool) -> usize {
    if has_pointers {
        0
    } else {
        1
    }
}

impl Heap {
    pub fn new() -> Self {
        let classes = build_size_classes();
        let class_spans = (0..classes.len()).map(|_| [Vec::new(), Vec::new()]).collect();
        Self {
            segments: Vec::new(),
            ranges: Vec::new(),
            spans: Vec::new(),
            classes,
            class_spans,
            stats: HeapStats::default(),
        }
    }

    // ========================================================================
    // 分配
    // ========================================================================

    /// 分配一个对象；返回指针与实际占用字节数
    pub fn alloc(
        &mut self,
        size: usize,
        flags: AllocFlags,
        desc: Option<&'static TypeDesc>,
    ) -> Result<(*mut u8, usize), PageError> {
        debug_assert!(size > 0);
        let align = desc.map_or(8, |d| d.align.max(8));
        let alloc_size = align_up(size, align);
        let has_pointers = !flags.contains(AllocFlags::NO_POINTERS);

        let (ptr, bytes) = if alloc_size > SMALL_CUTOFF {
            self.alloc_large(alloc_size, desc, has_pointers)?
        } else {
            self.alloc_small(alloc_size, desc, has_pointers)?
        };

        if !flags.contains(AllocFlags::NO_ZERO) {
            unsafe {
                std::ptr::write_bytes(ptr, 0, bytes);
            }
        }
        self.stats
            .record_alloc(bytes, !flags.contains(AllocFlags::NO_PROFILE));
        Ok((ptr, bytes))
    }

    fn alloc_small(
        &mut self,
        alloc_size: usize,
        desc: Option<&'static TypeDesc>,
        has_pointers: bool,
    ) -> Result<(*mut u8, usize), PageError> {
        let class_index = size_class_for(&self.classes, alloc_size);
        let class_size = self.classes[class_index];
        let lane = span_lane(has_pointers);
        let span_id = self.take_span_for_class(class_index, lane)?;
        let span = self.spans[span_id].as_mut().expect("span exists");
        let (ptr, _) = span.alloc_slot(desc).expect("span has free slot");
        span.idle_sweeps = 0;
        let needs_list = span.has_free() && !span.in_class_list;
        if needs_list {
            span.in_class_list = true;
        }
        if needs_list {
            self.class_spans[class_index][lane].push(span_id);
        }
        Ok((ptr, class_size))
    }

    fn alloc_large(
        &mut self,
        alloc_size: usize,
        desc: Option<&'static TypeDesc>,
        has_pointers: bool,
    ) -> Result<(*mut u8, usize), PageError> {
        let pages = (alloc_size + PAGE_SIZE - 1) / PAGE_SIZE;
        let (segment, start_page, base) = self.alloc_pages(pages)?;
        let span_id = self.new_span_id();
        self.segments[segment].map_span(span_id, start_page, pages);
        let span = Span::new_large(base, segment, start_page, pages, desc, has_pointers);
        let bytes = span.span_bytes();
        self.spans[span_id] = Some(span);
        Ok((base, bytes))
    }

    fn new_span_id(&mut self) -> usize {
        self.spans.push(None);
        self.spans.len() - 1
    }

    /// 取一个有空槽的 span，没有就新切一个
    fn take_span_for_class(&mut self, class_index: usize, lane: usize) -> Result<usize, PageError> {
        loop {
            let span_id = match self.class_spans[class_index][lane].pop() {
                Some(id) => id,
                None => break,
            };
            if let Some(span) = self.spans.get_mut(span_id).and_then(|s| s.as_mut()) {
                span.in_class_list = false;
                if span.has_free() {
                    return Ok(span_id);
                }
            }
        }
        let class_size = self.classes[class_index];
        let (segment, start_page, base) = self.alloc_pages(1)?;
        let span_id = self.new_span_id();
        self.segments[segment].map_span(span_id, start_page, 1);
        let span = Span::new_small(
            base,
            segment,
            start_page,
            1,
            class_index,
            class_size,
            lane == 0,
        );
        self.spans[span_id] = Some(span);
        Ok(span_id)
    }

    /// 找（或新建）能满足页数的段
    fn alloc_pages(&mut self, pages: usize) -> Result<(usize, usize, *mut u8), PageError> {
        for (index, segment) in self.segments.iter_mut().enumerate() {
            if let Some(start_page) = segment.alloc_pages(pages) {
                let base = unsafe { segment.data.add(start_page * PAGE_SIZE) };
                return Ok((index, start_page, base));
            }
        }
        let new_pages = pages.max(SEGMENT_PAGES);
        let segment = Segment::new(new_pages)?;
        self.segments.push(segment);
        let index = self.segments.len() - 1;
        self.insert_range(index);
        self.stats.segment_count = self.segments.len();
        let segment = &mut self.segments[index];
        let start_page = segment.alloc_pages(pages).expect("new segment has space");
        let base = unsafe { segment.data.add(start_page * PAGE_SIZE) };
        Ok((index, start_page, base))
    }

    fn insert_range(&mut self, index: usize) {
        let base = self.segments[index].base();
        let end = base + self.segments[index].len;
        let pos = self
            .ranges
            .binary_search_by(|r| r.base.cmp(&base))
            .unwrap_or_else(|p| p);
        self.ranges.insert(pos, SegmentRange { base, end, index });
    }

    // ========================================================================
    // 指针反查
    // ========================================================================

    fn segment_index_for(&self, addr: usize) -> Option<usize> {
        let mut lo = 0;
        let mut hi = self.ranges.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let r = &self.ranges[mid];
            if addr < r.base {
                hi = mid;
            } else if addr >= r.end {
                lo = mid + 1;
            } else {
                return Some(r.index);
            }
        }
        None
    }

    /// 地址（含内部指针）→ (span id, 槽下标)
    pub fn find_object(&self, addr: usize) -> Option<(usize, usize)> {
        let seg_idx = self.segment_index_for(addr)?;
        let segment = &self.segments[seg_idx];
        let page = (addr - segment.base()) / PAGE_SIZE;
        let span_id = *segment.page_map.get(page)?;
        if span_id == SPAN_NONE {
            return None;
        }
        let span = self.spans.get(span_id)?.as_ref()?;
        let index = span.index_of(addr)?;
        Some((span_id, index))
    }

    /// 对象是否存活在堆上（测试与诊断用）
    pub fn contains_object(&self, addr: usize) -> bool {
        match self.find_object(addr) {
            Some((span_id, index)) => self.spans[span_id]
                .as_ref()
                .is_some_and(|s| s.is_allocated(index)),
            None => false,
        }
    }

    // ========================================================================
    // 标记
    // ========================================================================

    /// 候选根：解析到对象则标记并展开子指针到工作栈
    pub(crate) fn mark_candidate(&mut self, addr: usize, work: &mut Vec<usize>) {
        if addr < PAGE_SIZE {
            return;
        }
        let Some((span_id, index)) = self.find_object(addr) else {
            return;
        };
        let span = self.spans[span_id].as_mut().expect("span exists");
        if !span.is_allocated(index) || span.is_marked(index) {
            return;
        }
        span.set_mark(index);
        if !span.has_pointers {
            return;
        }
        let base = span.slot_ptr(index);
        let elem_size = span.elem_size;
        match span.desc_of(index) {
            Some(desc) => {
                // 精确：只追描述符声明的指针字段
                for &off in desc.ptr_offsets {
                    if off + std::mem::size_of::<usize>() <= elem_size {
                        let word = unsafe { (base.add(off) as *const usize).read_unaligned() };
                        work.push(word);
                    }
                }
            }
            None => {
                // 无描述符：整个载荷保守扫描
                let words = elem_size / std::mem::size_of::<usize>();
                for i in 0..words {
                    let word = unsafe { (base as *const usize).add(i).read() };
                    work.push(word);
                }
            }
        }
    }

    /// 指定槽是否未标记且带 finalizer 位（finalizer 扫描用）
    pub(crate) fn unmarked_with_finalizer(&self, addr: usize) -> bool {
        match self.find_object(addr) {
            Some((span_id, index)) => {
                let span = self.spans[span_id].as_ref().expect("span exists");
                span.is_allocated(index) && !span.is_marked(index) && span.has_finalizer_bit(index)
            }
            None => false,
        }
    }

    pub(crate) fn set_finalizer_bit(&mut self, addr: usize, value: bool) -> bool {
        match self.find_object(addr) {
            Some((span_id, index)) => {
                let span = self.spans[span_id].as_mut().expect("span exists");
                if !span.is_allocated(index) {
                    return false;
                }
                span.set_finalizer_bit(index, value);
                true
            }
            None => false,
        }
    }

    pub(crate) fn has_finalizer_bit(&self, addr: usize) -> bool {
        match self.find_object(addr) {
            Some((span_id, index)) => self.spans[span_id]
                .as_ref()
                .is_some_and(|s| s.has_finalizer_bit(index)),
            None => false,
        }
    }

    // ========================================================================
    // 清扫
    // ========================================================================

    /// 清扫全部 span：未标记槽回空闲表，存活槽清标记位；
    /// 全空 span 连续多轮后归还页并把物理页还给 OS
    pub(crate) fn sweep(&mut self) -> SweepStats {
        let mut freed = SweepStats::default();
        for span_id in 0..self.spans.len() {
            let Some(mut span) = self.spans[span_id].take() else {
                continue;
            };

            // 大对象 span：唯一槽未标记即整段回收
            if span.class_index.is_none() {
                if span.is_allocated(0) && !span.is_marked(0) {
                    let bytes = span.span_bytes();
                    self.stats.record_free(bytes);
                    freed.objects += 1;
                    freed.bytes += bytes;
                    self.release_span_pages(&span);
                    continue;
                }
                span.clear_mark(0);
                self.spans[span_id] = Some(span);
                continue;
            }

            // 小对象 span：逐槽清扫
            for index in 0..span.elem_count {
                if !span.is_allocated(index) {
                    continue;
                }
                if span.is_marked(index) {
                    span.clear_mark(index);
                    continue;
                }
                span.free_slot(index);
                self.stats.record_free(span.elem_size);
                freed.objects += 1;
                freed.bytes += span.elem_size;
            }

            if span.allocated == 0 {
                span.idle_sweeps += 1;
                if span.idle_sweeps >= SPAN_RELEASE_SWEEPS {
                    self.release_span_pages(&span);
                    continue;
                }
            }

            if span.has_free() && !span.in_class_list {
                if let Some(class_index) = span.class_index {
                    let lane = span_lane(span.has_pointers);
                    span.in_class_list = true;
                    self.class_spans[class_index][lane].push(span_id);
                }
            }
            self.spans[span_id] = Some(span);
        }
        self.stats.last_freed_objects = freed.objects;
        self.stats.last_freed_bytes = freed.bytes;
        freed
    }

    /// span 的页归还段并把物理页还给 OS
    fn release_span_pages(&mut self, span: &Span) {
        let segment = &mut self.segments[span.segment];
        segment.unmap_span(span.start_page, span.page_count);
        segment.free_pages(span.start_page, span.page_count);
        let addr = unsafe { segment.data.add(span.start_page * PAGE_SIZE) };
        page::decommit(addr, span.page_count * PAGE_SIZE);
    }

    // ========================================================================
    // 每-worker 缓存接口
    // ========================================================================

    /// 为 noscan 通道批量取槽（缓存补充）
    pub(crate) fn refill_cache(
        &mut self,
        class_index: usize,
        out: &mut Vec<*mut u8>,
        count: usize,
    ) -> Result<usize, PageError> {
        let class_size = self.classes[class_index];
        let mut taken = 0;
        while taken < count {
            let span_id = self.take_span_for_class(class_index, 1)?;
            let span = self.spans[span_id].as_mut().expect("span exists");
            while taken < count {
                match span.alloc_slot(None) {
                    Some((ptr, _)) => {
                        out.push(ptr);
                        taken += 1;
                    }
                    None => break,
                }
            }
            span.idle_sweeps = 0;
            let needs_list = span.has_free() && !span.in_class_list;
            if needs_list {
                span.in_class_list = true;
            }
            if needs_list {
                self.class_spans[class_index][1].push(span_id);
            }
        }
        self.stats.live_objects += taken;
        self.stats.live_bytes += taken * class_size;
        self.stats.total_allocs += taken as u64;
        self.stats.total_alloc_bytes += taken * class_size;
        Ok(taken)
    }

    /// 按指针释放一个槽（缓存刷回）
    pub(crate) fn free_slot_ptr(&mut self, ptr: *mut u8) {
        let Some((span_id, index)) = self.find_object(ptr as usize) else {
            return;
        };
        let span = self.spans[span_id].as_mut().expect("span exists");
        if !span.is_allocated(index) {
            return;
        }
        let bytes = span.elem_size;
        span.free_slot(index);
        let list_slot = if span.has_free() && !span.in_class_list {
            span.class_index.map(|ci| {
                span.in_class_list = true;
                (ci, span_lane(span.has_pointers))
            })
        } else {
            None
        };
        self.stats.record_free(bytes);
        if let Some((class_index, lane)) = list_slot {
            self.class_spans[class_index][lane].push(span_id);
        }
    }

    /// 尺寸类表
    pub(crate) fn classes(&self) -> &[usize] {
        &self.classes
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 全局堆实例
// ============================================================================

struct GlobalHeap {
    lock: Lock,
    heap: UnsafeCell<Heap>,
}

// 只在 lock 之下访问 heap
unsafe impl Sync for GlobalHeap {}
unsafe impl Send for GlobalHeap {}

static HEAP: OnceLock<GlobalHeap> = OnceLock::new();

/// 在堆锁下访问全局堆
pub(crate) fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    let gh = HEAP.get_or_init(|| GlobalHeap {
        lock: Lock::new(),
        heap: UnsafeCell::new(Heap::new()),
    });
    let _guard = gh.lock.lock();
    f(unsafe { &mut *gh.heap.get() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_small_zeroed() {
        let mut heap = Heap::new();
        let (p, bytes) = heap.alloc(24, AllocFlags::empty(), None).unwrap();
        assert_eq!(bytes, 24);
        unsafe {
            for i in 0..24 {
                assert_eq!(*p.add(i), 0);
            }
            *p = 7;
        }
        assert!(heap.contains_object(p as usize));
    }

    #[test]
    fn test_alloc_rounds_to_class() {
        let mut heap = Heap::new();
        let (_, bytes) = heap.alloc(9, AllocFlags::empty(), None).unwrap();
        assert_eq!(bytes, 16);
        let (_, bytes) = heap.alloc(130, AllocFlags::empty(), None).unwrap();
        assert_eq!(bytes, 144);
    }

    #[test]
    fn test_alloc_large() {
        let mut heap = Heap::new();
        let size = SMALL_CUTOFF + 100;
        let (p, bytes) = heap.alloc(size, AllocFlags::NO_POINTERS, None).unwrap();
        assert!(bytes >= size);
        assert_eq!(bytes % PAGE_SIZE, 0);
        assert!(heap.contains_object(p as usize));
        // 内部指针也能反查
        assert!(heap.contains_object(p as usize + size - 1));
    }

    #[test]
    fn test_find_object_miss() {
        let heap = Heap::new();
        assert_eq!(heap.find_object(0x12345), None);
        assert!(!heap.contains_object(0x12345));
    }

    #[test]
    fn test_mark_and_sweep_unreachable() {
        let mut heap = Heap::new();
        let (a, _) = heap.alloc(32, AllocFlags::empty(), None).unwrap();
        let (b, _) = heap.alloc(32, AllocFlags::empty(), None).unwrap();

        // 只标记 a
        let mut work = Vec::new();
        heap.mark_candidate(a as usize, &mut work);
        while let Some(p) = work.pop() {
            heap.mark_candidate(p, &mut work);
        }
        let freed = heap.sweep();
        assert!(freed.objects >= 1);
        assert!(heap.contains_object(a as usize));
        assert!(!heap.contains_object(b as usize));
    }

    #[test]
    fn test_precise_marking_follows_desc() {
        static DESC: TypeDesc = TypeDesc::new(16, 8, &[0]);
        let mut heap = Heap::new();
        // child 无指针
        let (child, _) = heap.alloc(16, AllocFlags::NO_POINTERS, None).unwrap();
        let (parent, _) = heap.alloc(16, AllocFlags::empty(), Some(&DESC)).unwrap();
        unsafe {
            *(parent as *mut usize) = child as usize;
        }

        let mut work = Vec::new();
        heap.mark_candidate(parent as usize, &mut work);
        while let Some(p) = work.pop() {
            heap.mark_candidate(p, &mut work);
        }
        let _ = heap.sweep();
        // parent 与 child 都应存活
        assert!(heap.contains_object(parent as usize));
        assert!(heap.contains_object(child as usize));
    }

    #[test]
    fn test_span_reuse_after_sweep() {
        let mut heap = Heap::new();
        let (a, _) = heap.alloc(64, AllocFlags::empty(), None).unwrap();
        // 不标记任何对象：a 被清扫
        let _ = heap.sweep();
        assert!(!heap.contains_object(a as usize));
        // 槽可复用
        let (b, _) = heap.alloc(64, AllocFlags::empty(), None).unwrap();
        assert!(heap.contains_object(b as usize));
    }

    #[test]
    fn test_refill_and_free_slot() {
        let mut heap = Heap::new();
        let class_index = size_class_for(heap.classes(), 32);
        let mut out = Vec::new();
        let n = heap.refill_cache(class_index, &mut out, 8).unwrap();
        assert_eq!(n, 8);
        assert_eq!(out.len(), 8);
        for &p in &out {
            assert!(heap.contains_object(p as usize));
        }
        for p in out {
            heap.free_slot_ptr(p);
            assert!(!heap.contains_object(p as usize));
        }
    }

    #[test]
    fn test_finalizer_bit_roundtrip() {
        let mut heap = Heap::new();
        let (p, _) = heap.alloc(48, AllocFlags::empty(), None).unwrap();
        assert!(!heap.has_finalizer_bit(p as usize));
        assert!(heap.set_finalizer_bit(p as usize, true));
        assert!(heap.has_finalizer_bit(p as usize));
        assert!(heap.unmarked_with_finalizer(p as usize));
        assert!(heap.set_finalizer_bit(p as usize, false));
        assert!(!heap.has_finalizer_bit(p as usize));
    }
}
