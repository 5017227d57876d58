//! Channel 实现
//!
//! 定长元素的类型无关 FIFO 核心 + 类型化门面。语义：
//! - 发送：已关闭即致命；有接收等待者则直递；缓冲未满入缓冲；
//!   否则携值入发送等待队列并停靠
//! - 接收：有发送等待者则直递（缓冲模式下先出头再把等待者的值
//!   迁入空槽）；缓冲非空出头；已关闭返回零值 + false；否则停靠
//! - 关闭：排空全部阻塞接收者（零值 + false）；仍有阻塞发送者时
//!   该发送者被唤醒后以致命错误结束
//!
//! 每个 channel 一把互斥锁；唤醒在放锁之后进行。select 的试探
//! 登记表挂在 channel 状态里，就绪变化时按令牌唤醒（见 select）。

pub mod select;

pub use select::{select_go, SelectCase, SelectDir, SelectOutcome};

use crate::sched::{current_task, get_scheduler};
use crate::task::panic::panic_str;
use crate::task::{Task, WaitReason};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Channel ID 计数器
static CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 等待者：阻塞任务 + 它栈上的元素槽
///
/// 发送等待者的槽存放待发送值；接收等待者的槽是接收目标。
/// 槽指针在任务停靠期间保持有效。
pub(crate) struct ChanWaiter {
    pub(crate) task: Arc<Task>,
    elem: *mut u8,
    /// 完成标志：直递成功为 true；关闭唤醒为 false
    ok: AtomicBool,
}

unsafe impl Send for ChanWaiter {}
unsafe impl Sync for ChanWaiter {}

/// select 试探登记项
pub(crate) struct SelectEntry {
    pub(crate) waiter: Arc<select::SelectWaiter>,
}

/// 受锁保护的 channel 状态
pub(crate) struct ChanState {
    /// 环形缓冲（cap * elem_size 字节）
    buf: Vec<u8>,
    len: usize,
    head: usize,
    tail: usize,
    sendq: std::collections::VecDeque<Arc<ChanWaiter>>,
    recvq: std::collections::VecDeque<Arc<ChanWaiter>>,
    pub(crate) selq: Vec<SelectEntry>,
    closed: bool,
}

/// 非阻塞发送探测结果
pub(crate) enum SendPoll {
    Done,
    Closed,
    Blocked,
}

/// 非阻塞接收探测结果
pub(crate) enum RecvPoll {
    Done(bool),
    Blocked,
}

/// 定长元素 FIFO
pub struct Channel {
    id: u64,
    elem_size: usize,
    cap: usize,
    state: Mutex<ChanState>,
}

#[inline]
unsafe fn copy_elem(dst: *mut u8, src: *const u8, size: usize) {
    if size > 0 && !dst.is_null() && !src.is_null() {
        std::ptr::copy_nonoverlapping(src, dst, size);
    }
}

#[inline]
unsafe fn zero_elem(dst: *mut u8, size: usize) {
    if size > 0 && !dst.is_null() {
        std::ptr::write_bytes(dst, 0, size);
    }
}

impl Channel {
    /// 创建 channel（cap 为 0 即无缓冲，收发双方会合）
    pub fn new(elem_size: usize, cap: usize) -> Arc<Self> {
        Arc::new(Self {
            id: CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            elem_size,
            cap,
            state: Mutex::new(ChanState {
                buf: vec![0u8; elem_size.saturating_mul(cap)],
                len: 0,
                head: 0,
                tail: 0,
                sendq: std::collections::VecDeque::new(),
                recvq: std::collections::VecDeque::new(),
                selq: Vec::new(),
                closed: false,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// 当前缓冲元素个数
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ChanState> {
        self.state.lock()
    }

    // ========================================================================
    // 缓冲操作（持锁调用）
    // ========================================================================

    fn buf_push(&self, st: &mut ChanState, src: *const u8) {
        debug_assert!(st.len < self.cap);
        unsafe {
            let slot = st.buf.as_mut_ptr().add(st.tail * self.elem_size);
            copy_elem(slot, src, self.elem_size);
        }
        st.tail = (st.tail + 1) % self.cap;
        st.len += 1;
    }

    fn buf_pop(&self, st: &mut ChanState, dst: *mut u8) {
        debug_assert!(st.len > 0);
        unsafe {
            let slot = st.buf.as_ptr().add(st.head * self.elem_size);
            copy_elem(dst, slot, self.elem_size);
        }
        st.head = (st.head + 1) % self.cap;
        st.len -= 1;
    }

    /// 就绪变化时唤醒 select 登记者：整体摘除，按令牌去重
    pub(crate) fn notify_select_locked(
        &self,
        st: &mut ChanState,
        wakes: &mut Vec<Arc<Task>>,
    ) {
        if st.selq.is_empty() {
            return;
        }
        for entry in st.selq.drain(..) {
            if !entry.waiter.fired.swap(true, Ordering::AcqRel) {
                wakes.push(Arc::clone(&entry.waiter.task));
            }
        }
    }

    // ========================================================================
    // 非阻塞探测（select 与快路径共用，持锁调用）
    // ========================================================================

    pub(crate) fn poll_send_locked(
        &self,
        st: &mut ChanState,
        src: *const u8,
        wakes: &mut Vec<Arc<Task>>,
    ) -> SendPoll {
        if st.closed {
            return SendPoll::Closed;
        }
        if let Some(w) = st.recvq.pop_front() {
            // 直递给队头接收者
            unsafe {
                copy_elem(w.elem, src, self.elem_size);
            }
            w.ok.store(true, Ordering::Release);
            wakes.push(Arc::clone(&w.task));
            return SendPoll::Done;
        }
        if self.cap > 0 && st.len < self.cap {
            self.buf_push(st, src);
            // 缓冲出现数据：接收方向的 select 可能就绪
            self.notify_select_locked(st, wakes);
            return SendPoll::Done;
        }
        SendPoll::Blocked
    }

    pub(crate) fn poll_recv_locked(
        &self,
        st: &mut ChanState,
        dst: *mut u8,
        wakes: &mut Vec<Arc<Task>>,
    ) -> RecvPoll {
        if self.cap > 0 && st.len > 0 {
            self.buf_pop(st, dst);
            if let Some(sw) = st.sendq.pop_front() {
                // 把阻塞发送者的值迁入腾出的槽
                self.buf_push(st, sw.elem as *const u8);
                sw.ok.store(true, Ordering::Release);
                wakes.push(Arc::clone(&sw.task));
            } else {
                // 缓冲腾出空间：发送方向的 select 可能就绪
                self.notify_select_locked(st, wakes);
            }
            return RecvPoll::Done(true);
        }
        if let Some(sw) = st.sendq.pop_front() {
            // 无缓冲会合：从发送者槽直接取值
            unsafe {
                copy_elem(dst, sw.elem as *const u8, self.elem_size);
            }
            sw.ok.store(true, Ordering::Release);
            wakes.push(Arc::clone(&sw.task));
            return RecvPoll::Done(true);
        }
        if st.closed {
            unsafe {
                zero_elem(dst, self.elem_size);
            }
            return RecvPoll::Done(false);
        }
        RecvPoll::Blocked
    }

    // ========================================================================
    // 阻塞操作
    // ========================================================================

    /// 发送（阻塞）；向已关闭 channel 发送是致命错误
    pub fn send(&self, src: *const u8) {
        crate::sched::safepoint();
        let sched = get_scheduler();
        let mut wakes = Vec::new();
        let mut st = self.state.lock();
        match self.poll_send_locked(&mut st, src, &mut wakes) {
            SendPoll::Done => {
                drop(st);
                for t in &wakes {
                    sched.ready(t);
                }
                return;
            }
            SendPoll::Closed => {
                drop(st);
                panic_str("send on closed channel");
            }
            SendPoll::Blocked => {}
        }

        let cur = match current_task() {
            Some(t) => t,
            None => crate::diag::rt_fatal("blocking channel send outside task"),
        };
        let w = Arc::new(ChanWaiter {
            task: Arc::clone(&cur),
            elem: src as *mut u8,
            ok: AtomicBool::new(false),
        });
        st.sendq.push_back(Arc::clone(&w));
        // 发送者入队本身就是接收方向 select 的就绪变化
        self.notify_select_locked(&mut st, &mut wakes);
        sched.park_begin(&cur, WaitReason::ChannelSend);
        drop(st);
        for t in &wakes {
            sched.ready(t);
        }
        sched.park_commit();

        if !w.ok.load(Ordering::Acquire) {
            panic_str("send on closed channel");
        }
    }

    /// 接收（阻塞）
    ///
    /// 返回 true 表示取到值；false 表示 channel 已关闭且为空，
    /// dst 被写入零值。
    pub fn recv(&self, dst: *mut u8) -> bool {
        crate::sched::safepoint();
        let sched = get_scheduler();
        let mut wakes = Vec::new();
        let mut st = self.state.lock();
        match self.poll_recv_locked(&mut st, dst, &mut wakes) {
            RecvPoll::Done(ok) => {
                drop(st);
                for t in &wakes {
                    sched.ready(t);
                }
                return ok;
            }
            RecvPoll::Blocked => {}
        }

        let cur = match current_task() {
            Some(t) => t,
            None => crate::diag::rt_fatal("blocking channel recv outside task"),
        };
        let w = Arc::new(ChanWaiter {
            task: Arc::clone(&cur),
            elem: dst,
            ok: AtomicBool::new(false),
        });
        st.recvq.push_back(Arc::clone(&w));
        // 接收者入队是发送方向 select 的就绪变化
        self.notify_select_locked(&mut st, &mut wakes);
        sched.park_begin(&cur, WaitReason::ChannelRecv);
        drop(st);
        for t in &wakes {
            sched.ready(t);
        }
        sched.park_commit();

        w.ok.load(Ordering::Acquire)
    }

    /// 关闭 channel；重复关闭是致命错误
    pub fn close(&self) {
        crate::sched::safepoint();
        let sched = get_scheduler();
        let mut wakes = Vec::new();
        let mut st = self.state.lock();
        if st.closed {
            drop(st);
            panic_str("close of closed channel");
        }
        st.closed = true;
        // 排空阻塞接收者：零值 + ok=false
        while let Some(w) = st.recvq.pop_front() {
            unsafe {
                zero_elem(w.elem, self.elem_size);
            }
            wakes.push(Arc::clone(&w.task));
        }
        // 仍阻塞的发送者唤醒后在发送侧以致命错误结束
        while let Some(w) = st.sendq.pop_front() {
            wakes.push(Arc::clone(&w.task));
        }
        self.notify_select_locked(&mut st, &mut wakes);
        drop(st);
        for t in &wakes {
            sched.ready(t);
        }
    }

    // ========================================================================
    // 非阻塞变体
    // ========================================================================

    /// 尝试发送；关闭或将阻塞时返回 false
    pub fn try_send(&self, src: *const u8) -> bool {
        crate::sched::safepoint();
        let sched = get_scheduler();
        let mut wakes = Vec::new();
        let mut st = self.state.lock();
        let result = matches!(
            self.poll_send_locked(&mut st, src, &mut wakes),
            SendPoll::Done
        );
        drop(st);
        for t in &wakes {
            sched.ready(t);
        }
        result
    }

    /// 尝试接收
    ///
    /// Some(true) 取到值；Some(false) 已关闭且空（dst 置零）；
    /// None 将阻塞。
    pub fn try_recv(&self, dst: *mut u8) -> Option<bool> {
        crate::sched::safepoint();
        let sched = get_scheduler();
        let mut wakes = Vec::new();
        let mut st = self.state.lock();
        let result = match self.poll_recv_locked(&mut st, dst, &mut wakes) {
            RecvPoll::Done(ok) => Some(ok),
            RecvPoll::Blocked => None,
        };
        drop(st);
        for t in &wakes {
            sched.ready(t);
        }
        result
    }

    /// 定时器投递：到期时非阻塞写入当前单调时间
    ///
    /// 无人接收且缓冲已满则静默丢弃。
    pub(crate) fn timer_ping(&self) {
        let now = crate::os::time::monotonic_now_ns();
        let src = &now as *const u64 as *const u8;
        let sched = get_scheduler();
        let mut wakes = Vec::new();
        let mut st = self.state.lock();
        if !st.closed {
            let _ = self.poll_send_locked(&mut st, src, &mut wakes);
        }
        drop(st);
        for t in &wakes {
            sched.ready(t);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("elem_size", &self.elem_size)
            .field("capacity", &self.cap)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// 类型化门面
// ============================================================================

/// 带元素类型的 channel
///
/// 要求 Copy（元素按字节复制）+ Default（关闭时的零值）。
pub struct Chan<T: Copy + Default + Send + 'static> {
    inner: Arc<Channel>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Copy + Default + Send + 'static> Clone for Chan<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Copy + Default + Send + 'static> Chan<T> {
    /// 创建容量为 cap 的 channel（0 为无缓冲）
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Channel::new(std::mem::size_of::<T>(), cap),
            _marker: std::marker::PhantomData,
        }
    }

    /// 包装既有原始 channel（元素大小必须一致）
    pub fn from_raw(inner: Arc<Channel>) -> Self {
        debug_assert_eq!(inner.elem_size(), std::mem::size_of::<T>());
        Self {
            inner,
            _marker: std::marker::PhantomData,
        }
    }

    /// 原始 channel 引用（构造 select case 用）
    pub fn raw(&self) -> &Arc<Channel> {
        &self.inner
    }

    /// 发送（阻塞）
    pub fn send(&self, v: T) {
        self.inner.send(&v as *const T as *const u8);
    }

    /// 接收（阻塞）；关闭且空时返回 (零值, false)
    pub fn recv(&self) -> (T, bool) {
        let mut slot = T::default();
        let ok = self.inner.recv(&mut slot as *mut T as *mut u8);
        (slot, ok)
    }

    /// 尝试发送
    pub fn try_send(&self, v: T) -> bool {
        self.inner.try_send(&v as *const T as *const u8)
    }

    /// 尝试接收
    pub fn try_recv(&self) -> Option<(T, bool)> {
        let mut slot = T::default();
        self.inner
            .try_recv(&mut slot as *mut T as *mut u8)
            .map(|ok| (slot, ok))
    }

    /// 关闭
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl<T: Copy + Default + Send + 'static> std::fmt::Debug for Chan<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::get_scheduler;

    #[test]
    fn test_buffered_try_ops() {
        let ch: Chan<i64> = Chan::new(2);
        assert!(ch.try_send(1));
        assert!(ch.try_send(2));
        assert!(!ch.try_send(3)); // 缓冲满
        assert_eq!(ch.len(), 2);

        assert_eq!(ch.try_recv(), Some((1, true)));
        assert_eq!(ch.try_recv(), Some((2, true)));
        assert_eq!(ch.try_recv(), None); // 空
    }

    #[test]
    fn test_unbuffered_try_needs_peer() {
        let ch: Chan<i64> = Chan::new(0);
        // 无缓冲且无接收者：非阻塞发送失败
        assert!(!ch.try_send(1));
        assert_eq!(ch.try_recv(), None);
    }

    #[test]
    fn test_closed_recv_sequence() {
        // 容量 3，发 1,2,3 后关闭，连续接收四次
        let ch: Chan<i64> = Chan::new(3);
        ch.send(1);
        ch.send(2);
        ch.send(3);
        ch.close();

        let sched = get_scheduler();
        let ch2 = ch.clone();
        let handle = sched.spawn(Box::new(move || {
            assert_eq!(ch2.recv(), (1, true));
            assert_eq!(ch2.recv(), (2, true));
            assert_eq!(ch2.recv(), (3, true));
            assert_eq!(ch2.recv(), (0, false));
        }));
        handle.join();
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        let ch: Chan<i64> = Chan::new(0);
        let sched = get_scheduler();
        let ch2 = ch.clone();
        let handle = sched.spawn(Box::new(move || {
            // 关闭前已阻塞的接收者以 (0, false) 解除
            assert_eq!(ch2.recv(), (0, false));
        }));
        std::thread::sleep(std::time::Duration::from_millis(30));
        ch.close();
        handle.join();
    }

    #[test]
    fn test_unbuffered_rendezvous() {
        let ch: Chan<u64> = Chan::new(0);
        let sched = get_scheduler();
        let tx = ch.clone();
        let sender = sched.spawn(Box::new(move || {
            tx.send(7);
            tx.send(8);
        }));
        let rx = ch.clone();
        let receiver = sched.spawn(Box::new(move || {
            assert_eq!(rx.recv(), (7, true));
            assert_eq!(rx.recv(), (8, true));
        }));
        sender.join();
        receiver.join();
    }

    #[test]
    fn test_fifo_single_sender() {
        // 单发送者的值序必须按发送序到达
        let ch: Chan<u64> = Chan::new(4);
        let sched = get_scheduler();
        let tx = ch.clone();
        let n = 1000u64;
        let sender = sched.spawn(Box::new(move || {
            for i in 0..n {
                tx.send(i);
            }
        }));
        let rx = ch.clone();
        let receiver = sched.spawn(Box::new(move || {
            for i in 0..n {
                assert_eq!(rx.recv(), (i, true));
            }
        }));
        sender.join();
        receiver.join();
    }

    #[test]
    fn test_buffered_blocked_sender_migration() {
        let ch: Chan<u64> = Chan::new(1);
        let sched = get_scheduler();
        let tx = ch.clone();
        let sender = sched.spawn(Box::new(move || {
            tx.send(1); // 入缓冲
            tx.send(2); // 缓冲满，阻塞
        }));
        std::thread::sleep(std::time::Duration::from_millis(30));
        let rx = ch.clone();
        let receiver = sched.spawn(Box::new(move || {
            // 取走 1 时阻塞发送者的 2 迁入空槽
            assert_eq!(rx.recv(), (1, true));
            assert_eq!(rx.recv(), (2, true));
        }));
        sender.join();
        receiver.join();
    }

    #[test]
    fn test_zero_size_elements() {
        #[derive(Clone, Copy, Default, PartialEq, Debug)]
        struct Unit;
        let ch: Chan<Unit> = Chan::new(1);
        assert!(ch.try_send(Unit));
        assert_eq!(ch.try_recv(), Some((Unit, true)));
    }
}
