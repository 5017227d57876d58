//! select 多路复用
//!
//! 算法（每轮重试）：
//! 1. 伪随机洗牌 case 顺序，消除系统性偏向
//! 2. 按 channel 地址升序取锁（固定全序，杜绝死锁），逐一探测
//!    非阻塞路径；命中即执行并返回该 case 下标
//! 3. 没有就绪 case 且有 default：走 default
//! 4. 否则携带共享令牌把自己登记到每个 case 的 channel 上，停靠
//! 5. 任一 channel 就绪变化按令牌唤醒（恰好一次）；醒来后移除
//!    其余登记（陈旧项也可能已被就绪方整体摘除，惰性清理），
//!    整轮重试——就绪可能已被别的任务抢走，重试保证正确性

use super::{Channel, RecvPoll, SelectEntry, SendPoll};
use crate::sched::{current_task, get_scheduler};
use crate::task::panic::panic_str;
use crate::task::{Task, WaitReason};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// select 停靠令牌：第一个就绪的 channel 抢到唤醒权
pub struct SelectWaiter {
    pub(crate) task: Arc<Task>,
    pub(crate) fired: AtomicBool,
}

/// case 方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectDir {
    Send,
    Recv,
    Default,
}

/// 一个 select case
///
/// Send 的 data 指向待发送值；Recv 的 data 是接收槽；
/// Default 不携带 channel。
pub struct SelectCase {
    dir: SelectDir,
    chan: Option<Arc<Channel>>,
    data: *mut u8,
}

impl SelectCase {
    pub fn send(chan: &Arc<Channel>, src: *const u8) -> Self {
        Self {
            dir: SelectDir::Send,
            chan: Some(Arc::clone(chan)),
            data: src as *mut u8,
        }
    }

    pub fn recv(chan: &Arc<Channel>, dst: *mut u8) -> Self {
        Self {
            dir: SelectDir::Recv,
            chan: Some(Arc::clone(chan)),
            data: dst,
        }
    }

    pub fn default_case() -> Self {
        Self {
            dir: SelectDir::Default,
            chan: None,
            data: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn dir(&self) -> SelectDir {
        self.dir
    }
}

/// select 结果：被选中的 case 下标与 ok 标志
///
/// Recv case 的 ok 含义同普通接收；Send 与 Default 恒为 true。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectOutcome {
    pub index: usize,
    pub ok: bool,
}

/// 执行一次 select
pub fn select_go(cases: &[SelectCase]) -> SelectOutcome {
    crate::sched::safepoint();
    let sched = get_scheduler();

    let default_idx = cases.iter().position(|c| c.dir == SelectDir::Default);
    let chan_idxs: Vec<usize> = cases
        .iter()
        .enumerate()
        .filter(|(_, c)| c.dir != SelectDir::Default)
        .map(|(i, _)| i)
        .collect();

    if chan_idxs.is_empty() {
        if let Some(d) = default_idx {
            return SelectOutcome { index: d, ok: true };
        }
        // 空 select：永久阻塞
        let cur = match current_task() {
            Some(t) => t,
            None => crate::diag::rt_fatal("empty select outside task"),
        };
        loop {
            sched.park_begin(&cur, WaitReason::Select);
            sched.park_commit();
        }
    }

    // channel 去重并按地址排序（select 的取锁全序）
    let mut uniq: Vec<&Arc<Channel>> = chan_idxs
        .iter()
        .map(|&i| cases[i].chan.as_ref().unwrap())
        .collect();
    uniq.sort_by_key(|c| Arc::as_ptr(c) as usize);
    uniq.dedup_by_key(|c| Arc::as_ptr(c) as usize);

    let slot_of = |ch: &Arc<Channel>| -> usize {
        uniq.iter()
            .position(|u| Arc::ptr_eq(*u, ch))
            .expect("channel in lock set")
    };

    let mut order = chan_idxs.clone();
    loop {
        // 1. 洗牌
        for i in (1..order.len()).rev() {
            let j = (sched.next_rand() % (i as u64 + 1)) as usize;
            order.swap(i, j);
        }

        // 2. 地址序取锁 + 探测
        let mut guards: Vec<_> = uniq.iter().map(|c| c.lock_state()).collect();
        let mut wakes: Vec<Arc<Task>> = Vec::new();
        let mut chosen: Option<(usize, bool)> = None;
        let mut send_on_closed = false;

        for &idx in &order {
            let case = &cases[idx];
            let ch = case.chan.as_ref().unwrap();
            let k = slot_of(ch);
            match case.dir {
                SelectDir::Send => {
                    match ch.poll_send_locked(&mut guards[k], case.data as *const u8, &mut wakes)
                    {
                        SendPoll::Done => {
                            chosen = Some((idx, true));
                            break;
                        }
                        SendPoll::Closed => {
                            // 向已关闭 channel 的发送 case 可执行，执行即致命
                            send_on_closed = true;
                            chosen = Some((idx, true));
                            break;
                        }
                        SendPoll::Blocked => {}
                    }
                }
                SelectDir::Recv => {
                    match ch.poll_recv_locked(&mut guards[k], case.data, &mut wakes) {
                        RecvPoll::Done(ok) => {
                            chosen = Some((idx, ok));
                            break;
                        }
                        RecvPoll::Blocked => {}
                    }
                }
                SelectDir::Default => unreachable!(),
            }
        }

        if let Some((index, ok)) = chosen {
            drop(guards);
            for t in &wakes {
                sched.ready(t);
            }
            if send_on_closed {
                panic_str("send on closed channel");
            }
            return SelectOutcome { index, ok };
        }

        // 3. default
        if let Some(d) = default_idx {
            drop(guards);
            debug_assert!(wakes.is_empty());
            return SelectOutcome { index: d, ok: true };
        }

        // 4. 登记为试探等待者并停靠
        let cur = match current_task() {
            Some(t) => t,
            None => crate::diag::rt_fatal("blocking select outside task"),
        };
        let waiter = Arc::new(SelectWaiter {
            task: Arc::clone(&cur),
            fired: AtomicBool::new(false),
        });
        for g in guards.iter_mut() {
            g.selq.push(SelectEntry {
                waiter: Arc::clone(&waiter),
            });
        }
        sched.park_begin(&cur, WaitReason::Select);
        drop(guards);
        sched.park_commit();

        // 5. 取消其余登记后重试
        for ch in &uniq {
            let mut g = ch.lock_state();
            g.selq.retain(|e| !Arc::ptr_eq(&e.waiter, &waiter));
        }
    }
}
