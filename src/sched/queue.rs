//! 全局运行队列
//!
//! 单互斥锁保护的 FIFO，持锁时间 O(1)。FIFO 纪律保证可运行任务
//! 不会被调度器本身饿死。任务上的 on_runq 标志防止重复入队。

use crate::task::Task;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// 全局运行队列
pub struct RunQueue {
    queue: Mutex<VecDeque<Arc<Task>>>,
    len: CachePadded<AtomicUsize>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            len: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// 队列长度
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 入队尾；任务已在队中则返回 false
    pub fn push(&self, task: Arc<Task>) -> bool {
        if task.on_runq.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut queue = self.queue.lock();
        queue.push_back(task);
        self.len.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// 取队头
    pub fn pop(&self) -> Option<Arc<Task>> {
        let mut queue = self.queue.lock();
        let task = queue.pop_front()?;
        self.len.fetch_sub(1, Ordering::Relaxed);
        task.on_runq.store(false, Ordering::Release);
        Some(task)
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::task::{TaskId, TaskStack};

    fn make_task(id: TaskId) -> Arc<Task> {
        let stack = TaskStack::new(config::STACK_RESERVE).unwrap();
        Arc::new(Task::new(id, Box::new(|| {}), stack))
    }

    #[test]
    fn test_fifo_order() {
        let q = RunQueue::new();
        q.push(make_task(1));
        q.push(make_task(2));
        q.push(make_task(3));
        assert_eq!(q.len(), 3);

        assert_eq!(q.pop().unwrap().id, 1);
        assert_eq!(q.pop().unwrap().id, 2);
        assert_eq!(q.pop().unwrap().id, 3);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_duplicate_push_rejected() {
        let q = RunQueue::new();
        let t = make_task(7);
        assert!(q.push(Arc::clone(&t)));
        assert!(!q.push(Arc::clone(&t)));
        assert_eq!(q.len(), 1);

        let popped = q.pop().unwrap();
        assert_eq!(popped.id, 7);
        // 出队后可再次入队
        assert!(q.push(popped));
    }
}
