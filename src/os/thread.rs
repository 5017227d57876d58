//! OS 线程创建
//!
//! 工作线程共享地址空间，生命周期与进程相同。

use std::thread::{Builder, JoinHandle};

/// 线程创建错误
#[derive(Debug)]
pub struct SpawnError {
    inner: std::io::Error,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread spawn failed: {}", self.inner)
    }
}

impl std::error::Error for SpawnError {}

/// 创建一个命名 OS 线程
///
/// 只有资源耗尽会失败；调用方决定重试或中止。
pub fn spawn_thread<F>(name: String, f: F) -> Result<JoinHandle<()>, SpawnError>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new()
        .name(name)
        .spawn(f)
        .map_err(|e| SpawnError { inner: e })
}

/// 让出当前 OS 线程的时间片
#[inline]
pub fn os_yield() {
    std::thread::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spawn_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        let handle = spawn_thread("test-thread".to_string(), move || {
            flag2.store(true, Ordering::Release);
        })
        .unwrap();
        handle.join().unwrap();
        assert!(flag.load(Ordering::Acquire));
    }
}
