//! 页粒度地址空间管理
//!
//! reserve 只占地址空间不占物理内存；commit 之后才可读写；
//! decommit 把物理页还给 OS 但保留地址区间；release 整体解除映射。

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 页操作错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageError {
    /// 物理内存或地址空间耗尽
    OutOfMemory,
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for PageError {}

static PAGE_SIZE_CACHE: AtomicUsize = AtomicUsize::new(0);

/// OS 页大小（缓存首次 sysconf 的结果）
pub fn page_size() -> usize {
    let cached = PAGE_SIZE_CACHE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let ps = if ps <= 0 { 4096 } else { ps as usize };
    PAGE_SIZE_CACHE.store(ps, Ordering::Relaxed);
    ps
}

#[cfg(target_os = "linux")]
const RESERVE_FLAGS: libc::c_int =
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

#[cfg(not(target_os = "linux"))]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

/// 保留一段地址空间（不可访问，不计物理内存）
///
/// 前置条件满足时不失败：地址空间耗尽按致命错误处理。
pub fn reserve(size: usize) -> *mut u8 {
    debug_assert!(size > 0);
    let p = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_NONE,
            RESERVE_FLAGS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        crate::diag::rt_fatal("page reserve failed");
    }
    p as *mut u8
}

/// 把保留区间中的一段变为可读写
pub fn commit(addr: *mut u8, len: usize) -> Result<(), PageError> {
    debug_assert!(len > 0);
    let rc = unsafe {
        libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_WRITE)
    };
    if rc != 0 {
        // mprotect 对匿名映射只会因内存记账失败
        return Err(PageError::OutOfMemory);
    }
    Ok(())
}

/// 把物理页还给 OS，区间保持已提交状态（内容清零语义）
pub fn decommit(addr: *mut u8, len: usize) {
    if len == 0 {
        return;
    }
    unsafe {
        libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED);
    }
}

/// 解除整个映射
pub fn release(addr: *mut u8, len: usize) {
    if addr.is_null() || len == 0 {
        return;
    }
    unsafe {
        libc::munmap(addr as *mut libc::c_void, len);
    }
}

/// 为任务栈建立映射：整体可读写，最低一页为保护页
///
/// 返回保留区低端地址（保护页起点）。物理页由 OS 按需提交。
pub fn map_stack(reserve_len: usize) -> Result<*mut u8, PageError> {
    let ps = page_size();
    debug_assert!(reserve_len >= ps * 2);
    let p = unsafe {
        libc::mmap(
            ptr::null_mut(),
            reserve_len,
            libc::PROT_READ | libc::PROT_WRITE,
            RESERVE_FLAGS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(PageError::OutOfMemory);
    }
    // 低端保护页：栈向下增长越界时直接段错误而不是踩别人的内存
    let rc = unsafe { libc::mprotect(p, ps, libc::PROT_NONE) };
    if rc != 0 {
        unsafe { libc::munmap(p, reserve_len) };
        return Err(PageError::OutOfMemory);
    }
    Ok(p as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert!(ps.is_power_of_two());
    }

    #[test]
    fn test_reserve_commit_release() {
        let ps = page_size();
        let len = ps * 4;
        let p = reserve(len);
        assert!(!p.is_null());

        commit(p, len).unwrap();
        unsafe {
            // 提交后可读写，匿名页初始为零
            assert_eq!(*p, 0);
            *p = 0xAB;
            assert_eq!(*p, 0xAB);
        }

        decommit(p, len);
        release(p, len);
    }

    #[test]
    fn test_map_stack_guard() {
        let ps = page_size();
        let len = ps * 8;
        let p = map_stack(len).unwrap();
        unsafe {
            // 保护页之上可写
            let usable = p.add(ps);
            *usable = 1;
            let top = p.add(len - 1);
            *top = 2;
            assert_eq!(*usable, 1);
            assert_eq!(*top, 2);
        }
        release(p, len);
    }
}
