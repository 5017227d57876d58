//! 配置常量模块
//!
//! 所有可配置的运行时常量都在这里定义，便于后期修改。
//! 环境变量覆盖在进程启动后第一次读取时生效。

use std::sync::atomic::{AtomicUsize, Ordering};

/// 语言名称
pub const LANG_NAME: &str = "Z";

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 堆页大小（分配器粒度，与 OS 页无关）
pub const PAGE_SIZE: usize = 8 * 1024;

/// 段大小：页堆每次向 OS 保留的连续区域
pub const SEGMENT_SIZE: usize = 1 << 20;

/// 每段页数
pub const SEGMENT_PAGES: usize = SEGMENT_SIZE / PAGE_SIZE;

/// 任务栈默认保留大小：1MB
pub const STACK_RESERVE: usize = 1 << 20;

/// 任务栈初始逻辑大小：16KB（栈警戒字从这里开始，按需下移）
pub const STACK_INITIAL: usize = 16 * 1024;

/// 函数序言保留量：警戒字与真正可用下界之间的余量
pub const STACK_PROLOGUE_RESERVE: usize = 1024;

/// 空闲栈缓存每档上限
pub const STACK_CACHE_LIMIT: usize = 64;

/// GC 触发比默认值：堆增长到活跃字节的 2 倍时触发
pub const GC_TRIGGER_RATIO: usize = 2;

/// GC 触发下限（字节）
pub const GC_MIN_TRIGGER: usize = SEGMENT_SIZE;

/// 空 span 连续多少轮清扫未被使用后把页归还 OS
pub const SPAN_RELEASE_SWEEPS: u32 = 2;

/// 每-worker 缓存单次补充的对象数
pub const CACHE_REFILL_BATCH: usize = 16;

/// 读取整数环境变量，未设置或非法时返回默认值
pub fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(v) => v.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// 读取布尔环境变量（"1" / "true" 为真）
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim();
            v == "1" || v.eq_ignore_ascii_case("true")
        }
        Err(_) => default,
    }
}

/// 运行时配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// 工作线程数（0 表示使用 CPU 核心数）
    pub num_workers: usize,
    /// 任务栈保留大小（字节）
    pub stack_reserve: usize,
    /// GC 触发比（堆大小达到活跃字节的多少倍时收集）
    pub gc_ratio: usize,
    /// 是否每轮收集打印一行统计
    pub gc_trace: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let workers = env_usize("ZLANG_MAXWORKERS", 0);
        let workers = if workers == 0 { num_cpus::get() } else { workers };
        Self {
            num_workers: workers,
            stack_reserve: env_usize("ZLANG_STACK_RESERVE_KB", STACK_RESERVE / 1024) * 1024,
            gc_ratio: env_usize("ZLANG_GC_RATIO", GC_TRIGGER_RATIO).max(1),
            gc_trace: env_bool("ZLANG_GC_TRACE", false),
        }
    }
}

/// 进程级 GC 触发比（collect 结束时按它计算下一次阈值）
static GC_RATIO: AtomicUsize = AtomicUsize::new(0);

/// 当前生效的 GC 触发比
pub fn gc_ratio() -> usize {
    let v = GC_RATIO.load(Ordering::Relaxed);
    if v != 0 {
        return v;
    }
    let v = env_usize("ZLANG_GC_RATIO", GC_TRIGGER_RATIO).max(1);
    GC_RATIO.store(v, Ordering::Relaxed);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_usize_default() {
        assert_eq!(env_usize("ZLANG_NO_SUCH_VAR_12345", 7), 7);
    }

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.num_workers >= 1);
        assert!(config.gc_ratio >= 1);
        assert!(config.stack_reserve >= STACK_INITIAL);
    }
}
