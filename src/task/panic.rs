//! panic / defer / recover
//!
//! defer 在 defer 语句处捕获参数（闭包按值捕获）并按作用域深度
//! 入链；作用域退出时 LIFO 执行。panic 压入记录后沿作用域逐层
//! 执行 defer；处于 panic 在途状态时，defer 直接调用 recover 会
//! 取走 panic 值并让该作用域正常返回。未恢复的 panic 到达任务
//! 底部：打印值与任务转储，进程以非零码退出。
//!
//! 传播机制借道 Rust unwinding：运行时 panic 以哨兵载荷经
//! resume_unwind 抛出（不触发 Rust 默认 panic 钩子），外来 Rust
//! panic（断言、越界）在作用域边界被收编为同一套记录，因此同样
//! 可被 recover。

use crate::diag;
use crate::task::Task;
use std::any::Any;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// 运行时 panic 的 unwind 哨兵载荷；真正的值在 PanicState 里
struct PanicSentinel;

/// defer 记录
pub struct DeferEntry {
    /// 所属作用域深度
    scope: u64,
    /// 捕获了参数的调用体
    func: Box<dyn FnOnce() + Send>,
}

/// panic 记录
pub struct PanicRecord {
    /// panic 值（recover 取走）
    value: Option<Box<dyn Any + Send>>,
    /// 已被 recover 观测
    recovered: bool,
    /// 当前 defer 调用可以 recover（直接调用规则的标记位）
    armed: bool,
}

/// 每任务（或每线程）的 panic / defer 状态
pub struct PanicState {
    defers: Vec<DeferEntry>,
    scope: u64,
    panic: Option<PanicRecord>,
}

impl PanicState {
    pub fn new() -> Self {
        Self {
            defers: Vec::new(),
            scope: 0,
            panic: None,
        }
    }
}

impl Default for PanicState {
    fn default() -> Self {
        Self::new()
    }
}

std::thread_local! {
    /// 非任务线程（测试、主线程）的回退状态
    static THREAD_STATE: RefCell<PanicState> = RefCell::new(PanicState::new());
}

fn with_state<R>(f: impl FnOnce(&mut PanicState) -> R) -> R {
    if let Some(task) = crate::sched::current_task() {
        let mut st = task.panic_state.lock();
        f(&mut st)
    } else {
        THREAD_STATE.with(|c| f(&mut c.borrow_mut()))
    }
}

/// 压入一条 defer 记录
///
/// 参数在此刻捕获；执行推迟到当前作用域退出。
pub fn defer_push(f: impl FnOnce() + Send + 'static) {
    with_state(|st| {
        let scope = st.scope;
        st.defers.push(DeferEntry {
            scope,
            func: Box::new(f),
        });
    });
}

/// 引发一次运行时 panic
pub fn panic_any(value: Box<dyn Any + Send>) -> ! {
    with_state(|st| {
        st.panic = Some(PanicRecord {
            value: Some(value),
            recovered: false,
            armed: false,
        });
    });
    std::panic::resume_unwind(Box::new(PanicSentinel));
}

/// 以静态消息引发 panic（运行时自身的有限 panic 集合走这里）
pub fn panic_str(msg: &'static str) -> ! {
    panic_any(Box::new(msg));
}

/// recover：仅当 panic 在途且调用方是链顶 defer 时返回 panic 值
pub fn recover_value() -> Option<Box<dyn Any + Send>> {
    with_state(|st| match st.panic.as_mut() {
        Some(p) if p.armed && !p.recovered => {
            p.recovered = true;
            p.armed = false;
            p.value.take()
        }
        _ => None,
    })
}

/// 当前是否有未恢复的 panic 在途
pub fn panicking() -> bool {
    with_state(|st| matches!(&st.panic, Some(p) if !p.recovered))
}

/// 把 unwind 载荷收编为 panic 记录
///
/// 哨兵载荷说明记录已就位；外来 Rust panic 建立新记录，使 assert、
/// 越界等也能被 recover。
fn absorb_payload(payload: Box<dyn Any + Send>) {
    if payload.is::<PanicSentinel>() {
        with_state(|st| {
            if st.panic.is_none() {
                st.panic = Some(PanicRecord {
                    value: Some(Box::new("panic")),
                    recovered: false,
                    armed: false,
                });
            }
        });
        return;
    }
    with_state(|st| {
        st.panic = Some(PanicRecord {
            value: Some(payload),
            recovered: false,
            armed: false,
        });
    });
}

/// 执行 scope 深度及更深的全部 defer（LIFO）
///
/// defer 自身 panic 时替换当前记录，剩余 defer 继续执行。
fn run_defers_for_scope(scope: u64) {
    loop {
        let entry = with_state(|st| match st.defers.last() {
            Some(e) if e.scope >= scope => st.defers.pop(),
            _ => None,
        });
        let Some(entry) = entry else { break };

        with_state(|st| {
            if let Some(p) = st.panic.as_mut() {
                if !p.recovered {
                    p.armed = true;
                }
            }
        });
        let result = catch_unwind(AssertUnwindSafe(entry.func));
        with_state(|st| {
            if let Some(p) = st.panic.as_mut() {
                p.armed = false;
            }
        });
        if let Err(payload) = result {
            absorb_payload(payload);
        }
    }
}

enum ScopeEnd {
    Normal,
    Recovered,
    Propagate,
}

/// 带 defer 作用域地调用 f
///
/// 返回 Some(值) 表示正常返回；None 表示 f panic 且被本作用域的
/// defer recover（Go 语义下函数以零值返回）。未恢复的 panic 继续
/// 向外层作用域传播。
pub fn with_defer_scope<R>(f: impl FnOnce() -> R) -> Option<R> {
    let my_scope = with_state(|st| {
        st.scope += 1;
        st.scope
    });

    let result = catch_unwind(AssertUnwindSafe(f));
    let normal_value = match result {
        Ok(v) => Some(v),
        Err(payload) => {
            absorb_payload(payload);
            None
        }
    };

    run_defers_for_scope(my_scope);
    with_state(|st| st.scope = my_scope - 1);

    let end = with_state(|st| {
        let recovered = matches!(&st.panic, Some(p) if p.recovered);
        if recovered {
            st.panic = None;
            return ScopeEnd::Recovered;
        }
        if st.panic.is_some() {
            ScopeEnd::Propagate
        } else {
            ScopeEnd::Normal
        }
    });

    match end {
        ScopeEnd::Normal => normal_value,
        ScopeEnd::Recovered => None,
        ScopeEnd::Propagate => {
            std::panic::resume_unwind(Box::new(PanicSentinel));
        }
    }
}

/// 任务体的根作用域
///
/// 未恢复的 panic 到达这里即任务底部：打印诊断并终止进程，
/// 保证 panic 不会"悄悄"跨任务消失。
pub(crate) fn run_task_body(task: &Task, f: Box<dyn FnOnce() + Send>) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        with_defer_scope(|| f());
    }));
    if let Err(payload) = result {
        let value = with_state(|st| st.panic.take().and_then(|p| p.value));
        let text = match &value {
            Some(v) => diag::format_panic_value(v.as_ref()),
            None => diag::format_panic_value(payload.as_ref()),
        };
        eprintln!("panic: {}", text);
        eprintln!("task {} terminated by panic", task.id);
        crate::sched::dump_tasks();
        std::process::exit(diag::PANIC_EXIT_CODE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_defer_lifo_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = with_defer_scope(|| {
            for i in 0..3 {
                let log = Arc::clone(&log);
                defer_push(move || log.lock().unwrap().push(i));
            }
            "done"
        });
        assert_eq!(result, Some("done"));
        assert_eq!(*log.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_defer_captures_at_statement() {
        let log = Arc::new(Mutex::new(Vec::new()));
        with_defer_scope(|| {
            let mut x = 1;
            {
                let log = Arc::clone(&log);
                // 捕获的是此刻的 x
                let captured = x;
                defer_push(move || log.lock().unwrap().push(captured));
            }
            x = 99;
            let _ = x;
        });
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_recover_returns_value() {
        let seen = Arc::new(AtomicI64::new(0));
        let seen2 = Arc::clone(&seen);
        let result = with_defer_scope(|| {
            defer_push(move || {
                if let Some(v) = recover_value() {
                    if let Some(n) = v.downcast_ref::<i64>() {
                        seen2.store(*n, Ordering::SeqCst);
                    }
                }
            });
            panic_any(Box::new(42i64));
        });
        assert!(result.is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_recover_outside_panic_is_none() {
        let got = Arc::new(AtomicI64::new(-1));
        let got2 = Arc::clone(&got);
        with_defer_scope(|| {
            defer_push(move || {
                got2.store(recover_value().is_some() as i64, Ordering::SeqCst);
            });
        });
        assert_eq!(got.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unrecovered_panic_propagates() {
        let outer = std::panic::catch_unwind(|| {
            with_defer_scope(|| {
                panic_str("boom");
            })
        });
        assert!(outer.is_err());
        // 记录残留清理，避免影响本线程后续测试
        with_state(|st| st.panic = None);
    }

    #[test]
    fn test_defers_run_during_panic_in_lifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log1 = Arc::clone(&log);
        let log2 = Arc::clone(&log);
        let result = with_defer_scope(|| {
            defer_push(move || {
                log1.lock().unwrap().push("first-deferred");
                let _ = recover_value();
            });
            defer_push(move || {
                log2.lock().unwrap().push("second-deferred");
            });
            panic_str("unwind");
        });
        assert!(result.is_none());
        // 后 defer 先执行；recover 发生在第一条（最外层）defer
        assert_eq!(
            *log.lock().unwrap(),
            vec!["second-deferred", "first-deferred"]
        );
    }

    #[test]
    fn test_nested_scope_panic_recovered_outer() {
        let result: Option<i32> = with_defer_scope(|| {
            defer_push(|| {
                let _ = recover_value();
            });
            // 内层作用域没有 recover，panic 继续向外传播
            let inner: Option<i32> = with_defer_scope(|| panic_str("inner"));
            let _ = inner;
            7
        });
        assert!(result.is_none());
    }

    #[test]
    fn test_foreign_panic_recoverable() {
        let result = with_defer_scope(|| {
            defer_push(|| {
                let _ = recover_value();
            });
            // 外来 Rust panic 同样可恢复
            let v: Vec<i32> = Vec::new();
            let _ = v[1];
        });
        assert!(result.is_none());
    }
}
