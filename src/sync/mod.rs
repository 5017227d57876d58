//! 低层同步原语
//!
//! 三个原语逐层构建：
//! - Usema：计数信号量，快路径原子计数，慢路径内核阻塞
//! - Lock：三态互斥锁，竞争时惰性分配信号量并停靠
//! - Note：一次性事件，wakeup 置永久直到下次 clear
//!
//! 上层（调度器、channel、GC）只在这些原语与 parking_lot 之上构建。

pub mod lock;
pub mod note;
pub mod sema;

pub use lock::{Lock, LockGuard};
pub use note::Note;
pub use sema::Usema;
