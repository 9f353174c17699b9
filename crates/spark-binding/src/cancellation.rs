//! 重试等待的取消位。
//!
//! # 模块定位（Why）
//! - 绑定器 `destroy` 或被释放时，阻塞在 [`crate::retry::RetryPolicy::execute`] 里的调用方必须立即返回
//!   `None`，而不是睡满剩余超时；
//! - 取消位只表达“是否已拆除”，不负责唤醒：唤醒必须与等待者共用同一把互斥锁和条件变量，
//!   因此只有 [`crate::retry::RetryPolicy::cancel`] 会先置位、再在状态锁下 `notify_all`。
//!
//! # 并发模型（How）
//! - 单个 [`AtomicBool`]；`cancel` 用 `compare_exchange` 判定“谁是第一个拆除者”；
//! - `--cfg loom` / `--cfg spark_loom` 下换成 Loom 原子类型，供 `tests/loom_concurrency.rs` 穷举交错。

use std::sync::Arc;

#[cfg(not(any(loom, spark_loom)))]
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(any(loom, spark_loom))]
use loom::sync::atomic::{AtomicBool, Ordering};

/// 拆除标记，克隆共享同一位。
///
/// - 置位不可撤回：任何克隆观察到 `true` 之后，后续读取都为 `true`；
/// - 并发拆除时恰好一方的 [`Cancellation::cancel`] 返回 `true`，该方负责记录拆除日志等一次性动作。
#[derive(Clone, Debug)]
pub struct Cancellation {
    torn_down: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            torn_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 以源令牌的当前状态创建独立令牌；源已拆除时新令牌同样处于拆除状态。
    pub fn detached_from(source: &Cancellation) -> Self {
        let fresh = Self::new();
        if source.is_cancelled() {
            fresh.cancel();
        }
        fresh
    }

    pub fn is_cancelled(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// 置位；返回 `true` 表示本次调用完成了拆除。
    pub fn cancel(&self) -> bool {
        self.torn_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag_and_detached_copies_do_not() {
        let root = Cancellation::new();
        let shared = root.clone();
        let detached = Cancellation::detached_from(&root);
        assert!(shared.cancel());
        assert!(root.is_cancelled());
        assert!(!root.cancel(), "重复取消应返回 false");
        assert!(!detached.is_cancelled(), "拆分后的令牌不受原令牌影响");

        let inherited = Cancellation::detached_from(&root);
        assert!(inherited.is_cancelled(), "源已取消时新令牌继承取消状态");
        assert!(!inherited.cancel());
    }
}
