//! 有界退避重试。
//!
//! # 模块定位（Why）
//! - 绑定器在没有可用实例时不立即失败，而是在超时预算内反复查询注册表；
//! - 注册表出现新实例时，绑定器通过 [`RetryPolicy::wake`] 让等待者立刻重查，不必睡满一个间隔。
//!
//! # 核心机制（How）
//! - 间隔与“代数”计数器放在同一把互斥锁下，条件变量负责唤醒；
//! - 每次查询前记录代数，查询失败后若代数已变化（`reset`/`wake` 发生在查询与入睡之间）则立即重查，
//!   从而消除“决定入睡”与“真正入睡”之间的竞态窗口；
//! - 睡眠截止时间取 `min(本次入睡时刻 + 间隔, 总截止时间)`，截止之后不再发起新的查询。
//!
//! # 契约说明（What）
//! - 第一次查询总会执行；
//! - 超时返回 `None`，从不 panic 或返回错误；
//! - 取消后正在睡眠的等待者立即返回 `None`，之后的 `execute` 在第一次查询失败后直接返回。

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cancellation::Cancellation;

/// 默认重试间隔。
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// 重试总预算。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDeadline {
    /// 只受取消约束。
    Unbounded,
    /// 自 `execute` 开始起的相对时长。
    Within(Duration),
}

/// 相邻两次查询之间的等待策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Backoff {
    /// 每次都等待当前间隔。
    #[default]
    Fixed,
    /// 第 n 次失败后等待 `interval * factor^(n-1)`，不超过 `max`。
    Exponential { factor: u32, max: Duration },
}

impl Backoff {
    /// 计算第 `attempt`（从 1 开始）次失败后的等待时长。
    pub fn delay(&self, interval: Duration, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed => interval,
            Backoff::Exponential { factor, max } => {
                let mut delay = interval;
                for _ in 1..attempt {
                    delay = delay.saturating_mul(factor);
                    if delay >= max {
                        return max;
                    }
                }
                delay.min(max)
            }
        }
    }
}

/// 可被并发重置与唤醒的重试循环。克隆共享同一份状态。
///
/// # 教案式说明
/// - **意图 (Why)**：`reset` 是唯一一处刻意的跨线程唤醒，必须基于条件变量通知而非轮询；
/// - **逻辑 (How)**：见模块文档中的“代数”机制；
/// - **契约 (What)**：`reset(d)` 持久替换间隔并在下一个睡眠边界生效；`wake()` 只唤醒、不改间隔；
/// - **风险 (Trade-offs)**：同一策略上的多个等待者共享间隔，`reset` 会唤醒全部等待者。
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    shared: Arc<RetryShared>,
}

#[derive(Debug)]
struct RetryShared {
    state: Mutex<RetryState>,
    signal: Condvar,
    backoff: Backoff,
    cancellation: Cancellation,
}

#[derive(Debug)]
struct RetryState {
    interval: Duration,
    generation: u64,
}

impl RetryPolicy {
    pub fn new(interval: Duration) -> Self {
        Self::build(interval, Backoff::Fixed, Cancellation::new())
    }

    /// 替换退避策略，返回新的独立策略。
    ///
    /// 新策略拥有自己的取消位与条件变量，只继承调用时刻的取消状态；
    /// 旧策略其余克隆上的 `cancel` 不会影响它。
    #[must_use]
    pub fn with_backoff(self, backoff: Backoff) -> Self {
        let cancellation = Cancellation::detached_from(&self.shared.cancellation);
        Self::build(self.interval(), backoff, cancellation)
    }

    fn build(interval: Duration, backoff: Backoff, cancellation: Cancellation) -> Self {
        Self {
            shared: Arc::new(RetryShared {
                state: Mutex::new(RetryState {
                    interval,
                    generation: 0,
                }),
                signal: Condvar::new(),
                backoff,
                cancellation,
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.shared.state.lock().interval
    }

    pub fn backoff(&self) -> Backoff {
        self.shared.backoff
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancellation.is_cancelled()
    }

    /// 反复执行 `op` 直到得到值、预算耗尽或被取消。
    pub fn execute<T, F>(&self, deadline: RetryDeadline, mut op: F) -> Option<T>
    where
        F: FnMut() -> Option<T>,
    {
        let started = Instant::now();
        let deadline_at = match deadline {
            RetryDeadline::Unbounded => None,
            RetryDeadline::Within(budget) => Some(started.checked_add(budget)),
        };
        let mut attempt: u32 = 0;
        loop {
            let seen = self.shared.state.lock().generation;
            if let Some(value) = op() {
                return Some(value);
            }
            attempt = attempt.saturating_add(1);

            let mut state = self.shared.state.lock();
            let delay = self.shared.backoff.delay(state.interval, attempt);
            let wake_at = earliest(Instant::now().checked_add(delay), deadline_at);
            loop {
                if self.shared.cancellation.is_cancelled() {
                    return None;
                }
                if state.generation != seen {
                    break;
                }
                match wake_at {
                    Some(instant) => {
                        if Instant::now() >= instant {
                            break;
                        }
                        self.shared.signal.wait_until(&mut state, instant);
                    }
                    None => self.shared.signal.wait(&mut state),
                }
            }
            drop(state);

            if let Some(Some(limit)) = deadline_at
                && Instant::now() >= limit
            {
                tracing::trace!(attempts = attempt, "retry budget exhausted");
                return None;
            }
        }
    }

    /// 替换间隔并唤醒全部等待者。
    pub fn reset(&self, interval: Duration) {
        let mut state = self.shared.state.lock();
        state.interval = interval;
        state.generation = state.generation.wrapping_add(1);
        self.shared.signal.notify_all();
    }

    /// 唤醒全部等待者立即重查。
    pub fn wake(&self) {
        let mut state = self.shared.state.lock();
        state.generation = state.generation.wrapping_add(1);
        self.shared.signal.notify_all();
    }

    /// 取消并唤醒全部等待者；返回 `true` 表示本次调用首次触发取消。
    ///
    /// 这是唯一的取消入口：取消位不对外暴露，置位与 `notify_all` 总是成对发生，
    /// 无上限等待者因此不会错过取消。
    pub fn cancel(&self) -> bool {
        let first = self.shared.cancellation.cancel();
        let _state = self.shared.state.lock();
        self.shared.signal.notify_all();
        first
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL)
    }
}

/// `Some(None)` 表示截止时间溢出，按无上限处理。
fn earliest(sleep_until: Option<Instant>, deadline: Option<Option<Instant>>) -> Option<Instant> {
    match (sleep_until, deadline.flatten()) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, limit) => limit,
    }
}
