//! 线程级环境上下文。
//!
//! # 教案式说明
//! - **意图 (Why)**：部分能力在调用期间依赖“当前上下文”（例如租户或发布方所属的运行环境），
//!   绑定器可按引用配置在调用前替换该上下文，调用后无条件恢复；
//! - **逻辑 (How)**：上下文存放在线程局部槽中，[`enter`] 返回的 [`ContextGuard`] 在析构时写回旧值，
//!   因此即使调用 panic 展开，旧值也会被恢复；
//! - **契约 (What)**：守卫不可跨线程移动；嵌套进入按后进先出恢复。

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

thread_local! {
    static AMBIENT: RefCell<Option<Arc<str>>> = const { RefCell::new(None) };
}

/// 绑定器在转发调用时如何处理环境上下文。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextPolicy {
    /// 不触碰调用线程的上下文。
    #[default]
    Unmanaged,
    /// 使用绑定器创建时所在线程的上下文。
    Client,
    /// 使用发布方在 `provider.context` 属性中声明的上下文。
    ServiceProvider,
}

/// 读取当前线程的环境上下文。
pub fn current() -> Option<Arc<str>> {
    AMBIENT.with(|slot| slot.borrow().clone())
}

/// 替换当前线程的环境上下文，返回负责恢复的守卫。
pub fn enter(context: Option<Arc<str>>) -> ContextGuard {
    let previous = AMBIENT.with(|slot| slot.replace(context));
    ContextGuard {
        previous: Some(previous),
        _thread_bound: PhantomData,
    }
}

/// 在指定上下文中执行闭包。
pub fn scope<R>(context: Option<Arc<str>>, body: impl FnOnce() -> R) -> R {
    let _guard = enter(context);
    body()
}

/// 离开作用域时恢复进入前的上下文。
#[must_use = "dropping the guard immediately restores the previous context"]
pub struct ContextGuard {
    previous: Option<Option<Arc<str>>>,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            AMBIENT.with(|slot| {
                *slot.borrow_mut() = previous;
            });
        }
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("restores", &self.previous)
            .finish()
    }
}
