//! 绑定/撤销与发布/撤销事件的监听器及其扇出通知。
//!
//! # 模块定位（Why）
//! - 绑定器与导出者需要把状态变化告知外部监听器，而监听器由第三方编写，可能返回错误甚至 panic；
//! - 任何一个监听器的失败都不得打断其余监听器，更不得传播给触发事件的调用方。
//!
//! # 核心机制（How）
//! - 监听器以强类型 trait 表达；按配置声明的回调形态（完整参数、只要实例、只要属性）在配置阶段
//!   构造成带标签的 [`BindHandler`] / [`RegistrationHandler`]，运行期只做一次 `match`；
//! - [`ListenerNotifier`] 在读锁下复制监听器快照后释放锁再逐个调用，回调内部可以安全地增删监听器；
//! - 每次调用都包在 `catch_unwind` 中，失败以 `warn` 级别记录并计入 [`NotificationReport`]。

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use spark_registry::Properties;

use crate::error::{BindingError, ListenerError, codes};

/// 监听器注册句柄，用于之后精确移除。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerToken(u64);

impl ListenerToken {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// 单基数或多基数引用的绑定事件监听器。
pub trait BindingListener<S: ?Sized>: Send + Sync {
    /// 新实例绑定后调用。
    fn bind(&self, service: &Arc<S>, properties: &Properties) -> Result<(), ListenerError> {
        let _ = (service, properties);
        Ok(())
    }

    /// 实例解绑后调用；调用期间实例对象仍然可用。
    fn unbind(&self, service: &Arc<S>, properties: &Properties) -> Result<(), ListenerError> {
        let _ = (service, properties);
        Ok(())
    }
}

/// 导出者发布/撤销事件的监听器。
pub trait RegistrationListener: Send + Sync {
    fn registered(&self, properties: &Properties) -> Result<(), ListenerError> {
        let _ = properties;
        Ok(())
    }

    fn unregistered(&self, properties: &Properties) -> Result<(), ListenerError> {
        let _ = properties;
        Ok(())
    }
}

type FullFn<S> = dyn Fn(&Arc<S>, &Properties) -> Result<(), ListenerError> + Send + Sync;
type ServiceFn<S> = dyn Fn(&Arc<S>) -> Result<(), ListenerError> + Send + Sync;
type PropertiesFn = dyn Fn(&Properties) -> Result<(), ListenerError> + Send + Sync;
type NotifyFn = dyn Fn() -> Result<(), ListenerError> + Send + Sync;

/// 绑定回调的三种声明形态。
pub enum BindHandler<S: ?Sized> {
    /// 同时接收实例与属性。
    Full(Arc<FullFn<S>>),
    /// 只接收实例。
    ServiceOnly(Arc<ServiceFn<S>>),
    /// 只接收属性快照。
    PropertiesOnly(Arc<PropertiesFn>),
}

impl<S: ?Sized> BindHandler<S> {
    pub fn full<F>(handler: F) -> Self
    where
        F: Fn(&Arc<S>, &Properties) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        BindHandler::Full(Arc::new(handler))
    }

    pub fn service_only<F>(handler: F) -> Self
    where
        F: Fn(&Arc<S>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        BindHandler::ServiceOnly(Arc::new(handler))
    }

    pub fn properties_only<F>(handler: F) -> Self
    where
        F: Fn(&Properties) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        BindHandler::PropertiesOnly(Arc::new(handler))
    }

    fn dispatch(&self, service: &Arc<S>, properties: &Properties) -> Result<(), ListenerError> {
        match self {
            BindHandler::Full(handler) => handler(service, properties),
            BindHandler::ServiceOnly(handler) => handler(service),
            BindHandler::PropertiesOnly(handler) => handler(properties),
        }
    }
}

impl<S: ?Sized> Clone for BindHandler<S> {
    fn clone(&self) -> Self {
        match self {
            BindHandler::Full(handler) => BindHandler::Full(Arc::clone(handler)),
            BindHandler::ServiceOnly(handler) => BindHandler::ServiceOnly(Arc::clone(handler)),
            BindHandler::PropertiesOnly(handler) => BindHandler::PropertiesOnly(Arc::clone(handler)),
        }
    }
}

impl<S: ?Sized> fmt::Debug for BindHandler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            BindHandler::Full(_) => "Full",
            BindHandler::ServiceOnly(_) => "ServiceOnly",
            BindHandler::PropertiesOnly(_) => "PropertiesOnly",
        };
        f.debug_tuple("BindHandler").field(&shape).finish()
    }
}

/// 由声明式回调组装的绑定监听器。
pub struct HandlerListener<S: ?Sized> {
    on_bind: Option<BindHandler<S>>,
    on_unbind: Option<BindHandler<S>>,
}

impl<S: ?Sized> HandlerListener<S> {
    pub fn new(on_bind: Option<BindHandler<S>>, on_unbind: Option<BindHandler<S>>) -> Self {
        Self { on_bind, on_unbind }
    }
}

impl<S: ?Sized + Send + Sync> BindingListener<S> for HandlerListener<S> {
    fn bind(&self, service: &Arc<S>, properties: &Properties) -> Result<(), ListenerError> {
        match &self.on_bind {
            Some(handler) => handler.dispatch(service, properties),
            None => Ok(()),
        }
    }

    fn unbind(&self, service: &Arc<S>, properties: &Properties) -> Result<(), ListenerError> {
        match &self.on_unbind {
            Some(handler) => handler.dispatch(service, properties),
            None => Ok(()),
        }
    }
}

/// 发布回调的两种声明形态。
#[derive(Clone)]
pub enum RegistrationHandler {
    /// 接收发布属性。
    Properties(Arc<PropertiesFn>),
    /// 只关心事件本身。
    Notify(Arc<NotifyFn>),
}

impl RegistrationHandler {
    pub fn properties<F>(handler: F) -> Self
    where
        F: Fn(&Properties) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        RegistrationHandler::Properties(Arc::new(handler))
    }

    pub fn notify<F>(handler: F) -> Self
    where
        F: Fn() -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        RegistrationHandler::Notify(Arc::new(handler))
    }

    fn dispatch(&self, properties: &Properties) -> Result<(), ListenerError> {
        match self {
            RegistrationHandler::Properties(handler) => handler(properties),
            RegistrationHandler::Notify(handler) => handler(),
        }
    }
}

impl fmt::Debug for RegistrationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            RegistrationHandler::Properties(_) => "Properties",
            RegistrationHandler::Notify(_) => "Notify",
        };
        f.debug_tuple("RegistrationHandler").field(&shape).finish()
    }
}

/// 由声明式回调组装的发布监听器。
pub struct RegistrationHandlerListener {
    on_registered: Option<RegistrationHandler>,
    on_unregistered: Option<RegistrationHandler>,
}

impl RegistrationHandlerListener {
    pub fn new(
        on_registered: Option<RegistrationHandler>,
        on_unregistered: Option<RegistrationHandler>,
    ) -> Self {
        Self {
            on_registered,
            on_unregistered,
        }
    }
}

impl RegistrationListener for RegistrationHandlerListener {
    fn registered(&self, properties: &Properties) -> Result<(), ListenerError> {
        match &self.on_registered {
            Some(handler) => handler.dispatch(properties),
            None => Ok(()),
        }
    }

    fn unregistered(&self, properties: &Properties) -> Result<(), ListenerError> {
        match &self.on_unregistered {
            Some(handler) => handler.dispatch(properties),
            None => Ok(()),
        }
    }
}

/// 一次扇出通知的结果。
#[derive(Debug, Default)]
pub struct NotificationReport {
    delivered: usize,
    failures: Vec<BindingError>,
}

impl NotificationReport {
    /// 成功返回的监听器数量。
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// 每个失败监听器对应一条 [`BindingError::ListenerFailure`]。
    pub fn failures(&self) -> &[BindingError] {
        &self.failures
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct NamedListener<L: ?Sized> {
    token: ListenerToken,
    name: Arc<str>,
    listener: Arc<L>,
}

impl<L: ?Sized> Clone for NamedListener<L> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            name: Arc::clone(&self.name),
            listener: Arc::clone(&self.listener),
        }
    }
}

/// 隔离失败的监听器扇出器。
///
/// # 教案式说明
/// - **意图 (Why)**：统一“逐个调用、失败记录、继续下一个”的通知语义，绑定器、导出者与满足度通知共用；
/// - **逻辑 (How)**：读锁内复制快照、锁外调用，回调内对本扇出器的增删只影响下一次通知；
/// - **契约 (What)**：`notify` 从不 panic、从不返回错误；失败以 `binding.listener_failure` 记录；
/// - **风险 (Trade-offs)**：并发 `notify` 之间不保证顺序，调用方需自行串行化（绑定器使用转换锁）。
pub struct ListenerNotifier<L: ?Sized> {
    listeners: RwLock<Vec<NamedListener<L>>>,
    next_token: AtomicU64,
}

impl<L: ?Sized> ListenerNotifier<L> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// 追加监听器，返回移除句柄。
    pub fn add(&self, name: impl Into<String>, listener: Arc<L>) -> ListenerToken {
        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let name: String = name.into();
        self.listeners.write().push(NamedListener {
            token,
            name: Arc::from(name),
            listener,
        });
        token
    }

    pub fn remove(&self, token: ListenerToken) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.token != token);
        listeners.len() != before
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// 依次调用全部监听器。
    pub fn notify<F>(&self, event: &'static str, call: F) -> NotificationReport
    where
        F: Fn(&L) -> Result<(), ListenerError>,
    {
        let snapshot: Vec<NamedListener<L>> = self.listeners.read().clone();
        let mut report = NotificationReport::default();
        for entry in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| call(&entry.listener)));
            let detail = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(err)) => err.message().to_owned(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            tracing::warn!(
                code = codes::LISTENER_FAILURE,
                listener = %entry.name,
                event,
                detail = %detail,
                "listener failed; continuing with remaining listeners"
            );
            report.failures.push(BindingError::ListenerFailure {
                listener: entry.name.to_string(),
                detail,
            });
        }
        report
    }
}

impl<L: ?Sized> Default for ListenerNotifier<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> fmt::Debug for ListenerNotifier<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<Arc<str>> = self
            .listeners
            .read()
            .iter()
            .map(|entry| Arc::clone(&entry.name))
            .collect();
        f.debug_struct("ListenerNotifier")
            .field("listeners", &names)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
