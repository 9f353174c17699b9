//! 注册表契约：查询、订阅与发布。
//!
//! # 模块定位（Why）
//! - 绑定层与依赖追踪层只依赖本模块定义的对象安全 trait，具体存储实现可替换；
//! - 发布与订阅均返回显式句柄，调用方通过句柄撤销，而不是依赖对象身份在全局表中反查。
//!
//! # 契约说明（What）
//! - [`Registry::find`] 返回的引用按 [`ServiceReference::cmp_preference`] 排序，只包含在线实例；
//! - [`Registry::subscribe`] 注册后的事件投递可能发生在任意线程，同一服务编号的事件保持发生顺序；
//! - [`Registration::withdraw`] 与 [`Subscription::cancel`] 均幂等。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;

use crate::filter::Filter;
use crate::properties::Properties;
use crate::service::{ServiceId, ServiceListener, ServiceObject, ServiceReference};

/// 注册表操作错误。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// 发布时未声明任何接口名。
    #[error("a capability must be published under at least one interface")]
    NoInterfaces,
    /// 对已撤销的发布执行修改。
    #[error("service {service} has already been withdrawn")]
    Withdrawn { service: ServiceId },
}

/// 进程内注册表。
pub trait Registry: Send + Sync {
    /// 查询满足过滤器的在线实例，按偏好排序。
    fn find(&self, filter: &Filter) -> Vec<ServiceReference>;

    /// 取出实例；引用已撤销时返回 `None`。
    fn get_service(&self, reference: &ServiceReference) -> Option<ServiceObject>;

    /// 读取当前属性快照。
    fn properties(&self, reference: &ServiceReference) -> Option<Arc<Properties>>;

    /// 订阅满足过滤器的实例变化。
    fn subscribe(&self, filter: Filter, listener: Arc<dyn ServiceListener>) -> Subscription;

    /// 以若干接口名发布实例。
    fn publish(
        &self,
        interfaces: &[String],
        properties: Properties,
        service: ServiceObject,
    ) -> Result<Registration, RegistryError>;
}

/// 句柄回调到注册表实现的内部通道。
///
/// 只有注册表实现需要关心；句柄持有其弱引用，注册表被释放后句柄操作退化为本地状态更新。
pub trait RegistryBackend: Send + Sync {
    fn update_properties(
        &self,
        reference: &ServiceReference,
        properties: Properties,
    ) -> Result<(), RegistryError>;

    fn withdraw(&self, reference: &ServiceReference) -> bool;

    fn unsubscribe(&self, subscription: u64);
}

/// 一次发布的控制句柄。
#[derive(Clone)]
pub struct Registration {
    reference: ServiceReference,
    backend: Weak<dyn RegistryBackend>,
}

impl Registration {
    pub fn new(reference: ServiceReference, backend: Weak<dyn RegistryBackend>) -> Self {
        Self { reference, backend }
    }

    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }

    pub fn is_live(&self) -> bool {
        self.reference.is_live()
    }

    /// 替换发布属性，保留键由注册表重新写入。
    pub fn set_properties(&self, properties: Properties) -> Result<(), RegistryError> {
        match self.backend.upgrade() {
            Some(backend) => backend.update_properties(&self.reference, properties),
            None => Err(RegistryError::Withdrawn {
                service: self.reference.id(),
            }),
        }
    }

    /// 撤销发布；返回 `true` 表示本次调用完成了撤销。
    pub fn withdraw(&self) -> bool {
        match self.backend.upgrade() {
            Some(backend) => backend.withdraw(&self.reference),
            None => self.reference.mark_withdrawn(),
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("reference", &self.reference)
            .finish()
    }
}

/// 订阅句柄。释放句柄不会取消订阅，必须显式调用 [`Subscription::cancel`]。
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    backend: Weak<dyn RegistryBackend>,
}

impl Subscription {
    pub fn new(id: u64, active: Arc<AtomicBool>, backend: Weak<dyn RegistryBackend>) -> Self {
        Self {
            id,
            active,
            backend,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// 取消订阅；返回 `true` 表示本次调用完成了取消。此后开始的投递会跳过该订阅。
    pub fn cancel(&self) -> bool {
        let first = self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first && let Some(backend) = self.backend.upgrade() {
            backend.unsubscribe(self.id);
        }
        first
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
