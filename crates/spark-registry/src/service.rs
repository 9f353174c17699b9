//! 已发布能力的身份、引用与事件模型。

use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::properties::Properties;

/// 注册表分配的单调递增服务编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(u64);

impl ServiceId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 指向一次发布的轻量引用。
///
/// # 教案式说明
/// - **意图 (Why)**：绑定器需要在不持有实例的情况下比较候选、读取属性并判断实例是否仍然在线；
/// - **逻辑 (How)**：所有克隆共享同一份内部状态，`is_live` 与属性快照随注册句柄的操作实时更新；
/// - **契约 (What)**：相等性与哈希仅取决于 [`ServiceId`]；撤销后 `is_live` 永久返回 `false`；
/// - **风险 (Trade-offs)**：`properties` 返回调用时刻的快照，之后的 `set_properties` 不会回写到已取出的快照中。
#[derive(Clone)]
pub struct ServiceReference {
    inner: Arc<ReferenceState>,
}

struct ReferenceState {
    id: ServiceId,
    interfaces: Vec<String>,
    properties: RwLock<Arc<Properties>>,
    live: AtomicBool,
}

impl ServiceReference {
    /// 由注册表实现调用，外部通常无需直接构造。
    pub fn new(id: ServiceId, interfaces: Vec<String>, properties: Properties) -> Self {
        Self {
            inner: Arc::new(ReferenceState {
                id,
                interfaces,
                properties: RwLock::new(Arc::new(properties)),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> ServiceId {
        self.inner.id
    }

    pub fn interfaces(&self) -> &[String] {
        &self.inner.interfaces
    }

    /// 当前属性快照。
    pub fn properties(&self) -> Arc<Properties> {
        Arc::clone(&self.inner.properties.read())
    }

    pub fn ranking(&self) -> i64 {
        self.inner.properties.read().ranking()
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    /// 替换属性快照，供注册表实现在修改属性时调用。
    pub fn replace_properties(&self, properties: Properties) {
        *self.inner.properties.write() = Arc::new(properties);
    }

    /// 将引用标记为离线，返回本次调用是否完成了状态切换。
    pub fn mark_withdrawn(&self) -> bool {
        self.inner
            .live
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 候选优先级：排名高者优先，排名相同时编号小（发布更早）者优先。
    pub fn cmp_preference(&self, other: &ServiceReference) -> CmpOrdering {
        other
            .ranking()
            .cmp(&self.ranking())
            .then_with(|| self.id().cmp(&other.id()))
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ServiceReference {}

impl Hash for ServiceReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceReference")
            .field("id", &self.inner.id)
            .field("interfaces", &self.inner.interfaces)
            .field("live", &self.is_live())
            .finish()
    }
}

/// 类型擦除后的服务实例。
///
/// 内部保存的是 `Arc<S>` 本身（可为 `dyn Trait`），因此取回时只需按发布时的 `S` 下转型，
/// 不要求发布者与使用者共享具体实现类型。
#[derive(Clone)]
pub struct ServiceObject {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ServiceObject {
    pub fn new<S>(service: Arc<S>) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(service),
        }
    }

    /// 按发布时的能力类型取回实例；类型不符返回 `None`。
    pub fn downcast<S>(&self) -> Option<Arc<S>>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.inner.downcast_ref::<Arc<S>>().cloned()
    }
}

impl fmt::Debug for ServiceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceObject").finish_non_exhaustive()
    }
}

/// 注册表向订阅者投递的事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    /// 新发布且匹配订阅过滤器。
    Registered(ServiceReference),
    /// 属性变更后仍然（或首次）匹配。
    Modified(ServiceReference),
    /// 属性变更后不再匹配，订阅方应视同离开。
    ModifiedEndMatch(ServiceReference),
    /// 即将撤销，事件投递期间实例仍可获取。
    Unregistering(ServiceReference),
}

impl ServiceEvent {
    pub fn reference(&self) -> &ServiceReference {
        match self {
            ServiceEvent::Registered(reference)
            | ServiceEvent::Modified(reference)
            | ServiceEvent::ModifiedEndMatch(reference)
            | ServiceEvent::Unregistering(reference) => reference,
        }
    }

    /// 稳定的事件名，用于日志字段。
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceEvent::Registered(_) => "registered",
            ServiceEvent::Modified(_) => "modified",
            ServiceEvent::ModifiedEndMatch(_) => "modified_end_match",
            ServiceEvent::Unregistering(_) => "unregistering",
        }
    }

    /// 事件是否意味着订阅方失去该实例。
    pub fn is_departure(&self) -> bool {
        matches!(
            self,
            ServiceEvent::ModifiedEndMatch(_) | ServiceEvent::Unregistering(_)
        )
    }
}

/// 订阅回调。
///
/// 回调可能在任意线程上执行；同一服务编号的事件按发生顺序串行投递，不同编号之间没有顺序保证。
pub trait ServiceListener: Send + Sync {
    fn service_changed(&self, event: &ServiceEvent);
}

impl<F> ServiceListener for F
where
    F: Fn(&ServiceEvent) + Send + Sync,
{
    fn service_changed(&self, event: &ServiceEvent) {
        self(event)
    }
}
