//! 进程内注册表实现。
//!
//! # 教案式说明
//! - **意图 (Why)**：为绑定层、测试与演示程序提供一个线程安全、语义完整的注册表；
//! - **逻辑 (How)**：
//!   1. 服务表与订阅表放在同一把 `RwLock` 之下，查询只取读锁；
//!   2. 事件在释放表锁之后于变更线程上投递，订阅回调可以安全地回调注册表；
//!   3. 每个发布持有一把可重入的事件锁，发布、改属性与撤销在该锁内完成“变更 + 投递”，
//!      因此同一服务编号的事件严格按发生顺序到达，且回调内对同一发布的再次操作不会自锁；
//! - **契约 (What)**：撤销时先将引用标记离线再投递 `Unregistering`，投递期间 `find` 不再返回它，
//!   但 `get_service` 仍可取到实例；
//! - **风险 (Trade-offs)**：订阅回调中的 panic 会被捕获并记录，不会中断其余订阅者，也不会传播给发布方。

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, RwLock};

use crate::filter::Filter;
use crate::properties::{OBJECT_CLASS, Properties, PropertyValue, SERVICE_ID};
use crate::registry::{Registration, Registry, RegistryBackend, RegistryError, Subscription};
use crate::service::{ServiceEvent, ServiceId, ServiceListener, ServiceObject, ServiceReference};

/// 基于内存表的 [`Registry`] 实现，克隆共享同一份状态。
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    next_service: AtomicU64,
    next_subscription: AtomicU64,
    tables: RwLock<Tables>,
}

#[derive(Default)]
struct Tables {
    services: BTreeMap<ServiceId, ServiceEntry>,
    subscriptions: BTreeMap<u64, SubscriptionEntry>,
}

struct ServiceEntry {
    reference: ServiceReference,
    object: ServiceObject,
    events: Arc<ReentrantMutex<()>>,
}

#[derive(Clone)]
struct SubscriptionEntry {
    id: u64,
    filter: Arc<Filter>,
    listener: Arc<dyn ServiceListener>,
    active: Arc<AtomicBool>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前在线的发布数量。
    pub fn service_count(&self) -> usize {
        self.shared.tables.read().services.len()
    }

    /// 当前有效的订阅数量。
    pub fn subscription_count(&self) -> usize {
        self.shared.tables.read().subscriptions.len()
    }

    fn backend(&self) -> Weak<dyn RegistryBackend> {
        Arc::downgrade(&self.shared) as Weak<dyn RegistryBackend>
    }
}

impl Shared {
    fn events_of(&self, id: ServiceId) -> Option<Arc<ReentrantMutex<()>>> {
        self.tables
            .read()
            .services
            .get(&id)
            .map(|entry| Arc::clone(&entry.events))
    }

    fn subscribers(&self) -> Vec<SubscriptionEntry> {
        self.tables.read().subscriptions.values().cloned().collect()
    }

    fn deliver(subscriber: &SubscriptionEntry, event: &ServiceEvent) {
        if !subscriber.active.load(Ordering::Acquire) {
            return;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            subscriber.listener.service_changed(event)
        }));
        if outcome.is_err() {
            tracing::warn!(
                subscription = subscriber.id,
                service.id = event.reference().id().get(),
                event = event.kind(),
                "service listener panicked; remaining subscribers still notified"
            );
        }
    }
}

/// 写入保留键：接口列表与服务编号总以注册表为准。
fn stamp(mut properties: Properties, id: ServiceId, interfaces: &[String]) -> Properties {
    properties.insert(
        OBJECT_CLASS,
        PropertyValue::List(interfaces.iter().cloned().map(PropertyValue::Str).collect()),
    );
    properties.insert(SERVICE_ID, id.get());
    properties
}

impl Registry for InMemoryRegistry {
    fn find(&self, filter: &Filter) -> Vec<ServiceReference> {
        let mut matches: Vec<ServiceReference> = self
            .shared
            .tables
            .read()
            .services
            .values()
            .filter(|entry| entry.reference.is_live())
            .filter(|entry| filter.matches(&entry.reference.properties()))
            .map(|entry| entry.reference.clone())
            .collect();
        matches.sort_by(ServiceReference::cmp_preference);
        matches
    }

    fn get_service(&self, reference: &ServiceReference) -> Option<ServiceObject> {
        self.shared
            .tables
            .read()
            .services
            .get(&reference.id())
            .map(|entry| entry.object.clone())
    }

    fn properties(&self, reference: &ServiceReference) -> Option<Arc<Properties>> {
        self.shared
            .tables
            .read()
            .services
            .contains_key(&reference.id())
            .then(|| reference.properties())
    }

    fn subscribe(&self, filter: Filter, listener: Arc<dyn ServiceListener>) -> Subscription {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        let active = Arc::new(AtomicBool::new(true));
        let entry = SubscriptionEntry {
            id,
            filter: Arc::new(filter),
            listener,
            active: Arc::clone(&active),
        };
        self.shared.tables.write().subscriptions.insert(id, entry);
        tracing::trace!(subscription = id, "subscription added");
        Subscription::new(id, active, self.backend())
    }

    fn publish(
        &self,
        interfaces: &[String],
        properties: Properties,
        service: ServiceObject,
    ) -> Result<Registration, RegistryError> {
        if interfaces.is_empty() {
            return Err(RegistryError::NoInterfaces);
        }
        let id = ServiceId::new(self.shared.next_service.fetch_add(1, Ordering::Relaxed) + 1);
        let reference = ServiceReference::new(id, interfaces.to_vec(), stamp(properties, id, interfaces));
        let events = Arc::new(ReentrantMutex::new(()));
        let _ordered = events.lock();
        self.shared.tables.write().services.insert(
            id,
            ServiceEntry {
                reference: reference.clone(),
                object: service,
                events: Arc::clone(&events),
            },
        );
        tracing::debug!(
            service.id = id.get(),
            interfaces = ?interfaces,
            "capability published"
        );

        let event = ServiceEvent::Registered(reference.clone());
        let snapshot = reference.properties();
        for subscriber in self.shared.subscribers() {
            if subscriber.filter.matches(&snapshot) {
                Shared::deliver(&subscriber, &event);
            }
        }
        Ok(Registration::new(reference, self.backend()))
    }
}

impl RegistryBackend for Shared {
    fn update_properties(
        &self,
        reference: &ServiceReference,
        properties: Properties,
    ) -> Result<(), RegistryError> {
        let withdrawn = RegistryError::Withdrawn {
            service: reference.id(),
        };
        let events = self.events_of(reference.id()).ok_or(withdrawn.clone())?;
        let _ordered = events.lock();
        if !reference.is_live() {
            return Err(withdrawn);
        }
        let before = reference.properties();
        reference.replace_properties(stamp(properties, reference.id(), reference.interfaces()));
        let after = reference.properties();

        for subscriber in self.subscribers() {
            let matched = subscriber.filter.matches(&before);
            let matches = subscriber.filter.matches(&after);
            let event = match (matched, matches) {
                (_, true) => ServiceEvent::Modified(reference.clone()),
                (true, false) => ServiceEvent::ModifiedEndMatch(reference.clone()),
                (false, false) => continue,
            };
            Self::deliver(&subscriber, &event);
        }
        Ok(())
    }

    fn withdraw(&self, reference: &ServiceReference) -> bool {
        let Some(events) = self.events_of(reference.id()) else {
            return reference.mark_withdrawn();
        };
        let _ordered = events.lock();
        if !reference.mark_withdrawn() {
            return false;
        }

        let event = ServiceEvent::Unregistering(reference.clone());
        let snapshot = reference.properties();
        for subscriber in self.subscribers() {
            if subscriber.filter.matches(&snapshot) {
                Self::deliver(&subscriber, &event);
            }
        }
        self.tables.write().services.remove(&reference.id());
        tracing::debug!(service.id = reference.id().get(), "capability withdrawn");
        true
    }

    fn unsubscribe(&self, subscription: u64) {
        self.tables.write().subscriptions.remove(&subscription);
        tracing::trace!(subscription, "subscription cancelled");
    }
}
