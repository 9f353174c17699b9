//! 多基数引用绑定器。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, ReentrantMutex};
use spark_registry::{Registry, ServiceEvent, ServiceListener, ServiceReference, Subscription};

use super::{
    BoundService, CapabilityReference, Importer, ImporterId, SatisfactionListener,
    SatisfactionState, resolve_bound,
};
use crate::collection::{Cursor, DynamicCollection};
use crate::error::{BindingError, codes};
use crate::listener::{BindHandler, BindingListener, HandlerListener, ListenerNotifier, ListenerToken};
use crate::retry::{RetryDeadline, RetryPolicy};

/// 持有 `0..N` 或 `1..N` 引用的动态集合视图。克隆共享同一绑定状态。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方需要遍历“当前所有匹配实例”，且遍历期间实例可以随时到达或离开；
/// - **逻辑 (How)**：实例保存在 [`DynamicCollection`] 中，注册表事件在转换锁内增删元素；
///   引用声明了排序时按排序插入，否则按到达顺序追加；同一发布只保留一份；
/// - **契约 (What)**：
///   - 属性变更但仍匹配的实例：未声明排序时原位刷新，声明排序时移除后重新按序插入，二者都不触发绑定事件；
///   - 离开的实例先从集合移除，再通知解绑监听器；集合变空时强制引用转为不满足；
///   - 游标的一致性保证见 [`DynamicCollection`]。
pub struct CollectionBinder<S: ?Sized + Send + Sync + 'static> {
    inner: Arc<MultiInner<S>>,
}

struct MultiInner<S: ?Sized + Send + Sync + 'static> {
    reference: CapabilityReference,
    registry: Arc<dyn Registry>,
    transition: ReentrantMutex<()>,
    services: DynamicCollection<BoundService<S>>,
    retry: RetryPolicy,
    listeners: ListenerNotifier<dyn BindingListener<S>>,
    satisfaction: SatisfactionState,
    subscription: Mutex<Option<Subscription>>,
    destroyed: AtomicBool,
}

impl<S: ?Sized + Send + Sync + 'static> CollectionBinder<S> {
    pub fn new(
        reference: CapabilityReference,
        registry: Arc<dyn Registry>,
    ) -> Result<Self, BindingError> {
        Self::with_retry(reference, registry, &RetryPolicy::default())
    }

    /// 以给定策略的间隔与退避构造绑定器专属的重试循环。
    pub fn with_retry(
        reference: CapabilityReference,
        registry: Arc<dyn Registry>,
        template: &RetryPolicy,
    ) -> Result<Self, BindingError> {
        if !reference.cardinality().is_multiple() {
            return Err(BindingError::invalid(format!(
                "reference `{}` has cardinality {}; use a reference binder",
                reference.name(),
                reference.cardinality()
            )));
        }
        let services = match reference.ordering().cloned() {
            Some(ordering) => DynamicCollection::with_ordering(
                move |left: &BoundService<S>, right: &BoundService<S>| {
                    ordering.compare(left.reference(), right.reference())
                },
            ),
            None => DynamicCollection::new(),
        };
        let inner = Arc::new(MultiInner {
            satisfaction: SatisfactionState::new(reference.is_mandatory()),
            reference,
            registry,
            transition: ReentrantMutex::new(()),
            services,
            retry: RetryPolicy::new(template.interval()).with_backoff(template.backoff()),
            listeners: ListenerNotifier::new(),
            subscription: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let weak: Weak<MultiInner<S>> = Arc::downgrade(&inner);
        let listener: Arc<dyn ServiceListener> = Arc::new(move |event: &ServiceEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_service_event(event);
            }
        });
        let subscription = inner
            .registry
            .subscribe(inner.reference.effective_filter().clone(), listener);
        *inner.subscription.lock() = Some(subscription);

        {
            let _transition = inner.transition.lock();
            for candidate in inner.registry.find(inner.reference.effective_filter()) {
                inner.admit(&candidate);
            }
        }
        tracing::debug!(
            reference = inner.reference.name(),
            filter = %inner.reference.effective_filter(),
            bound = inner.services.len(),
            "collection binder created"
        );
        Ok(Self { inner })
    }

    pub fn reference(&self) -> &CapabilityReference {
        &self.inner.reference
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// 共享底层存储的集合视图。
    pub fn collection(&self) -> DynamicCollection<BoundService<S>> {
        self.inner.services.clone()
    }

    /// 在线实例游标；遍历期间的到达与离开按集合一致性规则反映。
    pub fn iter(&self) -> Cursor<BoundService<S>> {
        self.inner.services.cursor()
    }

    pub fn snapshot(&self) -> Vec<BoundService<S>> {
        self.inner.services.snapshot()
    }

    /// 当前全部实例对象。
    pub fn services(&self) -> Vec<Arc<S>> {
        self.inner
            .services
            .snapshot()
            .into_iter()
            .map(|bound| Arc::clone(bound.service()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.services.is_empty()
    }

    /// 返回当前实例快照；强制引用在集合为空时按超时等待第一个实例到达。
    pub fn available(&self) -> Result<Vec<BoundService<S>>, BindingError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let snapshot = inner.services.snapshot();
        if !snapshot.is_empty() || !inner.reference.is_mandatory() {
            return Ok(snapshot);
        }
        let started = Instant::now();
        let timeout = inner.reference.timeout();
        let arrived = if timeout.is_zero() {
            None
        } else {
            inner.retry.execute(RetryDeadline::Within(timeout), || {
                let snapshot = inner.services.snapshot();
                (!snapshot.is_empty()).then_some(snapshot)
            })
        };
        if let Some(snapshot) = arrived {
            return Ok(snapshot);
        }
        inner.ensure_alive()?;
        let waited = started.elapsed();
        tracing::warn!(
            code = codes::SERVICE_UNAVAILABLE,
            reference = inner.reference.name(),
            filter = %inner.reference.effective_filter(),
            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            "no capability became available before the deadline"
        );
        Err(BindingError::ServiceUnavailable {
            reference: inner.reference.name().to_owned(),
            filter: inner.reference.effective_filter().to_string(),
            waited,
        })
    }

    pub fn add_listener(
        &self,
        name: impl Into<String>,
        listener: Arc<dyn BindingListener<S>>,
    ) -> ListenerToken {
        self.inner.listeners.add(name, listener)
    }

    pub fn add_bind_listener(&self, name: impl Into<String>, handler: BindHandler<S>) -> ListenerToken {
        self.add_listener(name, Arc::new(HandlerListener::new(Some(handler), None)))
    }

    pub fn add_unbind_listener(
        &self,
        name: impl Into<String>,
        handler: BindHandler<S>,
    ) -> ListenerToken {
        self.add_listener(name, Arc::new(HandlerListener::new(None, Some(handler))))
    }

    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        self.inner.listeners.remove(token)
    }

    /// 拆除绑定器：取消订阅、中断等待，逐个移除实例并通知解绑，最后静默清空满足度监听器。
    pub fn destroy(&self) -> bool {
        let inner = &self.inner;
        let _transition = inner.transition.lock();
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(subscription) = inner.subscription.lock().take() {
            subscription.cancel();
        }
        inner.retry.cancel();
        while let Some(removed) = inner.services.remove_at(0) {
            inner.notify_unbind(&removed);
        }
        inner.satisfaction.retire();
        tracing::debug!(reference = inner.reference.name(), "collection binder destroyed");
        true
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}

impl<S: ?Sized + Send + Sync + 'static> MultiInner<S> {
    fn ensure_alive(&self) -> Result<(), BindingError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(BindingError::Destroyed {
                reference: self.reference.name().to_owned(),
            });
        }
        Ok(())
    }

    /// 调用方持有转换锁。已在集合中的发布直接忽略。
    fn admit(&self, candidate: &ServiceReference) {
        if !candidate.is_live() || self.find_bound(candidate).is_some() {
            return;
        }
        let Some(bound) = resolve_bound::<S>(&*self.registry, candidate, self.reference.name())
        else {
            return;
        };
        let position = self.services.add(bound.clone());
        tracing::debug!(
            reference = self.reference.name(),
            service.id = bound.service_id().get(),
            position,
            "capability bound"
        );
        self.listeners
            .notify("bind", |listener| listener.bind(bound.service(), bound.properties()));
        self.satisfaction.update(true, self.reference.name());
    }

    fn find_bound(&self, candidate: &ServiceReference) -> Option<BoundService<S>> {
        self.services
            .find(|bound| bound.reference() == candidate)
    }

    fn notify_unbind(&self, removed: &BoundService<S>) {
        tracing::debug!(
            reference = self.reference.name(),
            service.id = removed.service_id().get(),
            "capability unbound"
        );
        self.listeners.notify("unbind", |listener| {
            listener.unbind(removed.service(), removed.properties())
        });
    }

    fn on_service_event(&self, event: &ServiceEvent) {
        let _transition = self.transition.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let changed = event.reference();
        tracing::trace!(
            reference = self.reference.name(),
            service.id = changed.id().get(),
            event = event.kind(),
            "registry event"
        );
        if event.is_departure() {
            if let Some(removed) = self
                .services
                .remove_where(|bound| bound.reference() == changed)
            {
                self.notify_unbind(&removed);
                if self.services.is_empty() {
                    self.satisfaction.update(false, self.reference.name());
                }
            }
            return;
        }
        match self.find_bound(changed) {
            Some(existing) if matches!(event, ServiceEvent::Modified(_)) => {
                let refreshed = existing.refreshed();
                if self.reference.ordering().is_some() {
                    if self
                        .services
                        .remove_where(|bound| bound.reference() == changed)
                        .is_some()
                    {
                        self.services.add(refreshed);
                    }
                } else {
                    self.services
                        .replace_where(|bound| bound.reference() == changed, refreshed);
                }
            }
            Some(_) => {}
            None => self.admit(changed),
        }
        self.retry.wake();
    }
}

impl<S: ?Sized + Send + Sync + 'static> Drop for MultiInner<S> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.cancel();
        }
        self.retry.cancel();
    }
}

impl<S: ?Sized + Send + Sync + 'static> Importer for CollectionBinder<S> {
    fn id(&self) -> ImporterId {
        self.inner.satisfaction.id
    }

    fn name(&self) -> &str {
        self.inner.reference.name()
    }

    fn is_mandatory(&self) -> bool {
        self.inner.reference.is_mandatory()
    }

    fn is_satisfied(&self) -> bool {
        self.inner.satisfaction.is_satisfied()
    }

    fn add_satisfaction_listener(&self, listener: Arc<dyn SatisfactionListener>) -> ListenerToken {
        self.inner
            .satisfaction
            .listeners
            .add(self.inner.reference.name(), listener)
    }

    fn remove_satisfaction_listener(&self, token: ListenerToken) -> bool {
        self.inner.satisfaction.listeners.remove(token)
    }
}

impl<S: ?Sized + Send + Sync + 'static> Clone for CollectionBinder<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ?Sized + Send + Sync + 'static> fmt::Debug for CollectionBinder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionBinder")
            .field("reference", &self.inner.reference.name())
            .field("bound", &self.inner.services.len())
            .field("destroyed", &self.inner.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}
