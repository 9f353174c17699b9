//! 单基数引用绑定器。

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, ReentrantMutex};
use spark_registry::{Registry, ServiceEvent, ServiceListener, Subscription};

use super::{
    BoundService, CapabilityReference, Importer, ImporterId, OnUnavailable, SatisfactionListener,
    SatisfactionState, enter_context, resolve_bound,
};
use crate::ambient;
use crate::error::{BindingError, codes};
use crate::listener::{BindHandler, BindingListener, HandlerListener, ListenerNotifier, ListenerToken};
use crate::retry::{RetryDeadline, RetryPolicy};

/// 持有 `0..1` 或 `1..1` 引用的稳定句柄。克隆共享同一绑定状态。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方始终通过同一个句柄调用能力，具体实例的替换对其透明；
/// - **逻辑 (How)**：
///   1. 构造时先订阅生效过滤器，再查询一次现有实例，二者之间到达的发布不会丢失；
///   2. 已绑定实例保持粘滞：更优候选出现不会抢占，只在当前实例离开时才换绑；
///   3. 当前实例离开时立即查询替代者，找不到则把满足度置为 `false`；
///   4. [`ReferenceBinder::invoke`] 先走无锁快路径，读到的句柄若已撤销则转入加锁重查，仍失败再按超时重试；
/// - **契约 (What)**：
///   - `invoke` 永远不会把已撤销的实例交给调用方；
///   - 绑定/解绑监听器在转换锁内按发生顺序调用，监听器失败只记录不传播；
///   - 拆除后所有调用返回 [`BindingError::Destroyed`]；
/// - **风险 (Trade-offs)**：“校验在线”与“执行调用”之间仍存在窗口，实例可能在调用期间被撤销；
///   撤销事件投递期间实例对象依旧可用，因此这一窗口不会访问到已释放的状态。
pub struct ReferenceBinder<S: ?Sized + Send + Sync + 'static> {
    inner: Arc<SingleInner<S>>,
}

struct SingleInner<S: ?Sized + Send + Sync + 'static> {
    reference: CapabilityReference,
    registry: Arc<dyn Registry>,
    transition: ReentrantMutex<()>,
    current: ArcSwapOption<BoundService<S>>,
    retry: RetryPolicy,
    fallback: Option<Arc<S>>,
    listeners: ListenerNotifier<dyn BindingListener<S>>,
    satisfaction: SatisfactionState,
    subscription: Mutex<Option<Subscription>>,
    destroyed: AtomicBool,
    client_context: Option<Arc<str>>,
}

/// [`ReferenceBinder`] 构建器。
pub struct ReferenceBinderBuilder<S: ?Sized + Send + Sync + 'static> {
    reference: CapabilityReference,
    registry: Arc<dyn Registry>,
    fallback: Option<Arc<S>>,
    retry: Option<RetryPolicy>,
}

impl<S: ?Sized + Send + Sync + 'static> ReferenceBinderBuilder<S> {
    /// 等待超时后使用的兜底实例；仅对 `on_unavailable = fallback` 的可选引用合法。
    #[must_use]
    pub fn fallback(mut self, fallback: Arc<S>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// 以给定策略的间隔与退避构造绑定器专属的重试循环。
    #[must_use]
    pub fn retry(mut self, template: &RetryPolicy) -> Self {
        self.retry = Some(RetryPolicy::new(template.interval()).with_backoff(template.backoff()));
        self
    }

    pub fn build(self) -> Result<ReferenceBinder<S>, BindingError> {
        let reference = self.reference;
        if reference.cardinality().is_multiple() {
            return Err(BindingError::invalid(format!(
                "reference `{}` has cardinality {}; use a collection binder",
                reference.name(),
                reference.cardinality()
            )));
        }
        match (reference.on_unavailable(), &self.fallback) {
            (OnUnavailable::Fallback, None) => {
                return Err(BindingError::invalid(format!(
                    "reference `{}` falls back on timeout but no fallback instance was supplied",
                    reference.name()
                )));
            }
            (OnUnavailable::Fail, Some(_)) => {
                return Err(BindingError::invalid(format!(
                    "reference `{}` was given a fallback instance but its policy is `fail`",
                    reference.name()
                )));
            }
            _ => {}
        }

        let inner = Arc::new(SingleInner {
            satisfaction: SatisfactionState::new(reference.is_mandatory()),
            reference,
            registry: self.registry,
            transition: ReentrantMutex::new(()),
            current: ArcSwapOption::empty(),
            retry: self.retry.unwrap_or_default(),
            fallback: self.fallback,
            listeners: ListenerNotifier::new(),
            subscription: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            client_context: ambient::current(),
        });

        let weak: Weak<SingleInner<S>> = Arc::downgrade(&inner);
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
            inner.bind_best();
        }
        tracing::debug!(
            reference = inner.reference.name(),
            filter = %inner.reference.effective_filter(),
            bound = inner.current.load().is_some(),
            "reference binder created"
        );
        Ok(ReferenceBinder { inner })
    }
}

impl<S: ?Sized + Send + Sync + 'static> ReferenceBinder<S> {
    pub fn builder(
        reference: CapabilityReference,
        registry: Arc<dyn Registry>,
    ) -> ReferenceBinderBuilder<S> {
        ReferenceBinderBuilder {
            reference,
            registry,
            fallback: None,
            retry: None,
        }
    }

    /// 使用默认重试策略且无兜底实例。
    pub fn new(
        reference: CapabilityReference,
        registry: Arc<dyn Registry>,
    ) -> Result<Self, BindingError> {
        Self::builder(reference, registry).build()
    }

    pub fn with_fallback(
        reference: CapabilityReference,
        registry: Arc<dyn Registry>,
        fallback: Arc<S>,
    ) -> Result<Self, BindingError> {
        Self::builder(reference, registry).fallback(fallback).build()
    }

    pub fn reference(&self) -> &CapabilityReference {
        &self.inner.reference
    }

    /// 本绑定器专属的重试循环，可用于 `reset` 调整间隔。
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// 以当前实例执行 `call`。
    ///
    /// # 契约说明（What）
    /// - 没有在线实例时按引用超时等待；超时为零表示只查询一次；
    /// - 等待耗尽后：强制引用与 `fail` 策略返回 [`BindingError::ServiceUnavailable`]，
    ///   `fallback` 策略改为调用兜底实例；
    /// - 执行期间按引用的 [`crate::ambient::ContextPolicy`] 切换环境上下文，返回后恢复。
    pub fn invoke<R>(&self, call: impl FnOnce(&S) -> R) -> Result<R, BindingError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let started = Instant::now();
        let timeout = inner.reference.timeout();
        let bound = match inner.resolve() {
            Some(bound) => Some(bound),
            None if timeout.is_zero() => None,
            None => inner
                .retry
                .execute(RetryDeadline::Within(timeout), || inner.resolve()),
        };

        match bound {
            Some(bound) => {
                let _context = enter_context(
                    inner.reference.context(),
                    &inner.client_context,
                    bound.properties(),
                );
                Ok(call(bound.service().as_ref()))
            }
            None => {
                inner.ensure_alive()?;
                if let Some(fallback) = &inner.fallback {
                    tracing::debug!(
                        reference = inner.reference.name(),
                        "no capability available; invoking fallback"
                    );
                    return Ok(call(fallback.as_ref()));
                }
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
        }
    }

    /// 不等待地读取当前在线实例。
    pub fn current(&self) -> Option<Arc<S>> {
        self.current_bound()
            .map(|bound| Arc::clone(bound.service()))
    }

    /// 不等待地读取当前绑定（含引用与属性快照）。
    pub fn current_bound(&self) -> Option<BoundService<S>> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return None;
        }
        self.inner.resolve().map(|bound| (*bound).clone())
    }

    pub fn is_bound(&self) -> bool {
        self.inner
            .current
            .load_full()
            .is_some_and(|bound| bound.reference().is_live())
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

    /// 拆除绑定器：取消订阅、中断等待、解绑当前实例并静默清空满足度监听器。
    ///
    /// 返回 `true` 表示本次调用完成了拆除；重复调用返回 `false`。
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
        inner.release_current();
        inner.satisfaction.retire();
        tracing::debug!(reference = inner.reference.name(), "reference binder destroyed");
        true
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}

impl<S: ?Sized + Send + Sync + 'static> SingleInner<S> {
    fn ensure_alive(&self) -> Result<(), BindingError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(BindingError::Destroyed {
                reference: self.reference.name().to_owned(),
            });
        }
        Ok(())
    }

    /// 快路径读取；句柄缺失或已撤销时在转换锁内重查。
    fn resolve(&self) -> Option<Arc<BoundService<S>>> {
        if let Some(bound) = self.current.load_full()
            && bound.reference().is_live()
        {
            return Some(bound);
        }
        let _transition = self.transition.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return None;
        }
        let found = self.bind_best();
        if found.is_none() {
            self.satisfaction.update(false, self.reference.name());
        }
        found
    }

    /// 调用方持有转换锁。
    fn bind_best(&self) -> Option<Arc<BoundService<S>>> {
        if let Some(bound) = self.current.load_full() {
            if bound.reference().is_live() {
                return Some(bound);
            }
            self.release_current();
        }
        for candidate in self.registry.find(self.reference.effective_filter()) {
            let Some(bound) = resolve_bound::<S>(&*self.registry, &candidate, self.reference.name())
            else {
                continue;
            };
            let bound = Arc::new(bound);
            self.current.store(Some(Arc::clone(&bound)));
            tracing::debug!(
                reference = self.reference.name(),
                service.id = bound.service_id().get(),
                "capability bound"
            );
            self.listeners
                .notify("bind", |listener| listener.bind(bound.service(), bound.properties()));
            self.satisfaction.update(true, self.reference.name());
            return Some(bound);
        }
        None
    }

    /// 调用方持有转换锁。
    fn release_current(&self) {
        if let Some(previous) = self.current.swap(None) {
            tracing::debug!(
                reference = self.reference.name(),
                service.id = previous.service_id().get(),
                "capability unbound"
            );
            self.listeners.notify("unbind", |listener| {
                listener.unbind(previous.service(), previous.properties())
            });
        }
    }

    fn on_service_event(&self, event: &ServiceEvent) {
        let _transition = self.transition.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let departed = event.reference();
        let bound_here = self
            .current
            .load_full()
            .is_some_and(|bound| bound.reference() == departed);
        tracing::trace!(
            reference = self.reference.name(),
            service.id = departed.id().get(),
            event = event.kind(),
            "registry event"
        );
        if event.is_departure() {
            if bound_here {
                self.release_current();
                if self.bind_best().is_none() {
                    self.satisfaction.update(false, self.reference.name());
                }
            }
            return;
        }
        if bound_here {
            if matches!(event, ServiceEvent::Modified(_))
                && let Some(bound) = self.current.load_full()
            {
                self.current.store(Some(Arc::new(bound.refreshed())));
            }
        } else if self.current.load().is_none() {
            self.bind_best();
        }
        self.retry.wake();
    }
}

impl<S: ?Sized + Send + Sync + 'static> Drop for SingleInner<S> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.cancel();
        }
        self.retry.cancel();
    }
}

impl<S: ?Sized + Send + Sync + 'static> Importer for ReferenceBinder<S> {
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

impl<S: ?Sized + Send + Sync + 'static> Clone for ReferenceBinder<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// 两个绑定器相等：引用描述相同且当前绑定到同一发布（或都未绑定）。
impl<S: ?Sized + Send + Sync + 'static> PartialEq for ReferenceBinder<S> {
    fn eq(&self, other: &Self) -> bool {
        let bound_id = |binder: &Self| {
            binder
                .inner
                .current
                .load_full()
                .map(|bound| bound.service_id())
        };
        self.inner.reference == other.inner.reference && bound_id(self) == bound_id(other)
    }
}

impl<S: ?Sized + Send + Sync + 'static> Eq for ReferenceBinder<S> {}

impl<S: ?Sized + Send + Sync + 'static> Hash for ReferenceBinder<S> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.reference.hash(state);
    }
}

impl<S: ?Sized + Send + Sync + 'static> fmt::Debug for ReferenceBinder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceBinder")
            .field("reference", &self.inner.reference.name())
            .field(
                "bound",
                &self
                    .inner
                    .current
                    .load_full()
                    .map(|bound| bound.service_id()),
            )
            .field("destroyed", &self.inner.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}
