//! 强制依赖传播：按导入方满足度发布或撤销导出者。
//!
//! # 教案式说明
//! - **意图 (Why)**：组件只有在其传递依赖上的全部强制导入方都满足时才应对外发布能力；
//!   任一强制依赖失效时必须立即撤销，不允许出现“已知依赖失效但能力仍在发布”的窗口；
//! - **逻辑 (How)**：
//!   1. `add_exporter` 通过 [`ComponentGraph::mandatory_importers`] 一次性计算依赖边，为每个导入方订阅满足度监听器；
//!   2. 每条记录自带一把可重入锁，满足度通知在锁内重新读取导入方状态后重新判定，同一导出者的判定串行执行；
//!   3. 判定过程中发布/撤销可能同步触发新的通知（同线程重入），此时只标记 `dirty`，由外层循环再判定一次；
//! - **契约 (What)**：
//!   - 不满足 → 同步撤销；全部满足且未发布 → 发布；其余保持现状；
//!   - 非单例导出者照常发布但不受追踪，`binding.tracking_unsupported` 对同一组件名只记录一次；
//!   - `remove_exporter` 幂等，移除后迟到的通知被忽略；
//! - **风险 (Trade-offs)**：不做抖动抑制，依赖反复上下线时发布状态随之反复切换；
//!   发布与撤销期间持有记录锁，注册表事件随后同步进入下游绑定器的转换锁与下游记录锁。
//!   依赖无环时加锁顺序与依赖方向一致，不会形成等待环；强制依赖成环时，环上的导出者只有在
//!   环外先出现一份实例后才会发布，之后相互维持，此时两条线程分别从环上不同位置触发发布/撤销可能相互等待。
//!   不做环检测，组件图应保持强制依赖无环。

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use spark_registry::{Registration, Registry, ServiceReference};

use crate::binder::{Importer, ImporterId, SatisfactionListener};
use crate::component::{ComponentGraph, Scope, ServiceExporter};
use crate::error::codes;
use crate::listener::ListenerToken;

/// 导出者是否受依赖追踪。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackingStatus {
    /// 受追踪，`importers` 为纳入判定的强制导入方数量。
    Tracked { importers: usize },
    /// 非单例导出者：立即发布，不随依赖变化。
    Untracked,
}

/// `add_exporter` 返回的句柄，用于查询与移除。
#[derive(Clone, Debug)]
pub struct ExporterHandle {
    key: u64,
    name: String,
    status: TrackingStatus,
    skipped: Vec<String>,
}

impl ExporterHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TrackingStatus {
        self.status
    }

    pub fn is_tracked(&self) -> bool {
        matches!(self.status, TrackingStatus::Tracked { .. })
    }

    /// 因非单例而未纳入判定的组件名。
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }
}

struct Watched {
    importer: Arc<dyn Importer>,
    satisfied: bool,
    token: Option<ListenerToken>,
}

#[derive(Default)]
struct PublicationState {
    importers: BTreeMap<ImporterId, Watched>,
    registration: Option<Registration>,
    removed: bool,
    evaluating: bool,
    dirty: bool,
}

impl PublicationState {
    fn decide(&self) -> Action {
        let published = self.registration.is_some();
        if self.removed {
            return if published { Action::Withdraw } else { Action::Keep };
        }
        let satisfied = self.importers.values().all(|watched| watched.satisfied);
        match (satisfied, published) {
            (true, false) => Action::Publish,
            (false, true) => Action::Withdraw,
            _ => Action::Keep,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Publish,
    Withdraw,
    Keep,
}

struct ExporterRecord {
    exporter: Arc<ServiceExporter>,
    registry: Arc<dyn Registry>,
    state: ReentrantMutex<RefCell<PublicationState>>,
}

impl ExporterRecord {
    fn on_satisfaction(&self, importer: ImporterId) {
        let guard = self.state.lock();
        let watched = {
            let state = guard.borrow();
            if state.removed {
                return;
            }
            match state.importers.get(&importer) {
                Some(watched) => Arc::clone(&watched.importer),
                None => return,
            }
        };
        let satisfied = watched.is_satisfied();
        if let Some(entry) = guard.borrow_mut().importers.get_mut(&importer) {
            entry.satisfied = satisfied;
        }
        tracing::debug!(
            exporter = self.exporter.name(),
            importer = %importer,
            satisfied,
            "importer satisfaction observed"
        );
        self.evaluate(&guard);
    }

    /// 刷新全部导入方的满足度快照；调用方持有记录锁。
    fn refresh(&self, state: &RefCell<PublicationState>) {
        let importers: Vec<(ImporterId, Arc<dyn Importer>)> = state
            .borrow()
            .importers
            .iter()
            .map(|(id, watched)| (*id, Arc::clone(&watched.importer)))
            .collect();
        for (id, importer) in importers {
            let satisfied = importer.is_satisfied();
            if let Some(entry) = state.borrow_mut().importers.get_mut(&id) {
                entry.satisfied = satisfied;
            }
        }
    }

    /// 调用方持有记录锁。重入调用只标记 `dirty`。
    fn evaluate(&self, state: &RefCell<PublicationState>) {
        {
            let mut current = state.borrow_mut();
            if current.evaluating {
                current.dirty = true;
                return;
            }
            current.evaluating = true;
        }
        loop {
            let action = {
                let mut current = state.borrow_mut();
                current.dirty = false;
                current.decide()
            };
            match action {
                Action::Publish => self.publish(state),
                Action::Withdraw => self.withdraw(state),
                Action::Keep => {}
            }
            let mut current = state.borrow_mut();
            if !current.dirty {
                current.evaluating = false;
                break;
            }
        }
    }

    fn publish(&self, state: &RefCell<PublicationState>) {
        let properties = self.exporter.publication_properties();
        match self.registry.publish(
            self.exporter.interfaces(),
            properties.clone(),
            self.exporter.service().clone(),
        ) {
            Ok(registration) => {
                tracing::info!(
                    exporter = self.exporter.name(),
                    service.id = registration.reference().id().get(),
                    "exporter published"
                );
                state.borrow_mut().registration = Some(registration);
                self.exporter.notify_registered(&properties);
            }
            Err(err) => {
                tracing::warn!(
                    exporter = self.exporter.name(),
                    error = %err,
                    "exporter could not be published"
                );
            }
        }
    }

    fn withdraw(&self, state: &RefCell<PublicationState>) {
        let Some(registration) = state.borrow_mut().registration.take() else {
            return;
        };
        let properties = registration.reference().properties();
        registration.withdraw();
        tracing::info!(
            exporter = self.exporter.name(),
            service.id = registration.reference().id().get(),
            "exporter withdrawn"
        );
        self.exporter.notify_unregistered(&properties);
    }
}

/// 导出者发布状态的追踪器。
///
/// 每个导出者一条记录，记录之间互不阻塞；同一导出者的通知与判定串行。
pub struct DependencyGraphTracker {
    registry: Arc<dyn Registry>,
    graph: Arc<ComponentGraph>,
    records: DashMap<u64, Arc<ExporterRecord>>,
    next_key: AtomicU64,
    warned: Mutex<HashSet<String>>,
}

impl DependencyGraphTracker {
    pub fn new(registry: Arc<dyn Registry>, graph: Arc<ComponentGraph>) -> Self {
        Self {
            registry,
            graph,
            records: DashMap::new(),
            next_key: AtomicU64::new(1),
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn graph(&self) -> &Arc<ComponentGraph> {
        &self.graph
    }

    /// 纳入追踪并立即判定一次；默认处于未发布状态。
    pub fn add_exporter(&self, exporter: ServiceExporter) -> ExporterHandle {
        let exporter = Arc::new(exporter);
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);

        let (importers, status, skipped) = if exporter.scope() == Scope::Singleton {
            let collected = self.graph.mandatory_importers(exporter.component());
            for component in &collected.skipped {
                self.warn_untracked(component);
            }
            let count = collected.importers.len();
            (
                collected.importers,
                TrackingStatus::Tracked { importers: count },
                collected.skipped,
            )
        } else {
            self.warn_untracked(exporter.component());
            (Vec::new(), TrackingStatus::Untracked, Vec::new())
        };

        let state = PublicationState {
            importers: importers
                .iter()
                .map(|importer| {
                    (
                        importer.id(),
                        Watched {
                            importer: Arc::clone(importer),
                            satisfied: false,
                            token: None,
                        },
                    )
                })
                .collect(),
            ..PublicationState::default()
        };
        let record = Arc::new(ExporterRecord {
            exporter: Arc::clone(&exporter),
            registry: Arc::clone(&self.registry),
            state: ReentrantMutex::new(RefCell::new(state)),
        });
        self.records.insert(key, Arc::clone(&record));

        let guard = record.state.lock();
        for importer in &importers {
            let weak: Weak<ExporterRecord> = Arc::downgrade(&record);
            let listener: Arc<dyn SatisfactionListener> =
                Arc::new(move |importer: ImporterId, _satisfied: bool| {
                    if let Some(record) = weak.upgrade() {
                        record.on_satisfaction(importer);
                    }
                });
            let token = importer.add_satisfaction_listener(listener);
            if let Some(entry) = guard.borrow_mut().importers.get_mut(&importer.id()) {
                entry.token = Some(token);
            }
        }
        record.refresh(&guard);
        tracing::debug!(
            exporter = exporter.name(),
            component = exporter.component(),
            status = ?status,
            "exporter discovered"
        );
        record.evaluate(&guard);
        drop(guard);

        ExporterHandle {
            key,
            name: exporter.name().to_owned(),
            status,
            skipped,
        }
    }

    /// 停止追踪并撤销发布；重复调用返回 `false`。
    pub fn remove_exporter(&self, handle: &ExporterHandle) -> bool {
        let Some((_, record)) = self.records.remove(&handle.key) else {
            return false;
        };
        Self::retire(&record);
        true
    }

    pub fn is_published(&self, handle: &ExporterHandle) -> bool {
        self.publication(handle).is_some()
    }

    /// 当前发布对应的服务引用。
    pub fn publication(&self, handle: &ExporterHandle) -> Option<ServiceReference> {
        let record = self
            .records
            .get(&handle.key)
            .map(|entry| Arc::clone(entry.value()))?;
        let guard = record.state.lock();
        let state = guard.borrow();
        state
            .registration
            .as_ref()
            .filter(|registration| registration.is_live())
            .map(|registration| registration.reference().clone())
    }

    pub fn exporter_count(&self) -> usize {
        self.records.len()
    }

    /// 移除全部导出者。
    pub fn clear(&self) {
        let keys: Vec<u64> = self.records.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, record)) = self.records.remove(&key) {
                Self::retire(&record);
            }
        }
    }

    fn retire(record: &ExporterRecord) {
        let guard = record.state.lock();
        let subscriptions: Vec<(Arc<dyn Importer>, ListenerToken)> = {
            let mut state = guard.borrow_mut();
            state.removed = true;
            state
                .importers
                .values_mut()
                .filter_map(|watched| {
                    watched
                        .token
                        .take()
                        .map(|token| (Arc::clone(&watched.importer), token))
                })
                .collect()
        };
        for (importer, token) in subscriptions {
            importer.remove_satisfaction_listener(token);
        }
        record.evaluate(&guard);
        tracing::debug!(exporter = record.exporter.name(), "exporter removed");
    }

    fn warn_untracked(&self, component: &str) {
        if self.warned.lock().insert(component.to_owned()) {
            tracing::warn!(
                code = codes::TRACKING_UNSUPPORTED,
                component,
                "component is not a singleton; its dependencies are not tracked"
            );
        }
    }
}

impl Drop for DependencyGraphTracker {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for DependencyGraphTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyGraphTracker")
            .field("exporters", &self.records.len())
            .finish()
    }
}
