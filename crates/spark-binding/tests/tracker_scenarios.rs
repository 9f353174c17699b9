//! 依赖追踪器场景。
//!
//! # 教案级导览
//! - **Why**：追踪器决定一个组件的能力何时对外可见，错误的发布会把调用引向依赖已失效的实现；
//! - **How**：用可手动切换的 [`Toggle`] 导入方精确控制满足度，再用真实绑定器验证注册表事件驱动的同步撤销；
//! - **What**：覆盖部分满足、恢复发布、同步撤销、抖动、幂等移除、非单例组件、并发切换，
//!   以及跨导出者的依赖链与依赖环。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

use spark_binding::{
    CapabilityReference, ComponentDefinition, ComponentGraph, DependencyGraphTracker, Importer,
    ImporterId, ListenerNotifier, ListenerToken, ReferenceBinder, RegistrationHandler,
    SatisfactionListener, Scope, ServiceExporter, TrackingStatus,
};
use spark_registry::{InMemoryRegistry, Properties, Registration, Registry, ServiceObject};
use tracing_test::traced_test;

/// 手动切换满足度的强制导入方。
struct Toggle {
    id: ImporterId,
    name: String,
    satisfied: AtomicBool,
    listeners: ListenerNotifier<dyn SatisfactionListener>,
}

impl Toggle {
    fn new(name: &str, satisfied: bool) -> Arc<Self> {
        Arc::new(Self {
            id: ImporterId::allocate(),
            name: name.to_owned(),
            satisfied: AtomicBool::new(satisfied),
            listeners: ListenerNotifier::new(),
        })
    }

    fn set(&self, satisfied: bool) {
        if self.satisfied.swap(satisfied, Ordering::SeqCst) != satisfied {
            self.listeners.notify("satisfaction", |listener| {
                listener.satisfaction_changed(self.id, satisfied);
                Ok(())
            });
        }
    }
}

impl Importer for Toggle {
    fn id(&self) -> ImporterId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_mandatory(&self) -> bool {
        true
    }

    fn is_satisfied(&self) -> bool {
        self.satisfied.load(Ordering::SeqCst)
    }

    fn add_satisfaction_listener(&self, listener: Arc<dyn SatisfactionListener>) -> ListenerToken {
        self.listeners.add(self.name.as_str(), listener)
    }

    fn remove_satisfaction_listener(&self, token: ListenerToken) -> bool {
        self.listeners.remove(token)
    }
}

trait Widget: Send + Sync {}

struct Plain;

impl Widget for Plain {}

fn exporter(name: &str, component: &str) -> ServiceExporter {
    let widget: Arc<dyn Widget> = Arc::new(Plain);
    ServiceExporter::new(
        name,
        component,
        vec!["demo.Widget".to_owned()],
        ServiceObject::new(widget),
    )
}

fn counting(exporter: &ServiceExporter) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let registered = Arc::new(AtomicUsize::new(0));
    let unregistered = Arc::new(AtomicUsize::new(0));
    let on_registered = Arc::clone(&registered);
    exporter.add_registration_listener(
        "count-registered",
        RegistrationHandler::notify(move || {
            on_registered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    let on_unregistered = Arc::clone(&unregistered);
    exporter.add_unregistration_listener(
        "count-unregistered",
        RegistrationHandler::properties(move |properties| {
            assert!(properties.contains_key("component.name"));
            on_unregistered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    (registered, unregistered)
}

fn tracker_for(registry: &InMemoryRegistry, graph: ComponentGraph) -> DependencyGraphTracker {
    DependencyGraphTracker::new(Arc::new(registry.clone()), Arc::new(graph))
}

/// ## 场景：两个强制导入方中只有一个满足
///
/// - **契约 (What)**：保持未发布；第二个满足后恰好发布一次。
#[test]
fn publishes_once_all_mandatory_importers_are_satisfied() {
    let registry = InMemoryRegistry::new();
    let first = Toggle::new("first", true);
    let second = Toggle::new("second", false);
    let graph = ComponentGraph::new();
    graph
        .register(
            ComponentDefinition::singleton("service")
                .with_importer(first.clone())
                .with_importer(second.clone()),
        )
        .expect("注册组件");
    let tracker = tracker_for(&registry, graph);

    let exporter = exporter("widget", "service");
    let (registered, _) = counting(&exporter);
    let handle = tracker.add_exporter(exporter);
    assert_eq!(handle.status(), TrackingStatus::Tracked { importers: 2 });
    assert!(!tracker.is_published(&handle));
    assert_eq!(registry.service_count(), 0);

    second.set(true);
    assert!(tracker.is_published(&handle));
    assert_eq!(registered.load(Ordering::SeqCst), 1);

    first.set(true);
    assert_eq!(registered.load(Ordering::SeqCst), 1, "无变化的通知不会重复发布");
    let published = tracker.publication(&handle).expect("已发布");
    assert_eq!(
        published
            .properties()
            .get("component.name")
            .and_then(|value| value.as_str()),
        Some("service")
    );
}

/// ## 场景：依赖经由真实绑定器失效
///
/// - **意图 (Why)**：撤销必须在导致失效的注册表操作返回前完成；
/// - **契约 (What)**：`withdraw` 返回时导出者已撤销；依赖恢复后重新发布，抖动不做抑制。
#[test]
fn registry_withdrawal_propagates_synchronously() {
    let registry = InMemoryRegistry::new();
    let shared: Arc<dyn Registry> = Arc::new(registry.clone());
    let backend = |registry: &InMemoryRegistry| -> Registration {
        let service: Arc<dyn Widget> = Arc::new(Plain);
        registry
            .publish(
                &["demo.Backend".to_owned()],
                Properties::new(),
                ServiceObject::new(service),
            )
            .expect("发布后端")
    };
    let mut live = backend(&registry);

    let reference = CapabilityReference::builder("backend")
        .interface("demo.Backend")
        .timeout(Duration::ZERO)
        .build()
        .expect("合法引用");
    let binder: ReferenceBinder<dyn Widget> =
        ReferenceBinder::new(reference, Arc::clone(&shared)).expect("构造绑定器");
    let graph = ComponentGraph::new();
    graph
        .register(ComponentDefinition::singleton("frontend").depends_on("storage"))
        .expect("注册 frontend");
    graph
        .register(ComponentDefinition::singleton("storage").with_importer(Arc::new(binder.clone())))
        .expect("注册 storage");
    let tracker = DependencyGraphTracker::new(shared, Arc::new(graph));

    let exporter = exporter("frontend-api", "frontend");
    let (registered, unregistered) = counting(&exporter);
    let handle = tracker.add_exporter(exporter);
    assert!(tracker.is_published(&handle), "依赖在场时立即发布");

    for round in 1..=5 {
        assert!(live.withdraw());
        assert!(!tracker.is_published(&handle), "第 {round} 轮撤销未同步传播");
        assert_eq!(unregistered.load(Ordering::SeqCst), round);
        live = backend(&registry);
        assert!(tracker.is_published(&handle), "第 {round} 轮恢复后未重新发布");
    }
    assert_eq!(registered.load(Ordering::SeqCst), 6);
}

#[test]
fn remove_exporter_is_idempotent_and_withdraws() {
    let registry = InMemoryRegistry::new();
    let importer = Toggle::new("ready", true);
    let graph = ComponentGraph::new();
    graph
        .register(ComponentDefinition::singleton("service").with_importer(importer.clone()))
        .expect("注册组件");
    let tracker = tracker_for(&registry, graph);
    let handle = tracker.add_exporter(exporter("widget", "service"));
    assert!(tracker.is_published(&handle));
    assert_eq!(tracker.exporter_count(), 1);

    assert!(tracker.remove_exporter(&handle));
    assert!(!tracker.remove_exporter(&handle));
    assert_eq!(registry.service_count(), 0);
    assert_eq!(tracker.exporter_count(), 0);

    importer.set(false);
    importer.set(true);
    assert_eq!(registry.service_count(), 0, "移除后的迟到通知被忽略");
    assert!(importer.listeners.is_empty(), "移除时退订满足度监听器");
}

#[traced_test]
#[test]
fn prototype_exporter_is_published_untracked() {
    let registry = InMemoryRegistry::new();
    let importer = Toggle::new("never", false);
    let graph = ComponentGraph::new();
    graph
        .register(ComponentDefinition::prototype("session").with_importer(importer.clone()))
        .expect("注册组件");
    let tracker = tracker_for(&registry, graph);

    let handle =
        tracker.add_exporter(exporter("session-api", "session").with_scope(Scope::Prototype));
    assert_eq!(handle.status(), TrackingStatus::Untracked);
    assert!(tracker.is_published(&handle), "非单例导出者照常发布");
    importer.set(true);
    importer.set(false);
    assert!(tracker.is_published(&handle), "非单例导出者不随依赖变化");
    assert!(logs_contain("binding.tracking_unsupported"));
}

#[traced_test]
#[test]
fn prototype_dependency_is_skipped_during_walk() {
    let registry = InMemoryRegistry::new();
    let blocked = Toggle::new("blocked", false);
    let graph = ComponentGraph::new();
    graph
        .register(ComponentDefinition::singleton("web").depends_on("session"))
        .expect("注册 web");
    graph
        .register(ComponentDefinition::prototype("session").with_importer(blocked))
        .expect("注册 session");
    let tracker = tracker_for(&registry, graph);

    let handle = tracker.add_exporter(exporter("web-api", "web"));
    assert_eq!(handle.status(), TrackingStatus::Tracked { importers: 0 });
    assert_eq!(handle.skipped(), ["session".to_owned()]);
    assert!(tracker.is_published(&handle));
    assert!(logs_contain("component is not a singleton"));
}

/// ## 场景：多线程反复切换满足度
///
/// - **契约 (What)**：无论中间如何交错，全部线程结束后发布状态与最终满足度一致，且注册表中至多一份发布。
#[test]
fn concurrent_toggling_settles_consistently() {
    let registry = InMemoryRegistry::new();
    let toggles: Vec<Arc<Toggle>> = (0..3)
        .map(|index| Toggle::new(&format!("toggle-{index}"), false))
        .collect();
    let graph = ComponentGraph::new();
    let mut definition = ComponentDefinition::singleton("service");
    for toggle in &toggles {
        definition = definition.with_importer(toggle.clone());
    }
    graph.register(definition).expect("注册组件");
    let tracker = tracker_for(&registry, graph);
    let handle = tracker.add_exporter(exporter("widget", "service"));

    let barrier = Arc::new(Barrier::new(toggles.len()));
    let workers: Vec<_> = toggles
        .iter()
        .enumerate()
        .map(|(index, toggle)| {
            let toggle = Arc::clone(toggle);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for step in 0..500 {
                    toggle.set((step + index) % 2 == 0);
                }
                toggle.set(true);
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("切换线程不应 panic");
    }

    assert!(tracker.is_published(&handle));
    assert_eq!(registry.service_count(), 1);
    toggles[1].set(false);
    assert!(!tracker.is_published(&handle));
    assert_eq!(registry.service_count(), 0);
}

fn exporting(name: &str, component: &str, interface: &str) -> ServiceExporter {
    let widget: Arc<dyn Widget> = Arc::new(Plain);
    ServiceExporter::new(
        name,
        component,
        vec![interface.to_owned()],
        ServiceObject::new(widget),
    )
}

fn importing(registry: &Arc<dyn Registry>, interface: &str) -> ReferenceBinder<dyn Widget> {
    let reference = CapabilityReference::builder(interface)
        .interface(interface)
        .timeout(Duration::ZERO)
        .build()
        .expect("合法引用");
    ReferenceBinder::new(reference, Arc::clone(registry)).expect("构造绑定器")
}

fn publish_widget(registry: &InMemoryRegistry, interface: &str) -> Registration {
    let widget: Arc<dyn Widget> = Arc::new(Plain);
    registry
        .publish(
            &[interface.to_owned()],
            Properties::new(),
            ServiceObject::new(widget),
        )
        .expect("发布外部实例")
}

/// ## 场景：两个导出者的强制依赖互相成环
///
/// - **意图 (Why)**：追踪器不做环检测，环上的导出者在没有外部实例时永远不会发布；
/// - **契约 (What)**：`add_exporter` 正常返回且均未发布；环外出现一份实例后整条环在同一线程内发布，
///   外部实例撤销后环上的导出者相互维持；`clear` 后注册表回到只剩外部实例之前的状态。
#[test]
fn mandatory_cycle_needs_an_outside_instance_and_then_sustains_itself() {
    let registry = InMemoryRegistry::new();
    let shared: Arc<dyn Registry> = Arc::new(registry.clone());
    let needs_beta = importing(&shared, "demo.Beta");
    let needs_alpha = importing(&shared, "demo.Alpha");
    let graph = ComponentGraph::new();
    graph
        .register(
            ComponentDefinition::singleton("alpha").with_importer(Arc::new(needs_beta.clone())),
        )
        .expect("注册 alpha");
    graph
        .register(
            ComponentDefinition::singleton("beta").with_importer(Arc::new(needs_alpha.clone())),
        )
        .expect("注册 beta");
    let tracker = DependencyGraphTracker::new(Arc::clone(&shared), Arc::new(graph));

    let alpha = tracker.add_exporter(exporting("alpha-api", "alpha", "demo.Alpha"));
    let beta = tracker.add_exporter(exporting("beta-api", "beta", "demo.Beta"));
    assert!(!tracker.is_published(&alpha), "环上没有任何实例时 alpha 不应发布");
    assert!(!tracker.is_published(&beta), "环上没有任何实例时 beta 不应发布");
    assert_eq!(registry.service_count(), 0);

    let outside = publish_widget(&registry, "demo.Beta");
    assert!(tracker.is_published(&alpha));
    assert!(tracker.is_published(&beta));
    assert_eq!(registry.service_count(), 3);

    assert!(outside.withdraw());
    assert!(tracker.is_published(&alpha), "alpha 改由 beta 的发布维持");
    assert!(tracker.is_published(&beta));
    assert!(needs_beta.is_satisfied());

    tracker.clear();
    assert_eq!(registry.service_count(), 0);
    assert!(!needs_beta.is_satisfied());
    assert!(!needs_alpha.is_satisfied());
}

/// ## 场景：无环依赖链上的并发上下线
///
/// - **意图 (Why)**：记录锁在发布期间持有，依赖无环时加锁顺序沿依赖方向单调，多线程同时驱动链首不应相互等待；
/// - **逻辑 (How)**：`edge ← mid ← core ← demo.Root`，四个线程各自反复发布/撤销一份 `demo.Root`，
///   主线程以超时等待全部线程结束；
/// - **契约 (What)**：全部线程按时结束；最终根实例全部撤销时整条链撤销，再出现一份时整条链发布。
#[test]
fn acyclic_chain_survives_concurrent_root_churn() {
    let registry = InMemoryRegistry::new();
    let shared: Arc<dyn Registry> = Arc::new(registry.clone());
    let graph = ComponentGraph::new();
    graph
        .register(
            ComponentDefinition::singleton("core")
                .with_importer(Arc::new(importing(&shared, "demo.Root"))),
        )
        .expect("注册 core");
    graph
        .register(
            ComponentDefinition::singleton("mid")
                .with_importer(Arc::new(importing(&shared, "demo.Core"))),
        )
        .expect("注册 mid");
    graph
        .register(
            ComponentDefinition::singleton("edge")
                .with_importer(Arc::new(importing(&shared, "demo.Mid"))),
        )
        .expect("注册 edge");
    let tracker = Arc::new(DependencyGraphTracker::new(Arc::clone(&shared), Arc::new(graph)));
    let handles = [
        tracker.add_exporter(exporting("core-api", "core", "demo.Core")),
        tracker.add_exporter(exporting("mid-api", "mid", "demo.Mid")),
        tracker.add_exporter(exporting("edge-api", "edge", "demo.Edge")),
    ];
    assert!(handles.iter().all(|handle| !tracker.is_published(handle)));

    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let (done, finished) = mpsc::channel();
    for _ in 0..workers {
        let registry = registry.clone();
        let barrier = Arc::clone(&barrier);
        let done = done.clone();
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..100 {
                let root = publish_widget(&registry, "demo.Root");
                thread::yield_now();
                root.withdraw();
            }
            let _ = done.send(());
        });
    }
    drop(done);
    for _ in 0..workers {
        finished
            .recv_timeout(Duration::from_secs(30))
            .expect("链首并发上下线的线程应在时限内结束，未结束说明发生了相互等待");
    }

    assert!(
        handles.iter().all(|handle| !tracker.is_published(handle)),
        "根实例全部撤销后整条链撤销"
    );
    assert_eq!(registry.service_count(), 0);
    let root = publish_widget(&registry, "demo.Root");
    assert!(
        handles.iter().all(|handle| tracker.is_published(handle)),
        "根实例出现后整条链发布"
    );
    assert_eq!(registry.service_count(), 4);
    assert!(root.withdraw());
    assert_eq!(registry.service_count(), 0);
}
