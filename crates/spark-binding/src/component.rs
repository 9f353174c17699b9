//! 组件构造图与服务导出者。
//!
//! # 模块定位（Why）
//! - 依赖追踪需要知道“发布某个能力之前，哪些强制导入方必须满足”，这由组件之间的构造依赖决定；
//! - 启动阶段还需要按依赖顺序初始化组件。
//!
//! # 契约说明（What）
//! - 组件名在图内唯一，重复注册返回 [`BindingError::InvalidConfiguration`]；
//! - 依赖可以指向尚未注册的组件，遍历时按缺失处理；
//! - 只有单例组件的导入方参与依赖追踪，非单例组件被记录为跳过项。

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use spark_registry::properties::COMPONENT_NAME;
use spark_registry::{Properties, ServiceObject};

use crate::binder::{Importer, ImporterId};
use crate::error::BindingError;
use crate::listener::{
    ListenerNotifier, ListenerToken, NotificationReport, RegistrationHandler,
    RegistrationHandlerListener, RegistrationListener,
};
use crate::ordering::{OrderingError, TopologicalOrderer};

/// 组件实例化方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// 全局唯一实例，可参与依赖追踪。
    #[default]
    Singleton,
    /// 每次请求创建新实例。
    Prototype,
}

/// 图中的一个组件。
#[derive(Clone)]
pub struct ComponentDefinition {
    name: String,
    scope: Scope,
    dependencies: Vec<String>,
    importers: Vec<Arc<dyn Importer>>,
}

impl ComponentDefinition {
    pub fn singleton(name: impl Into<String>) -> Self {
        Self::with_scope(name, Scope::Singleton)
    }

    pub fn prototype(name: impl Into<String>) -> Self {
        Self::with_scope(name, Scope::Prototype)
    }

    pub fn with_scope(name: impl Into<String>, scope: Scope) -> Self {
        Self {
            name: name.into(),
            scope,
            dependencies: Vec::new(),
            importers: Vec::new(),
        }
    }

    /// 声明构造依赖：`name` 必须先于本组件构造。
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.dependencies.contains(&name) {
            self.dependencies.push(name);
        }
        self
    }

    /// 挂接本组件持有的导入方（绑定器）。
    #[must_use]
    pub fn with_importer(mut self, importer: Arc<dyn Importer>) -> Self {
        self.importers.push(importer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn importers(&self) -> &[Arc<dyn Importer>] {
        &self.importers
    }
}

impl fmt::Debug for ComponentDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let importers: Vec<&str> = self.importers.iter().map(|importer| importer.name()).collect();
        f.debug_struct("ComponentDefinition")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("dependencies", &self.dependencies)
            .field("importers", &importers)
            .finish()
    }
}

/// 从某个根组件出发收集到的强制导入方。
#[derive(Clone, Default)]
pub struct MandatoryImporters {
    /// 按遍历顺序去重后的强制导入方。
    pub importers: Vec<Arc<dyn Importer>>,
    /// 持有强制导入方但不是单例、因而未纳入追踪的组件名。
    pub skipped: Vec<String>,
}

impl fmt::Debug for MandatoryImporters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<ImporterId> = self.importers.iter().map(|importer| importer.id()).collect();
        f.debug_struct("MandatoryImporters")
            .field("importers", &ids)
            .field("skipped", &self.skipped)
            .finish()
    }
}

/// 组件构造图。
///
/// # 教案式说明
/// - **意图 (Why)**：集中维护组件间的构造依赖，为依赖追踪提供“传递依赖上的强制导入方”，
///   并为启动流程给出依赖优先的初始化顺序；
/// - **逻辑 (How)**：以组件名为键的 `BTreeMap` 保存定义，读多写少使用 `RwLock`；
/// - **契约 (What)**：遍历对环安全；缺失的依赖被视为叶子；
/// - **风险 (Trade-offs)**：注册后的定义不可修改，导入方需在注册前挂接完成。
#[derive(Default)]
pub struct ComponentGraph {
    nodes: RwLock<BTreeMap<String, Arc<ComponentDefinition>>>,
}

impl ComponentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册组件；同名组件已存在时拒绝。
    pub fn register(&self, definition: ComponentDefinition) -> Result<(), BindingError> {
        if definition.name.trim().is_empty() {
            return Err(BindingError::invalid("component name must not be empty"));
        }
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&definition.name) {
            return Err(BindingError::invalid(format!(
                "component `{}` already registered",
                definition.name
            )));
        }
        tracing::debug!(
            component = %definition.name,
            scope = ?definition.scope,
            dependencies = ?definition.dependencies,
            "component registered"
        );
        nodes.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ComponentDefinition>> {
        self.nodes.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// 直接依赖；未注册的组件返回空列表。
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.nodes
            .read()
            .get(name)
            .map(|node| node.dependencies.clone())
            .unwrap_or_default()
    }

    /// 从 `root`（含自身）沿构造依赖传递收集强制导入方。
    ///
    /// 非单例组件的导入方不纳入结果，组件名记入 `skipped`，其依赖也不再展开。
    pub fn mandatory_importers(&self, root: &str) -> MandatoryImporters {
        let nodes = self.nodes.read();
        let mut collected = MandatoryImporters::default();
        let mut seen_components: HashSet<&str> = HashSet::new();
        let mut seen_importers: BTreeSet<ImporterId> = BTreeSet::new();
        let mut stack: Vec<&str> = vec![root];

        while let Some(name) = stack.pop() {
            if !seen_components.insert(name) {
                continue;
            }
            let Some(node) = nodes.get(name) else {
                continue;
            };
            if node.scope != Scope::Singleton {
                if node.importers.iter().any(|importer| importer.is_mandatory()) {
                    collected.skipped.push(node.name.clone());
                }
                continue;
            }
            for importer in &node.importers {
                if importer.is_mandatory() && seen_importers.insert(importer.id()) {
                    collected.importers.push(Arc::clone(importer));
                }
            }
            stack.extend(node.dependencies.iter().rev().map(String::as_str));
        }
        collected
    }

    /// 全部已注册组件的初始化顺序，依赖在前。
    pub fn bootstrap_order(&self) -> Result<Vec<String>, OrderingError> {
        let names: Vec<String> = self.nodes.read().keys().cloned().collect();
        self.order(names)
    }

    /// 只对给定子集排序；子集之外的组件仍参与传递可达性判断。
    pub fn bootstrap_order_of(&self, names: &[&str]) -> Result<Vec<String>, OrderingError> {
        self.order(names.iter().map(|name| (*name).to_owned()).collect())
    }

    fn order(&self, names: Vec<String>) -> Result<Vec<String>, OrderingError> {
        TopologicalOrderer::sort(names, String::clone, |name: &String| self.dependencies_of(name))
    }
}

impl fmt::Debug for ComponentGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.nodes.read().iter()).finish()
    }
}

/// 把某个根组件的能力发布到注册表的导出者。
///
/// # 契约说明（What）
/// - `component` 指向构造图中的根组件，追踪器据此收集强制导入方；
/// - 发布属性自动带上 `component.name`，以便按组件名显式选择；
/// - 发布/撤销监听器的失败只记录，不影响发布状态。
pub struct ServiceExporter {
    name: String,
    component: String,
    interfaces: Vec<String>,
    properties: Properties,
    service: ServiceObject,
    scope: Scope,
    listeners: ListenerNotifier<dyn RegistrationListener>,
}

impl ServiceExporter {
    pub fn new(
        name: impl Into<String>,
        component: impl Into<String>,
        interfaces: Vec<String>,
        service: ServiceObject,
    ) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
            interfaces,
            properties: Properties::new(),
            service,
            scope: Scope::Singleton,
            listeners: ListenerNotifier::new(),
        }
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn service(&self) -> &ServiceObject {
        &self.service
    }

    /// 实际发布时使用的属性。
    pub fn publication_properties(&self) -> Properties {
        let mut properties = self.properties.clone();
        if !properties.contains_key(COMPONENT_NAME) {
            properties.insert(COMPONENT_NAME, self.component.clone());
        }
        properties
    }

    pub fn add_listener(
        &self,
        name: impl Into<String>,
        listener: Arc<dyn RegistrationListener>,
    ) -> ListenerToken {
        self.listeners.add(name, listener)
    }

    pub fn add_registration_listener(
        &self,
        name: impl Into<String>,
        handler: RegistrationHandler,
    ) -> ListenerToken {
        self.add_listener(
            name,
            Arc::new(RegistrationHandlerListener::new(Some(handler), None)),
        )
    }

    pub fn add_unregistration_listener(
        &self,
        name: impl Into<String>,
        handler: RegistrationHandler,
    ) -> ListenerToken {
        self.add_listener(
            name,
            Arc::new(RegistrationHandlerListener::new(None, Some(handler))),
        )
    }

    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        self.listeners.remove(token)
    }

    pub(crate) fn notify_registered(&self, properties: &Properties) -> NotificationReport {
        self.listeners
            .notify("registered", |listener| listener.registered(properties))
    }

    pub(crate) fn notify_unregistered(&self, properties: &Properties) -> NotificationReport {
        self.listeners
            .notify("unregistered", |listener| listener.unregistered(properties))
    }
}

impl fmt::Debug for ServiceExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceExporter")
            .field("name", &self.name)
            .field("component", &self.component)
            .field("interfaces", &self.interfaces)
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::SatisfactionListener;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubImporter {
        id: ImporterId,
        name: &'static str,
        mandatory: bool,
        satisfied: AtomicBool,
    }

    impl StubImporter {
        fn new(name: &'static str, mandatory: bool) -> Arc<dyn Importer> {
            Arc::new(Self {
                id: ImporterId::allocate(),
                name,
                mandatory,
                satisfied: AtomicBool::new(true),
            })
        }
    }

    impl Importer for StubImporter {
        fn id(&self) -> ImporterId {
            self.id
        }
        fn name(&self) -> &str {
            self.name
        }
        fn is_mandatory(&self) -> bool {
            self.mandatory
        }
        fn is_satisfied(&self) -> bool {
            self.satisfied.load(Ordering::SeqCst)
        }
        fn add_satisfaction_listener(&self, _: Arc<dyn SatisfactionListener>) -> ListenerToken {
            unreachable!("图遍历不会订阅")
        }
        fn remove_satisfaction_listener(&self, _: ListenerToken) -> bool {
            false
        }
    }

    #[test]
    fn transitive_walk_collects_mandatory_importers_and_skips_prototypes() {
        let graph = ComponentGraph::new();
        let db = StubImporter::new("db", true);
        let cache = StubImporter::new("cache", false);
        let session = StubImporter::new("session", true);
        graph
            .register(ComponentDefinition::singleton("api").depends_on("repo"))
            .expect("注册 api");
        graph
            .register(
                ComponentDefinition::singleton("repo")
                    .depends_on("api")
                    .depends_on("session")
                    .with_importer(Arc::clone(&db))
                    .with_importer(cache),
            )
            .expect("注册 repo");
        graph
            .register(ComponentDefinition::prototype("session").with_importer(session))
            .expect("注册 session");

        let collected = graph.mandatory_importers("api");
        let names: Vec<&str> = collected.importers.iter().map(|i| i.name()).collect();
        assert_eq!(names, vec!["db"]);
        assert_eq!(collected.skipped, vec!["session".to_owned()]);
    }

    #[test]
    fn duplicate_component_is_rejected() {
        let graph = ComponentGraph::new();
        graph
            .register(ComponentDefinition::singleton("api"))
            .expect("首次注册");
        assert!(matches!(
            graph.register(ComponentDefinition::prototype("api")),
            Err(BindingError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn bootstrap_order_puts_dependencies_first() {
        let graph = ComponentGraph::new();
        graph
            .register(ComponentDefinition::singleton("web").depends_on("service"))
            .expect("注册 web");
        graph
            .register(ComponentDefinition::singleton("service").depends_on("store"))
            .expect("注册 service");
        graph
            .register(ComponentDefinition::singleton("store"))
            .expect("注册 store");
        assert_eq!(
            graph.bootstrap_order_of(&["web", "store"]).expect("无环"),
            vec!["store".to_owned(), "web".to_owned()]
        );
    }
}
