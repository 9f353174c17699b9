//! 能力引用与绑定器。
//!
//! # 模块定位（Why）
//! - 使用方只持有一个稳定的绑定器句柄，背后的具体实例可以随时出现、消失、再出现；
//! - 绑定器对外暴露满足度（[`Importer`]），依赖追踪器据此决定导出者是否可以发布。
//!
//! # 架构嵌入（Where）
//! - [`CapabilityReference`] 是不可变的引用描述，由构建器或配置文件生成并在构造阶段完成全部校验；
//! - `single` 模块实现单基数的 [`ReferenceBinder`]，`multi` 模块实现多基数的 [`CollectionBinder`]；
//! - 两者共用本模块的实例解析、满足度状态与上下文切换辅助函数。

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spark_registry::properties::{COMPONENT_NAME, PROVIDER_CONTEXT, SERVICE_ID};
use spark_registry::{Filter, Properties, PropertyValue, Registry, ServiceId, ServiceReference};

use crate::ambient::{self, ContextGuard, ContextPolicy};
use crate::error::BindingError;
use crate::listener::{ListenerNotifier, ListenerToken};

mod multi;
mod single;

pub use multi::CollectionBinder;
pub use single::{ReferenceBinder, ReferenceBinderBuilder};

/// 未显式配置时的等待上限。
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// 引用基数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    /// `0..1`
    #[serde(rename = "0..1")]
    Optional,
    /// `1..1`
    #[default]
    #[serde(rename = "1..1")]
    Mandatory,
    /// `0..N`
    #[serde(rename = "0..N", alias = "0..n")]
    OptionalMultiple,
    /// `1..N`
    #[serde(rename = "1..N", alias = "1..n")]
    MandatoryMultiple,
}

impl Cardinality {
    pub fn is_mandatory(self) -> bool {
        matches!(self, Cardinality::Mandatory | Cardinality::MandatoryMultiple)
    }

    pub fn is_multiple(self) -> bool {
        matches!(
            self,
            Cardinality::OptionalMultiple | Cardinality::MandatoryMultiple
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Cardinality::Optional => "0..1",
            Cardinality::Mandatory => "1..1",
            Cardinality::OptionalMultiple => "0..N",
            Cardinality::MandatoryMultiple => "1..N",
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cardinality {
    type Err = BindingError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim() {
            "0..1" => Ok(Cardinality::Optional),
            "1..1" => Ok(Cardinality::Mandatory),
            "0..N" | "0..n" => Ok(Cardinality::OptionalMultiple),
            "1..N" | "1..n" => Ok(Cardinality::MandatoryMultiple),
            other => Err(BindingError::invalid(format!(
                "unknown cardinality `{other}`"
            ))),
        }
    }
}

/// 等待超时后可选引用的处理方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnUnavailable {
    /// 返回 [`BindingError::ServiceUnavailable`]。
    #[default]
    Fail,
    /// 改为调用绑定器上配置的兜底实例。
    Fallback,
}

/// 显式目标：绕过用户过滤器，直接指定某个发布。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetSelector {
    ServiceId(ServiceId),
    ComponentName(String),
}

impl TargetSelector {
    fn filter(&self) -> Filter {
        match self {
            TargetSelector::ServiceId(id) => Filter::equals(SERVICE_ID, id.get().to_string()),
            TargetSelector::ComponentName(name) => Filter::equals(COMPONENT_NAME, name.clone()),
        }
    }
}

type ReferenceComparator = dyn Fn(&ServiceReference, &ServiceReference) -> CmpOrdering + Send + Sync;

/// 多基数引用中实例的排列方式。相等性与哈希只比较标签。
#[derive(Clone)]
pub enum ServiceOrdering {
    /// 排名高者在前，同排名按发布先后。
    Ranking,
    /// 按属性值排列，缺失该属性的实例排在最后。
    Property { key: String, descending: bool },
    /// 自定义比较器。
    Custom {
        label: Arc<str>,
        compare: Arc<ReferenceComparator>,
    },
}

impl ServiceOrdering {
    pub fn custom<F>(label: impl Into<String>, compare: F) -> Self
    where
        F: Fn(&ServiceReference, &ServiceReference) -> CmpOrdering + Send + Sync + 'static,
    {
        let label: String = label.into();
        ServiceOrdering::Custom {
            label: Arc::from(label),
            compare: Arc::new(compare),
        }
    }

    /// 解析配置中的排序声明：`ranking`、`property:<key>`、`property:<key>:desc`。
    pub fn parse(text: &str) -> Result<Self, BindingError> {
        let text = text.trim();
        if text == "ranking" {
            return Ok(ServiceOrdering::Ranking);
        }
        if let Some(rest) = text.strip_prefix("property:") {
            let (key, descending) = match rest.strip_suffix(":desc") {
                Some(key) => (key, true),
                None => (rest.strip_suffix(":asc").unwrap_or(rest), false),
            };
            if !key.is_empty() {
                return Ok(ServiceOrdering::Property {
                    key: key.to_owned(),
                    descending,
                });
            }
        }
        Err(BindingError::invalid(format!("unknown ordering `{text}`")))
    }

    pub fn label(&self) -> String {
        match self {
            ServiceOrdering::Ranking => "ranking".to_owned(),
            ServiceOrdering::Property { key, descending } => {
                format!("property:{key}:{}", if *descending { "desc" } else { "asc" })
            }
            ServiceOrdering::Custom { label, .. } => label.to_string(),
        }
    }

    pub fn compare(&self, left: &ServiceReference, right: &ServiceReference) -> CmpOrdering {
        match self {
            ServiceOrdering::Ranking => left.cmp_preference(right),
            ServiceOrdering::Property { key, descending } => {
                let left_properties = left.properties();
                let right_properties = right.properties();
                match (left_properties.get(key), right_properties.get(key)) {
                    (Some(a), Some(b)) => {
                        let ordering = compare_values(a, b);
                        if *descending { ordering.reverse() } else { ordering }
                    }
                    (Some(_), None) => CmpOrdering::Less,
                    (None, Some(_)) => CmpOrdering::Greater,
                    (None, None) => CmpOrdering::Equal,
                }
            }
            ServiceOrdering::Custom { compare, .. } => compare(left, right),
        }
    }
}

fn compare_values(left: &PropertyValue, right: &PropertyValue) -> CmpOrdering {
    match (left, right) {
        (PropertyValue::Int(a), PropertyValue::Int(b)) => a.cmp(b),
        (PropertyValue::Float(a), PropertyValue::Float(b)) => a.total_cmp(b),
        (PropertyValue::Int(a), PropertyValue::Float(b)) => (*a as f64).total_cmp(b),
        (PropertyValue::Float(a), PropertyValue::Int(b)) => a.total_cmp(&(*b as f64)),
        (a, b) => a.to_string().cmp(&b.to_string()),
    }
}

impl PartialEq for ServiceOrdering {
    fn eq(&self, other: &Self) -> bool {
        self.label() == other.label()
    }
}

impl Eq for ServiceOrdering {}

impl Hash for ServiceOrdering {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.label().hash(state);
    }
}

impl fmt::Debug for ServiceOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceOrdering").field(&self.label()).finish()
    }
}

/// 已校验、不可变的能力引用。
///
/// # 教案式说明
/// - **意图 (Why)**：把“我要什么样的实例、要几个、等多久、等不到怎么办”一次性描述清楚，
///   并在构造阶段暴露全部配置错误，避免运行期才发现引用写错；
/// - **逻辑 (How)**：生效过滤器 = 接口约束 ∧（显式目标 或 用户过滤器）；显式目标存在时用户过滤器被忽略；
/// - **契约 (What)**：构造成功的引用满足：名称与接口非空、过滤器合法、排序只用于多基数、
///   兜底策略只用于可选引用。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CapabilityReference {
    name: Arc<str>,
    interfaces: Arc<[String]>,
    filter: Option<Filter>,
    effective_filter: Filter,
    cardinality: Cardinality,
    timeout: Duration,
    target: Option<TargetSelector>,
    ordering: Option<ServiceOrdering>,
    on_unavailable: OnUnavailable,
    context: ContextPolicy,
}

impl CapabilityReference {
    pub fn builder(name: impl Into<String>) -> CapabilityReferenceBuilder {
        CapabilityReferenceBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// 用户声明的过滤器（不含接口约束）。
    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// 实际用于查询与订阅的过滤器。
    pub fn effective_filter(&self) -> &Filter {
        &self.effective_filter
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn is_mandatory(&self) -> bool {
        self.cardinality.is_mandatory()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn target(&self) -> Option<&TargetSelector> {
        self.target.as_ref()
    }

    pub fn ordering(&self) -> Option<&ServiceOrdering> {
        self.ordering.as_ref()
    }

    pub fn on_unavailable(&self) -> OnUnavailable {
        self.on_unavailable
    }

    pub fn context(&self) -> ContextPolicy {
        self.context
    }
}

impl fmt::Display for CapabilityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.name, self.cardinality, self.effective_filter
        )
    }
}

enum FilterSource {
    Text(String),
    Parsed(Filter),
}

/// [`CapabilityReference`] 构建器。
pub struct CapabilityReferenceBuilder {
    name: String,
    interfaces: Vec<String>,
    filter: Option<FilterSource>,
    cardinality: Cardinality,
    timeout: Duration,
    target: Option<TargetSelector>,
    ordering: Option<ServiceOrdering>,
    on_unavailable: OnUnavailable,
    context: ContextPolicy,
}

impl CapabilityReferenceBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interfaces: Vec::new(),
            filter: None,
            cardinality: Cardinality::default(),
            timeout: DEFAULT_TIMEOUT,
            target: None,
            ordering: None,
            on_unavailable: OnUnavailable::default(),
            context: ContextPolicy::default(),
        }
    }

    #[must_use]
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    #[must_use]
    pub fn interfaces<I, T>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.interfaces.extend(interfaces.into_iter().map(Into::into));
        self
    }

    /// 文本形式的过滤器，在 `build` 时解析。
    #[must_use]
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(FilterSource::Text(filter.into()));
        self
    }

    #[must_use]
    pub fn filter_expr(mut self, filter: Filter) -> Self {
        self.filter = Some(FilterSource::Parsed(filter));
        self
    }

    #[must_use]
    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    /// 等待上限；零表示不等待，首次查询失败即终止。
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn target(mut self, target: TargetSelector) -> Self {
        self.target = Some(target);
        self
    }

    #[must_use]
    pub fn ordering(mut self, ordering: ServiceOrdering) -> Self {
        self.ordering = Some(ordering);
        self
    }

    #[must_use]
    pub fn on_unavailable(mut self, policy: OnUnavailable) -> Self {
        self.on_unavailable = policy;
        self
    }

    #[must_use]
    pub fn context(mut self, policy: ContextPolicy) -> Self {
        self.context = policy;
        self
    }

    pub fn build(self) -> Result<CapabilityReference, BindingError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(BindingError::invalid("reference name must not be empty"));
        }
        if self.interfaces.is_empty() || self.interfaces.iter().any(|i| i.trim().is_empty()) {
            return Err(BindingError::invalid(format!(
                "reference `{name}` must name at least one non-empty interface"
            )));
        }
        let filter = match self.filter {
            Some(FilterSource::Text(text)) => Some(Filter::parse(&text).map_err(|err| {
                BindingError::invalid(format!("reference `{name}` has a malformed filter: {err}"))
            })?),
            Some(FilterSource::Parsed(filter)) => Some(filter),
            None => None,
        };
        if self.ordering.is_some() && !self.cardinality.is_multiple() {
            return Err(BindingError::invalid(format!(
                "reference `{name}` declares an ordering but has single cardinality {}",
                self.cardinality
            )));
        }
        if self.on_unavailable == OnUnavailable::Fallback && self.cardinality.is_mandatory() {
            return Err(BindingError::invalid(format!(
                "reference `{name}` is mandatory and cannot fall back"
            )));
        }

        let base = Filter::for_interfaces(&self.interfaces);
        let effective_filter = match (&self.target, &filter) {
            (Some(target), user) => {
                if user.is_some() {
                    tracing::debug!(
                        reference = name,
                        "explicit target given; user filter is ignored for selection"
                    );
                }
                base.and(target.filter())
            }
            (None, Some(user)) => base.and(user.clone()),
            (None, None) => base,
        };

        Ok(CapabilityReference {
            name: Arc::from(name),
            interfaces: Arc::from(self.interfaces),
            filter,
            effective_filter,
            cardinality: self.cardinality,
            timeout: self.timeout,
            target: self.target,
            ordering: self.ordering,
            on_unavailable: self.on_unavailable,
            context: self.context,
        })
    }
}

/// 一次成功解析得到的实例句柄。
pub struct BoundService<S: ?Sized> {
    reference: ServiceReference,
    service: Arc<S>,
    properties: Arc<Properties>,
}

impl<S: ?Sized> BoundService<S> {
    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn service_id(&self) -> ServiceId {
        self.reference.id()
    }

    fn refreshed(&self) -> Self {
        Self {
            reference: self.reference.clone(),
            service: Arc::clone(&self.service),
            properties: self.reference.properties(),
        }
    }
}

impl<S: ?Sized> Clone for BoundService<S> {
    fn clone(&self) -> Self {
        Self {
            reference: self.reference.clone(),
            service: Arc::clone(&self.service),
            properties: Arc::clone(&self.properties),
        }
    }
}

impl<S: ?Sized> PartialEq for BoundService<S> {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl<S: ?Sized> fmt::Debug for BoundService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundService")
            .field("service", &self.reference.id())
            .field("properties", &self.properties)
            .finish()
    }
}

/// 取出实例并按能力类型下转型。
fn resolve_bound<S>(
    registry: &dyn Registry,
    candidate: &ServiceReference,
    reference: &str,
) -> Option<BoundService<S>>
where
    S: ?Sized + Send + Sync + 'static,
{
    let object = registry.get_service(candidate)?;
    match object.downcast::<S>() {
        Some(service) => Some(BoundService {
            reference: candidate.clone(),
            service,
            properties: candidate.properties(),
        }),
        None => {
            tracing::warn!(
                reference,
                service.id = candidate.id().get(),
                "published object does not match the requested capability type; skipped"
            );
            None
        }
    }
}

/// 按引用的上下文策略切换环境上下文。
fn enter_context(
    policy: ContextPolicy,
    client: &Option<Arc<str>>,
    provider: &Properties,
) -> Option<ContextGuard> {
    match policy {
        ContextPolicy::Unmanaged => None,
        ContextPolicy::Client => Some(ambient::enter(client.clone())),
        ContextPolicy::ServiceProvider => Some(ambient::enter(
            provider
                .get(PROVIDER_CONTEXT)
                .and_then(PropertyValue::as_str)
                .map(Arc::from),
        )),
    }
}

static NEXT_IMPORTER: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的导入方编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImporterId(u64);

impl ImporterId {
    /// 分配新的编号；自定义 [`Importer`] 实现在构造时调用一次。
    pub fn allocate() -> Self {
        ImporterId(NEXT_IMPORTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ImporterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "importer-{}", self.0)
    }
}

/// 满足度变化回调。
pub trait SatisfactionListener: Send + Sync {
    fn satisfaction_changed(&self, importer: ImporterId, satisfied: bool);
}

impl<F> SatisfactionListener for F
where
    F: Fn(ImporterId, bool) + Send + Sync,
{
    fn satisfaction_changed(&self, importer: ImporterId, satisfied: bool) {
        self(importer, satisfied)
    }
}

/// 对依赖追踪器暴露的导入方视图。
///
/// # 契约说明（What）
/// - 可选引用恒为满足，且从不发出变化通知；
/// - 强制引用在持有至少一个在线实例时满足；`is_satisfied` 在通知发出之前已经更新；
/// - 同一导入方的通知串行发出，不同导入方之间互不阻塞。
pub trait Importer: Send + Sync {
    fn id(&self) -> ImporterId;
    fn name(&self) -> &str;
    fn is_mandatory(&self) -> bool;
    fn is_satisfied(&self) -> bool;
    fn add_satisfaction_listener(&self, listener: Arc<dyn SatisfactionListener>) -> ListenerToken;
    fn remove_satisfaction_listener(&self, token: ListenerToken) -> bool;
}

/// 绑定器共享的满足度状态。
struct SatisfactionState {
    id: ImporterId,
    mandatory: bool,
    satisfied: AtomicBool,
    listeners: ListenerNotifier<dyn SatisfactionListener>,
}

impl SatisfactionState {
    fn new(mandatory: bool) -> Self {
        Self {
            id: ImporterId::allocate(),
            mandatory,
            satisfied: AtomicBool::new(!mandatory),
            listeners: ListenerNotifier::new(),
        }
    }

    fn is_satisfied(&self) -> bool {
        self.satisfied.load(Ordering::Acquire)
    }

    /// 调用方需持有绑定器的转换锁，保证通知按发生顺序发出。
    fn update(&self, satisfied: bool, reference: &str) {
        if !self.mandatory {
            return;
        }
        let previous = self.satisfied.swap(satisfied, Ordering::AcqRel);
        if previous == satisfied {
            return;
        }
        tracing::debug!(
            reference,
            importer = %self.id,
            satisfied,
            "importer satisfaction changed"
        );
        let id = self.id;
        self.listeners.notify("satisfaction", |listener| {
            listener.satisfaction_changed(id, satisfied);
            Ok(())
        });
    }

    /// 拆除时静默清空：不再发出任何通知。
    fn retire(&self) {
        self.listeners.clear();
        if self.mandatory {
            self.satisfied.store(false, Ordering::Release);
        }
    }
}
