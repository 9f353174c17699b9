#![deny(unsafe_code)]

//! # spark-binding
//!
//! ## 定位与职责（Why）
//! - 让组件通过稳定句柄使用“可能随时出现或消失”的能力：绑定器负责查找、等待、换绑与失败语义；
//! - 让组件只在其强制依赖全部满足时才对外发布能力，依赖失效时立即撤销。
//!
//! ## 架构嵌入（Where）
//! - 只依赖 [`spark_registry::Registry`] trait，注册表实现可替换；
//! - `binder` 产出的绑定器同时实现 [`Importer`]，`tracker` 通过该 trait 观察满足度，二者之间没有具体类型耦合；
//! - `component` 描述构造依赖，`ordering` 给出启动顺序。
//!
//! ## 并发模型（How）
//! - 绑定器：每个绑定器一把可重入转换锁串行化绑定事件，调用路径使用 `arc-swap` 无锁读取当前实例；
//! - 集合：粗粒度锁只覆盖结构变更，元素在锁外交付；
//! - 追踪器：`DashMap` 保存记录，每条记录一把可重入锁，不同导出者并行推进；
//! - 等待：`parking_lot::Condvar` 驱动的重试循环，`reset`/`wake`/`cancel` 均为条件变量通知。
//!
//! ## 可观测性
//! - 所有事件通过 `tracing` 输出，事件统一携带 `reference`、`service.id`、`exporter`、`importer`、`code` 等字段；错误码见 [`error::codes`]。

/// 线程级环境上下文与调用期切换。
pub mod ambient;

/// 能力引用与绑定器。
///
/// - **意图说明 (Why)**：把查找、等待、换绑、兜底与上下文切换收敛到一个句柄；
/// - **契约定位 (What)**：[`ReferenceBinder`] 覆盖单基数，[`CollectionBinder`] 覆盖多基数。
pub mod binder;

/// 取消令牌。
pub mod cancellation;

/// 遍历期间可并发增删的集合。
pub mod collection;

/// 组件构造图与导出者。
pub mod component;

/// TOML 配置。
pub mod config;

/// 错误域与稳定错误码。
pub mod error;

/// 监听器契约与失败隔离的扇出通知。
pub mod listener;

/// 日志字段约定与订阅器安装。
pub mod observability;

/// 依赖优先的拓扑排序。
pub mod ordering;

/// 可重置的重试循环。
pub mod retry;

/// 强制依赖传播。
pub mod tracker;

pub use ambient::{ContextGuard, ContextPolicy};
pub use binder::{
    BoundService, CapabilityReference, CapabilityReferenceBuilder, Cardinality, CollectionBinder,
    Importer, ImporterId, OnUnavailable, ReferenceBinder, ReferenceBinderBuilder,
    SatisfactionListener, ServiceOrdering, TargetSelector,
};
pub use cancellation::Cancellation;
pub use collection::{Cursor, DynamicCollection, IterationExhausted};
pub use component::{ComponentDefinition, ComponentGraph, MandatoryImporters, Scope, ServiceExporter};
pub use config::{BindingConfig, ConfigError, ReferenceDescriptor};
pub use error::{BindingError, ListenerError};
pub use listener::{
    BindHandler, BindingListener, HandlerListener, ListenerNotifier, ListenerToken,
    NotificationReport, RegistrationHandler, RegistrationHandlerListener, RegistrationListener,
};
pub use ordering::{OrderingError, TopologicalOrderer};
pub use retry::{Backoff, RetryDeadline, RetryPolicy};
pub use tracker::{DependencyGraphTracker, ExporterHandle, TrackingStatus};
