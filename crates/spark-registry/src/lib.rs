#![deny(unsafe_code)]

//! # spark-registry
//!
//! ## 定位与职责（Why）
//! - 为动态能力绑定提供进程内注册表契约：发布、按谓词查询、订阅变化、撤销；
//! - 绑定层与依赖追踪层只面向 [`Registry`] trait 编程，存储实现可按部署形态替换。
//!
//! ## 架构嵌入（Where）
//! - `properties` 定义大小写不敏感的属性表与保留键；
//! - `filter` 提供 LDAP 风格的选择谓词；
//! - `service` 描述服务编号、引用、类型擦除实例与事件；
//! - `registry` 声明对象安全的注册表 trait 与发布/订阅句柄；
//! - `in_memory` 给出线程安全的默认实现。
//!
//! ## 取舍（Trade-offs）
//! - 不做跨进程发现与持久化，所有事件都在发生变更的线程上同步投递。

/// 选择谓词语言。
pub mod filter;

/// 默认的进程内实现。
pub mod in_memory;

/// 属性模型与保留键。
pub mod properties;

/// 注册表契约与句柄。
///
/// - **意图说明 (Why)**：让发布者与使用者只通过句柄交互，撤销与取消都是显式操作；
/// - **契约定位 (What)**：[`Registry`] 为对象安全 trait，可存放于 `Arc<dyn Registry>`。
pub mod registry;

/// 服务身份、引用与事件。
pub mod service;

pub use filter::{Filter, FilterError};
pub use in_memory::InMemoryRegistry;
pub use properties::{Properties, PropertyValue};
pub use registry::{Registration, Registry, RegistryBackend, RegistryError, Subscription};
pub use service::{ServiceEvent, ServiceId, ServiceListener, ServiceObject, ServiceReference};
