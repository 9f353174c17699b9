//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义绑定层向外暴露的错误语义，每个变体对应一个稳定的点分错误码，便于日志检索与告警；
//! - 区分“调用方必须处理”的错误（`ServiceUnavailable`、`InvalidConfiguration`、`Destroyed`）
//!   与“只用于诊断”的错误（`ListenerFailure`、`TrackingUnsupported`），后两者从不打断调用方。
//!
//! ## 设计要求（What）
//! - 所有错误实现 `thiserror::Error`，并可安全跨线程传播；
//! - 重试循环内部的“暂时没有实例”是一个值（`None`），不会出现在本模块中。

use std::time::Duration;

use thiserror::Error;

/// 稳定错误码。
pub mod codes {
    pub const SERVICE_UNAVAILABLE: &str = "binding.service_unavailable";
    pub const INVALID_CONFIGURATION: &str = "binding.invalid_configuration";
    pub const LISTENER_FAILURE: &str = "binding.listener_failure";
    pub const TRACKING_UNSUPPORTED: &str = "binding.tracking_unsupported";
    pub const DESTROYED: &str = "binding.destroyed";
}

/// 绑定层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：让调用方用一个枚举覆盖“等不到实例”“配置写错”“绑定器已拆除”等全部终止情形；
/// - **契约 (What)**：[`BindingError::code`] 返回的错误码在版本间保持稳定；
/// - **设计权衡 (Trade-offs)**：上下文以 `String` 保存，牺牲少量分配换取错误可独立于绑定器存活。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BindingError {
    /// 强制引用在超时时间内没有等到任何满足条件的实例。
    ///
    /// - **契约 (What)**：`reference` 为能力引用名，`filter` 为实际生效的选择谓词，`waited` 为本次调用实际阻塞时长。
    #[error("no capability satisfies `{reference}` ({filter}) after waiting {waited:?}")]
    ServiceUnavailable {
        reference: String,
        filter: String,
        waited: Duration,
    },

    /// 能力引用或监听器配置不合法，构造阶段立即报告。
    #[error("invalid binding configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// 某个监听器返回错误或 panic。只出现在通知报告与日志中，不会传播给调用方。
    #[error("listener `{listener}` failed: {detail}")]
    ListenerFailure { listener: String, detail: String },

    /// 非单例组件无法参与依赖追踪；组件照常发布，只是不受追踪。
    #[error("component `{component}` is not a singleton and will not be tracked")]
    TrackingUnsupported { component: String },

    /// 绑定器已拆除，后续调用一律拒绝。
    #[error("binder for `{reference}` has been destroyed")]
    Destroyed { reference: String },
}

impl BindingError {
    /// 稳定的点分错误码。
    pub fn code(&self) -> &'static str {
        match self {
            BindingError::ServiceUnavailable { .. } => codes::SERVICE_UNAVAILABLE,
            BindingError::InvalidConfiguration { .. } => codes::INVALID_CONFIGURATION,
            BindingError::ListenerFailure { .. } => codes::LISTENER_FAILURE,
            BindingError::TrackingUnsupported { .. } => codes::TRACKING_UNSUPPORTED,
            BindingError::Destroyed { .. } => codes::DESTROYED,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        BindingError::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    /// 是否为调用方可以通过等待或重试恢复的错误。
    pub fn is_transient(&self) -> bool {
        matches!(self, BindingError::ServiceUnavailable { .. })
    }
}

/// 监听器回调返回的错误。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ListenerError {
    message: String,
}

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for ListenerError {
    fn from(message: &str) -> Self {
        ListenerError::new(message)
    }
}

impl From<String> for ListenerError {
    fn from(message: String) -> Self {
        ListenerError::new(message)
    }
}
