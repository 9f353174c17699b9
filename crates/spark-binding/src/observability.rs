//! 日志字段约定与订阅器安装入口。
//!
//! 绑定层只通过 `tracing` 宏输出结构化事件，订阅器由宿主进程安装；演示程序与集成测试可直接使用
//! [`install_subscriber`]。

use std::sync::OnceLock;

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 未设置 `RUST_LOG` 且未显式传入指令时使用的过滤级别。
pub const DEFAULT_DIRECTIVES: &str = "info";

static INSTALLED: OnceLock<String> = OnceLock::new();

/// 安装订阅器可能出现的错误。
#[derive(Debug, Error)]
pub enum ObservabilityError {
    /// 本模块已完成安装。
    #[error("binding subscriber already installed with directives `{directives}`")]
    AlreadyInstalled { directives: String },
    /// 外部提前设置了全局 `tracing` Subscriber。
    #[error("a global tracing subscriber has already been set by the host")]
    SubscriberAlreadySet,
    /// 过滤指令无法解析。
    #[error("invalid log directives `{directives}`: {detail}")]
    InvalidDirectives { directives: String, detail: String },
    /// 设置全局 Subscriber 失败的底层错误。
    #[error("failed to set global subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::dispatcher::SetGlobalDefaultError),
}

/// 安装 `fmt + EnvFilter` 全局订阅器。
///
/// # 教案式说明
/// - **意图（Why）**：让演示程序与运维脚本一行代码获得可读的结构化日志；
/// - **逻辑（How）**：
///   1. 拒绝重复安装与外部已设置的 Subscriber；
///   2. `directives` 为空时优先读取 `RUST_LOG`，否则回落到 [`DEFAULT_DIRECTIVES`]；
///   3. 组装 `registry + EnvFilter + fmt` 并设为全局默认；
/// - **契约（What）**：成功后进程内只安装一次，后续调用返回 [`ObservabilityError::AlreadyInstalled`]。
pub fn install_subscriber(directives: Option<&str>) -> Result<(), ObservabilityError> {
    if let Some(existing) = INSTALLED.get() {
        return Err(ObservabilityError::AlreadyInstalled {
            directives: existing.clone(),
        });
    }
    if dispatcher::has_been_set() {
        return Err(ObservabilityError::SubscriberAlreadySet);
    }

    let (filter, applied) = build_env_filter(directives)?;
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true));
    tracing::subscriber::set_global_default(subscriber)?;

    INSTALLED
        .set(applied.clone())
        .map_err(|_| ObservabilityError::AlreadyInstalled { directives: applied })
}

fn build_env_filter(directives: Option<&str>) -> Result<(EnvFilter, String), ObservabilityError> {
    match directives.map(str::trim).filter(|value| !value.is_empty()) {
        Some(explicit) => EnvFilter::try_new(explicit)
            .map(|filter| (filter, explicit.to_owned()))
            .map_err(|err| ObservabilityError::InvalidDirectives {
                directives: explicit.to_owned(),
                detail: err.to_string(),
            }),
        None => Ok(EnvFilter::try_from_default_env()
            .map(|filter| {
                let applied = filter.to_string();
                (filter, applied)
            })
            .unwrap_or_else(|_| {
                (
                    EnvFilter::new(DEFAULT_DIRECTIVES),
                    DEFAULT_DIRECTIVES.to_owned(),
                )
            })),
    }
}
