//! TOML 配置：默认值与能力引用描述。
//!
//! # 教案式说明
//! - **意图 (Why)**：引用描述通常由部署方维护，需要在启动时一次性读取并校验，错误在装配阶段暴露；
//! - **逻辑 (How)**：`serde` 反序列化为描述结构，再逐条经 [`CapabilityReference::builder`] 校验；
//!   时长以 `*_ms` 整数书写；
//! - **契约 (What)**：[`BindingConfig::from_toml_str`] 成功即意味着全部引用都能构造成功。
//!
//! ```toml
//! [defaults]
//! timeout_ms = 2000
//! retry_interval_ms = 100
//! backoff = { kind = "exponential", factor = 2, max_ms = 1000 }
//!
//! [[reference]]
//! name = "clock"
//! interfaces = ["demo.Clock"]
//! filter = "(zone=utc)"
//! cardinality = "1..1"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use spark_registry::ServiceId;
use thiserror::Error;

use crate::ambient::ContextPolicy;
use crate::binder::{
    CapabilityReference, Cardinality, DEFAULT_TIMEOUT, OnUnavailable, ServiceOrdering,
    TargetSelector,
};
use crate::error::BindingError;
use crate::retry::{Backoff, DEFAULT_RETRY_INTERVAL, RetryPolicy};

/// 配置读取错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse binding configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid defaults: {reason}")]
    InvalidDefaults { reason: String },
    #[error("reference `{reference}` is invalid: {source}")]
    Invalid {
        reference: String,
        #[source]
        source: BindingError,
    },
    #[error("no reference named `{name}` in configuration")]
    UnknownReference { name: String },
}

/// 退避策略的配置形态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackoffConfig {
    #[default]
    Fixed,
    Exponential { factor: u32, max_ms: u64 },
}

impl From<BackoffConfig> for Backoff {
    fn from(config: BackoffConfig) -> Self {
        match config {
            BackoffConfig::Fixed => Backoff::Fixed,
            BackoffConfig::Exponential { factor, max_ms } => Backoff::Exponential {
                factor,
                max: Duration::from_millis(max_ms),
            },
        }
    }
}

fn default_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_TIMEOUT.as_millis()).unwrap_or(u64::MAX)
}

fn default_retry_interval_ms() -> u64 {
    u64::try_from(DEFAULT_RETRY_INTERVAL.as_millis()).unwrap_or(u64::MAX)
}

/// `[defaults]` 表。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// `[[reference]]` 条目。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceDescriptor {
    pub name: String,
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub cardinality: Cardinality,
    /// 缺省时取 `[defaults].timeout_ms`。
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub target_service_id: Option<u64>,
    #[serde(default)]
    pub target_component: Option<String>,
    #[serde(default)]
    pub context: ContextPolicy,
    #[serde(default)]
    pub on_unavailable: OnUnavailable,
    /// `ranking`、`property:<key>` 或 `property:<key>:desc`。
    #[serde(default)]
    pub ordering: Option<String>,
}

impl ReferenceDescriptor {
    /// 应用默认值并校验。
    pub fn to_reference(&self, defaults: &Defaults) -> Result<CapabilityReference, BindingError> {
        let mut builder = CapabilityReference::builder(self.name.as_str())
            .interfaces(self.interfaces.iter().cloned())
            .cardinality(self.cardinality)
            .timeout(Duration::from_millis(
                self.timeout_ms.unwrap_or(defaults.timeout_ms),
            ))
            .context(self.context)
            .on_unavailable(self.on_unavailable);
        if let Some(filter) = &self.filter {
            builder = builder.filter(filter.as_str());
        }
        match (self.target_service_id, &self.target_component) {
            (Some(_), Some(_)) => {
                return Err(BindingError::invalid(format!(
                    "reference `{}` sets both target_service_id and target_component",
                    self.name
                )));
            }
            (Some(id), None) => {
                builder = builder.target(TargetSelector::ServiceId(ServiceId::new(id)));
            }
            (None, Some(component)) => {
                builder = builder.target(TargetSelector::ComponentName(component.clone()));
            }
            (None, None) => {}
        }
        if let Some(ordering) = &self.ordering {
            builder = builder.ordering(ServiceOrdering::parse(ordering)?);
        }
        builder.build()
    }
}

/// 整个配置文件。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default, rename = "reference")]
    pub references: Vec<ReferenceDescriptor>,
}

impl BindingConfig {
    /// 解析并校验全部条目。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: BindingConfig = toml::from_str(text)?;
        config.validate_defaults()?;
        config.references()?;
        tracing::debug!(
            references = config.references.len(),
            "binding configuration loaded"
        );
        Ok(config)
    }

    fn validate_defaults(&self) -> Result<(), ConfigError> {
        if self.defaults.retry_interval_ms == 0 {
            return Err(ConfigError::InvalidDefaults {
                reason: "retry_interval_ms must be positive".to_owned(),
            });
        }
        if let BackoffConfig::Exponential { factor, max_ms } = self.defaults.backoff
            && (factor < 1 || max_ms < self.defaults.retry_interval_ms)
        {
            return Err(ConfigError::InvalidDefaults {
                reason: format!(
                    "exponential backoff needs factor >= 1 and max_ms >= retry_interval_ms (got factor {factor}, max_ms {max_ms})"
                ),
            });
        }
        Ok(())
    }

    /// 全部引用，已应用默认值。
    pub fn references(&self) -> Result<Vec<CapabilityReference>, ConfigError> {
        self.references
            .iter()
            .map(|descriptor| self.build(descriptor))
            .collect()
    }

    /// 按名称取单个引用。
    pub fn reference(&self, name: &str) -> Result<CapabilityReference, ConfigError> {
        let descriptor = self
            .references
            .iter()
            .find(|descriptor| descriptor.name == name)
            .ok_or_else(|| ConfigError::UnknownReference {
                name: name.to_owned(),
            })?;
        self.build(descriptor)
    }

    fn build(&self, descriptor: &ReferenceDescriptor) -> Result<CapabilityReference, ConfigError> {
        descriptor
            .to_reference(&self.defaults)
            .map_err(|source| ConfigError::Invalid {
                reference: descriptor.name.clone(),
                source,
            })
    }

    /// 由默认值构造的重试策略模板。
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.defaults.retry_interval_ms))
            .with_backoff(self.defaults.backoff.into())
    }
}
