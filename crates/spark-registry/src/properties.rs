//! 服务属性模型。
//!
//! # 模块定位（Why）
//! - 注册表中的每个能力都携带一组键值属性，过滤表达式与排序规则均基于这些属性求值；
//! - 键名遵循 OSGi 语义：比较时大小写不敏感，但保留发布者书写时的原始大小写用于展示。
//!
//! # 契约说明（What）
//! - [`Properties`] 以小写键为索引维护有序映射，遍历顺序稳定；
//! - [`PropertyValue`] 覆盖字符串、整数、浮点、布尔与列表五类取值，可通过 serde 无标签形式读写；
//! - 保留键（`objectClass`、`service.id`）由注册表在发布时写入，调用方写入的同名值会被覆盖。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 接口名列表所在的保留键。
pub const OBJECT_CLASS: &str = "objectClass";
/// 注册表分配的服务编号。
pub const SERVICE_ID: &str = "service.id";
/// 服务排名，数值越大越优先。
pub const SERVICE_RANKING: &str = "service.ranking";
/// 显式目标标识：发布者所属组件名。
pub const COMPONENT_NAME: &str = "component.name";
/// 发布者的环境上下文名称，供调用方切换上下文时使用。
pub const PROVIDER_CONTEXT: &str = "provider.context";

/// 单个属性取值。
///
/// 序列化采用无标签形式，因此 TOML/JSON 中的 `true`、`42`、`"en"`、`[1, 2]` 可直接映射。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// 以字符串视图读取，仅对 `Str` 变体返回 `Some`。
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(value) => Some(value),
            _ => None,
        }
    }

    /// 以整数读取；字符串形式的整数同样被接受，便于比较来自配置文件的值。
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(value) => Some(*value),
            PropertyValue::Str(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::List(values) => Some(values),
            _ => None,
        }
    }

    /// 判断列表或标量中是否存在与 `needle` 相等的字符串。
    pub fn contains_str(&self, needle: &str) -> bool {
        match self {
            PropertyValue::Str(value) => value == needle,
            PropertyValue::List(values) => values.iter().any(|value| value.contains_str(needle)),
            _ => false,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(value) => write!(f, "{value}"),
            PropertyValue::Int(value) => write!(f, "{value}"),
            PropertyValue::Float(value) => write!(f, "{value}"),
            PropertyValue::Str(value) => f.write_str(value),
            PropertyValue::List(values) => {
                f.write_str("[")?;
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(i64::from(value))
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        PropertyValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(values: Vec<T>) -> Self {
        PropertyValue::List(values.into_iter().map(Into::into).collect())
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Entry {
    key: String,
    value: PropertyValue,
}

/// 大小写不敏感的有序属性表。
///
/// # 教案式说明
/// - **意图 (Why)**：过滤表达式 `(Lang=en)` 与发布属性 `lang` 必须命中同一条目；
/// - **逻辑 (How)**：内部以小写键索引 `BTreeMap`，条目保存原始键名与取值；
/// - **契约 (What)**：`insert` 对同一键（忽略大小写）覆盖旧值并返回旧值；`iter` 按小写键的字典序输出。
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, PropertyValue>",
    into = "BTreeMap<String, PropertyValue>"
)]
pub struct Properties {
    entries: BTreeMap<String, Entry>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// 链式写入属性，便于在构造阶段一次性书写。
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// 写入属性并返回被覆盖的旧值。
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Option<PropertyValue> {
        let key = key.into();
        let folded = key.to_ascii_lowercase();
        self.entries
            .insert(
                folded,
                Entry {
                    key,
                    value: value.into(),
                },
            )
            .map(|previous| previous.value)
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.entries
            .remove(&key.to_ascii_lowercase())
            .map(|entry| entry.value)
    }

    /// 忽略大小写读取属性。
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(|entry| &entry.value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按稳定顺序遍历 `(原始键, 值)`。
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries
            .values()
            .map(|entry| (entry.key.as_str(), &entry.value))
    }

    /// 将 `other` 中的条目合并进来，同名键以 `other` 为准。
    pub fn merge(&mut self, other: &Properties) {
        for (key, value) in other.iter() {
            self.insert(key, value.clone());
        }
    }

    /// 读取 `service.ranking`，缺失或类型不符时视为 0。
    pub fn ranking(&self) -> i64 {
        self.get(SERVICE_RANKING)
            .and_then(PropertyValue::as_i64)
            .unwrap_or(0)
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl From<BTreeMap<String, PropertyValue>> for Properties {
    fn from(map: BTreeMap<String, PropertyValue>) -> Self {
        let mut properties = Properties::new();
        for (key, value) in map {
            properties.insert(key, value);
        }
        properties
    }
}

impl From<Properties> for BTreeMap<String, PropertyValue> {
    fn from(properties: Properties) -> Self {
        properties
            .entries
            .into_values()
            .map(|entry| (entry.key, entry.value))
            .collect()
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut properties = Properties::new();
        for (key, value) in iter {
            properties.insert(key, value);
        }
        properties
    }
}
