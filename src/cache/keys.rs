//! Cache key generation.
//!
//! Keys look like `<namespace>.<type name>` or
//! `<namespace>.<type name>.<name>-<value>_<name>-<value>`, with filter
//! attributes always emitted in name order so that the same logical filter
//! maps to the same key however it was built.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::config::CacheConfig;
use super::error::CacheError;

/// A single filter attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Null => Ok(()),
            FilterValue::Bool(value) => write!(f, "{value}"),
            FilterValue::Int(value) => write!(f, "{value}"),
            FilterValue::UInt(value) => write!(f, "{value}"),
            FilterValue::Float(value) => write!(f, "{value}"),
            FilterValue::Text(value) => f.write_str(value),
        }
    }
}

impl FilterValue {
    fn from_json(value: Value) -> Self {
        match value {
            Value::Null => FilterValue::Null,
            Value::Bool(value) => FilterValue::Bool(value),
            Value::Number(number) => {
                if let Some(value) = number.as_i64() {
                    FilterValue::Int(value)
                } else if let Some(value) = number.as_u64() {
                    FilterValue::UInt(value)
                } else {
                    FilterValue::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(value) => FilterValue::Text(value),
            // Structural values have no canonical scalar form; keep their JSON text.
            other @ (Value::Array(_) | Value::Object(_)) => FilterValue::Text(other.to_string()),
        }
    }
}

macro_rules! filter_value_from {
    ($variant:ident as $target:ty: $($source:ty),+) => {
        $(
            impl From<$source> for FilterValue {
                fn from(value: $source) -> Self {
                    FilterValue::$variant(<$target>::from(value))
                }
            }
        )+
    };
}

filter_value_from!(Int as i64: i8, i16, i32, i64);
filter_value_from!(UInt as u64: u8, u16, u32, u64);
filter_value_from!(Float as f64: f32, f64);

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

impl From<usize> for FilterValue {
    fn from(value: usize) -> Self {
        FilterValue::UInt(value as u64)
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl<T: Into<FilterValue>> From<Option<T>> for FilterValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FilterValue::Null, Into::into)
    }
}

/// Named attributes that narrow a cached read, e.g. `BusinessId = 1`.
///
/// Attributes are kept sorted by name; setting a name twice keeps the last value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyFilter {
    attributes: BTreeMap<String, FilterValue>,
}

impl KeyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) an attribute.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Build a filter from the top-level fields of a plain struct.
    ///
    /// `()` and `None` serialize to null and produce an empty filter. Anything
    /// that is not a struct or map is rejected.
    pub fn from_serialize<S: Serialize + ?Sized>(filter: &S) -> Result<Self, CacheError> {
        match serde_json::to_value(filter)? {
            Value::Null => Ok(Self::new()),
            Value::Object(fields) => Ok(Self {
                attributes: fields
                    .into_iter()
                    .map(|(name, value)| (name, FilterValue::from_json(value)))
                    .collect(),
            }),
            other => Err(CacheError::invalid_argument(
                "filter",
                format!("expected a struct or map of attributes, got `{other}`"),
            )),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn get(&self, name: &str) -> Option<&FilterValue> {
        self.attributes.get(name)
    }

    /// Attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.attributes
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    fn encode(&self) -> String {
        self.iter()
            .map(|(name, value)| format!("{name}-{value}"))
            .collect::<Vec<_>>()
            .join("_")
    }
}

impl<N: Into<String>, V: Into<FilterValue>> FromIterator<(N, V)> for KeyFilter {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |filter, (name, value)| filter.with(name, value))
    }
}

/// Builds deterministic cache keys under a fixed namespace.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    namespace: String,
}

impl KeyGenerator {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.namespace.clone())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn generate_key(&self, result_type_name: &str, filter: &KeyFilter) -> String {
        if filter.is_empty() {
            format!("{}.{}", self.namespace, result_type_name)
        } else {
            format!(
                "{}.{}.{}",
                self.namespace,
                result_type_name,
                filter.encode()
            )
        }
    }

    /// Key for results of type `T`, named by its fully qualified type path.
    ///
    /// `std::any::type_name` is only stable within one build, which is enough
    /// for an in-process cache. Use [`generate_key`](Self::generate_key) with
    /// an explicit name when a key must be reproduced elsewhere.
    pub fn generate_key_for<T: ?Sized>(&self, filter: &KeyFilter) -> String {
        self.generate_key(std::any::type_name::<T>(), filter)
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}
