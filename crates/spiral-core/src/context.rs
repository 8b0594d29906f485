//! Choice contexts: string keys mapped to scalar values.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A scalar context value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::Bool(b) => write!(f, "{}", b),
            ContextValue::Int(i) => write!(f, "{}", i),
            ContextValue::Float(x) => write!(f, "{}", x),
            ContextValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::Text(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::Text(value)
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        ContextValue::Int(value)
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        ContextValue::Float(value)
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Bool(value)
    }
}

/// Context of a choice primitive. Ordered so derived keys are stable.
pub type Context = BTreeMap<String, ContextValue>;

/// Build a context from key/value pairs.
pub fn context<K, V, I>(pairs: I) -> Context
where
    K: Into<String>,
    V: Into<ContextValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Restrict a context to the given keys. Missing keys are skipped.
pub fn project(ctx: &Context, keys: &[String]) -> Context {
    keys.iter()
        .filter_map(|k| ctx.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

/// True if every pair in `subset` appears in `ctx` with an equal value.
///
/// An empty subset matches nothing.
pub fn matches_subset(subset: &Context, ctx: &Context) -> bool {
    !subset.is_empty() && subset.iter().all(|(k, v)| ctx.get(k) == Some(v))
}

/// Canonical `k=v,k=v` rendering, used to derive topics.
pub fn canonical(ctx: &Context) -> String {
    ctx.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
