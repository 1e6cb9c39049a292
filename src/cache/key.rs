//! Request parameters and the keys derived from them.
//!
//! A cache slot remembers the serialized form of the parameters that produced
//! it, and the fetch registry keys in-flight requests by operation, slot name
//! and that same serialized form.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Query parameters for a resource request.
///
/// Keys are kept sorted so serialization is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style insert.
  pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.insert(key, value);
    self
  }

  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
    self.0.insert(key.into(), value.into());
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self.0.get(key)
  }

  pub fn remove(&mut self, key: &str) -> Option<Value> {
    self.0.remove(key)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.0.iter()
  }

  /// Parameters as rendered `(key, value)` pairs for a query string.
  ///
  /// Arrays expand into one `key[]` pair per element, the form PHP and Rails
  /// backends decode back into a list.
  pub fn to_query_pairs(&self) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(self.0.len());
    for (key, value) in &self.0 {
      match value {
        Value::Array(values) => {
          let key = format!("{}[]", key);
          pairs.extend(values.iter().map(|v| (key.clone(), render_value(v))));
        }
        other => pairs.push((key.clone(), render_value(other))),
      }
    }
    pairs
  }

  /// `k=v` pairs in key order joined with `&`.
  pub fn to_cache_key(&self) -> String {
    self
      .0
      .iter()
      .map(|(k, v)| format!("{}={}", k, render_value(v)))
      .collect::<Vec<_>>()
      .join("&")
  }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Params {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self(
      iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

/// Serialize optional parameters. `None` is the "no params" sentinel and is
/// distinct from an empty parameter set, which serializes to `""`.
pub fn serialize_params(params: Option<&Params>) -> Option<String> {
  params.map(Params::to_cache_key)
}

/// Render a parameter value the way it appears in a URL or a cache key.
pub fn render_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => "null".to_string(),
    Value::Array(values) => values
      .iter()
      .map(render_value)
      .collect::<Vec<_>>()
      .join(","),
    other => other.to_string(),
  }
}

/// Which store operation a fetch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
  Load,
  LoadMore,
  Find,
}

impl fmt::Display for FetchKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Load => "LOAD",
      Self::LoadMore => "LOAD_MORE",
      Self::Find => "FIND",
    };
    f.write_str(name)
  }
}

/// Identity of an in-flight request in the fetch registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
  pub kind: FetchKind,
  pub cache: String,
  pub params: Option<String>,
}

impl FetchKey {
  pub fn new(kind: FetchKind, cache: &str, params: Option<String>) -> Self {
    Self {
      kind,
      cache: cache.to_string(),
      params,
    }
  }
}

impl fmt::Display for FetchKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}:{}:{}",
      self.kind,
      self.cache,
      self.params.as_deref().unwrap_or("null")
    )
  }
}
