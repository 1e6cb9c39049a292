//! Core traits and types for the resource cache.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::key::Params;

/// Identifier of a cached item, as extracted by [`Resolvers::id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
  Int(i64),
  Str(String),
}

impl ItemId {
  /// Read an id out of a JSON value. Only integers and strings qualify.
  pub fn from_value(value: &Value) -> Result<Self> {
    match value {
      Value::Number(n) => n
        .as_i64()
        .map(Self::Int)
        .ok_or_else(|| eyre!("Unsupported numeric id: {}", n)),
      Value::String(s) => Ok(Self::Str(s.clone())),
      other => Err(eyre!("Unsupported id value: {}", other)),
    }
  }

  /// Parse user input: integers become `Int`, anything else `Str`.
  pub fn parse(s: &str) -> Self {
    s.parse::<i64>()
      .map(Self::Int)
      .unwrap_or_else(|_| Self::Str(s.to_string()))
  }
}

impl fmt::Display for ItemId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Int(n) => write!(f, "{}", n),
      Self::Str(s) => f.write_str(s),
    }
  }
}

impl From<i64> for ItemId {
  fn from(n: i64) -> Self {
    Self::Int(n)
  }
}

impl From<&str> for ItemId {
  fn from(s: &str) -> Self {
    Self::Str(s.to_string())
  }
}

impl From<String> for ItemId {
  fn from(s: String) -> Self {
    Self::Str(s)
  }
}

/// Pagination metadata of a list response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub total: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub per_page: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub current_page: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_page: Option<u64>,
}

impl Pagination {
  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }
}

/// The network side of a resource.
///
/// Implementors talk to one collection endpoint. Every call either returns
/// the decoded response body or fails; the store never retries.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  /// Endpoint label used in log lines.
  fn endpoint(&self) -> &str;

  async fn list(&self, params: Option<Params>) -> Result<Value>;

  async fn find(&self, id: &ItemId, params: Option<Params>) -> Result<Value>;

  async fn create(&self, payload: Value, params: Option<Params>) -> Result<Value>;

  /// Servers that cannot read PUT bodies get a POST with `_method=PUT`.
  async fn update(&self, id: &ItemId, payload: Value, params: Option<Params>) -> Result<Value>;

  async fn destroy(&self, id: &ItemId, params: Option<Params>) -> Result<()>;
}

/// Adapters from response shapes to items, ids and pagination.
pub trait Resolvers: Send + Sync + 'static {
  fn id(&self, item: &Value) -> Result<ItemId>;

  /// Single item out of a find/create/update response.
  fn item(&self, response: Value) -> Result<Value>;

  /// Ordered items out of a list response.
  fn items(&self, response: Value) -> Result<Vec<Value>>;

  fn pagination(&self, response: &Value) -> Option<Pagination>;
}

/// Per-slot progress flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
  Loading,
  Finding,
  Submitting,
}

/// A committed change to store state.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
  /// A cache slot was replaced
  SlotWritten { cache: String },
  /// Items were upserted into the item map
  ItemsMerged { ids: Vec<ItemId> },
  /// Unreferenced items were garbage collected
  ItemsEvicted { ids: Vec<ItemId> },
  /// An item was deleted upstream and dropped everywhere
  ItemDeleted { id: ItemId },
  /// A progress flag was raised or cleared
  FlagChanged {
    flag: Flag,
    cache: String,
    active: bool,
  },
}
