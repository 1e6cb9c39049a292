//! Field-based response resolvers.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;

use super::traits::{ItemId, Pagination, Resolvers};

/// Resolves items by field name.
///
/// Handles both a bare JSON array and a paginated envelope of the form
/// `{ "data": [...], "total": .., "per_page": .., "current_page": .., "last_page": .. }`.
#[derive(Debug, Clone)]
pub struct FieldResolvers {
  id_field: String,
  data_field: String,
}

impl Default for FieldResolvers {
  fn default() -> Self {
    Self {
      id_field: "id".to_string(),
      data_field: "data".to_string(),
    }
  }
}

impl FieldResolvers {
  pub fn new(id_field: impl Into<String>, data_field: impl Into<String>) -> Self {
    Self {
      id_field: id_field.into(),
      data_field: data_field.into(),
    }
  }

  pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
    self.id_field = field.into();
    self
  }

  pub fn with_data_field(mut self, field: impl Into<String>) -> Self {
    self.data_field = field.into();
    self
  }
}

impl Resolvers for FieldResolvers {
  fn id(&self, item: &Value) -> Result<ItemId> {
    let value = item
      .get(&self.id_field)
      .ok_or_else(|| eyre!("Item has no '{}' field", self.id_field))?;
    ItemId::from_value(value)
  }

  fn item(&self, response: Value) -> Result<Value> {
    Ok(response)
  }

  fn items(&self, response: Value) -> Result<Vec<Value>> {
    let list = match response {
      Value::Object(mut envelope) => envelope
        .remove(&self.data_field)
        .ok_or_else(|| eyre!("List response has no '{}' field", self.data_field))?,
      other => other,
    };

    match list {
      Value::Array(items) => Ok(items),
      other => Err(eyre!("Expected a list of items, got: {}", other)),
    }
  }

  fn pagination(&self, response: &Value) -> Option<Pagination> {
    response.get(&self.data_field)?;

    let field = |name: &str| response.get(name).and_then(Value::as_u64);
    Some(Pagination {
      total: field("total"),
      per_page: field("per_page"),
      current_page: field("current_page"),
      last_page: field("last_page"),
    })
  }
}
