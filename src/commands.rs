//! Subcommands and their execution against a resource store

use clap::{Args, Subcommand};
use color_eyre::{eyre::eyre, Result};
use rescache::cache::{ItemId, Params, Query};
use rescache::rest::ResourceRegistry;
use serde_json::{json, Value};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Load a list of items
  List {
    resource: String,
    #[command(flatten)]
    target: Target,
    /// Append to the slot instead of replacing it
    #[arg(long)]
    more: bool,
  },
  /// Fetch a single item
  Get {
    resource: String,
    id: String,
    #[command(flatten)]
    target: Target,
  },
  /// Create an item from a JSON payload
  Create {
    resource: String,
    #[arg(short, long)]
    data: String,
    #[command(flatten)]
    target: Target,
  },
  /// Update an item with a JSON payload
  Update {
    resource: String,
    id: String,
    #[arg(short, long)]
    data: String,
    #[command(flatten)]
    target: Target,
  },
  /// Delete an item
  Delete {
    resource: String,
    id: String,
    #[command(flatten)]
    target: Target,
  },
}

/// Slot name and request parameters shared by every subcommand
#[derive(Args, Debug, Default)]
pub struct Target {
  /// Cache slot name
  #[arg(long)]
  cache: Option<String>,
  /// Request parameter as key=value; repeatable
  #[arg(short, long = "param", value_name = "KEY=VALUE")]
  params: Vec<String>,
}

impl Target {
  fn query(&self) -> Result<Query> {
    let mut query = Query::new();
    if let Some(cache) = &self.cache {
      query = query.cache(cache);
    }
    if !self.params.is_empty() {
      query = query.params(parse_params(&self.params)?);
    }
    Ok(query)
  }
}

/// Parse `key=value` pairs. Values that are valid JSON keep their type,
/// anything else is taken as a string.
pub fn parse_params(pairs: &[String]) -> Result<Params> {
  pairs
    .iter()
    .map(|pair| -> Result<(String, Value)> {
      let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| eyre!("Invalid parameter '{}', expected KEY=VALUE", pair))?;
      if key.is_empty() {
        return Err(eyre!("Invalid parameter '{}', empty key", pair));
      }
      let value = serde_json::from_str::<Value>(value)
        .unwrap_or_else(|_| Value::String(value.to_string()));
      Ok((key.to_string(), value))
    })
    .collect()
}

fn parse_payload(data: &str) -> Result<Value> {
  serde_json::from_str(data).map_err(|e| eyre!("Invalid JSON payload: {}", e))
}

/// Run a command and return what should be printed.
pub async fn execute(registry: &ResourceRegistry, command: Command) -> Result<Value> {
  match command {
    Command::List {
      resource,
      target,
      more,
    } => {
      let store = registry.get(&resource)?;
      let query = target.query()?;
      let cache = query.cache.clone();
      let items = if more {
        store.load_more(query).await?
      } else {
        store.load(query).await?
      };

      let pagination = store.pagination_for(cache.as_deref());
      if pagination.is_empty() {
        Ok(Value::Array(items))
      } else {
        Ok(json!({ "items": items, "pagination": pagination }))
      }
    }
    Command::Get {
      resource,
      id,
      target,
    } => {
      let store = registry.get(&resource)?;
      Ok(store.find(&ItemId::parse(&id), target.query()?).await?)
    }
    Command::Create {
      resource,
      data,
      target,
    } => {
      let store = registry.get(&resource)?;
      Ok(store.create(parse_payload(&data)?, target.query()?).await?)
    }
    Command::Update {
      resource,
      id,
      data,
      target,
    } => {
      let store = registry.get(&resource)?;
      let payload = parse_payload(&data)?;
      Ok(store.update(&ItemId::parse(&id), payload, target.query()?).await?)
    }
    Command::Delete {
      resource,
      id,
      target,
    } => {
      let store = registry.get(&resource)?;
      let id = ItemId::parse(&id);
      store.delete(&id, target.query()?).await?;
      Ok(json!({ "deleted": id }))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pairs(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn test_params_keep_json_types() {
    let params =
      parse_params(&pairs(&["page=2", "q=rust", "draft=false", "tags=[\"a\"]"])).unwrap();

    assert_eq!(params.get("page"), Some(&json!(2)));
    assert_eq!(params.get("q"), Some(&json!("rust")));
    assert_eq!(params.get("draft"), Some(&json!(false)));
    assert_eq!(params.get("tags"), Some(&json!(["a"])));
  }

  #[test]
  fn test_param_value_may_contain_equals() {
    let params = parse_params(&pairs(&["filter=a=b"])).unwrap();
    assert_eq!(params.get("filter"), Some(&json!("a=b")));
  }

  #[test]
  fn test_malformed_params_rejected() {
    assert!(parse_params(&pairs(&["page"])).is_err());
    assert!(parse_params(&pairs(&["=2"])).is_err());
  }

  #[test]
  fn test_target_without_params_has_no_params() {
    let query = Target::default().query().unwrap();
    assert!(query.params.is_none());
    assert!(query.cache.is_none());
  }
}
