//! One cache store per configured resource.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;

use crate::cache::{FieldResolvers, ResourceStore};
use crate::config::Config;

use super::client::HttpTransport;

/// Store type backed by the HTTP transport.
pub type HttpStore = ResourceStore<HttpTransport, FieldResolvers>;

/// Stores for every resource in the config, built once and shared by
/// reference.
pub struct ResourceRegistry {
  stores: BTreeMap<String, HttpStore>,
}

impl ResourceRegistry {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token();

    let stores = config
      .resources
      .iter()
      .map(|(name, resource)| {
        let transport = HttpTransport::builder(&config.base_url, &resource.endpoint)
          .token(token.clone())
          .timeout(config.timeout())
          .build()?;
        let resolvers = FieldResolvers::new(&resource.id_field, &resource.data_field);
        Ok((name.clone(), ResourceStore::with_resolvers(transport, resolvers)))
      })
      .collect::<Result<BTreeMap<_, _>>>()?;

    Ok(Self { stores })
  }

  /// Store for a configured resource. Unknown names list the configured ones.
  pub fn get(&self, name: &str) -> Result<&HttpStore> {
    self.stores.get(name).ok_or_else(|| {
      eyre!(
        "Unknown resource '{}'. Configured: {}",
        name,
        self.names().collect::<Vec<_>>().join(", ")
      )
    })
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.stores.keys().map(String::as_str)
  }
}
