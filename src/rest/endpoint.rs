//! Endpoint templating.
//!
//! Endpoints may contain `:name` placeholders, e.g.
//! `/categories/:category_id/posts`. Placeholders are filled from request
//! params and the used params are removed so they are not sent again as
//! query-string pairs.

use color_eyre::{eyre::eyre, Result};
use url::Url;

use crate::cache::{render_value, ItemId, Params};

/// Substitute `:name` placeholders with matching params.
///
/// A placeholder is filled only when its key is present with a non-null
/// value; the key is then removed from `params`. Unmatched placeholders are
/// left in place.
pub fn fill(endpoint: &str, params: &mut Params) -> String {
  let mut filled = String::with_capacity(endpoint.len());
  let mut rest = endpoint;

  while let Some(pos) = rest.find(':') {
    filled.push_str(&rest[..pos]);
    let after = &rest[pos + 1..];
    let name_len = after
      .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
      .unwrap_or(after.len());
    let name = &after[..name_len];

    match params.get(name) {
      Some(value) if !name.is_empty() && !value.is_null() => {
        filled.push_str(&render_value(value));
        params.remove(name);
      }
      _ => {
        filled.push(':');
        filled.push_str(name);
      }
    }
    rest = &after[name_len..];
  }

  filled.push_str(rest);
  filled
}

/// Append `id` to an already filled collection URL as a single
/// percent-encoded path segment. A query string on the endpoint stays after it.
pub fn push_item_id(url: &mut Url, id: &ItemId) -> Result<()> {
  match url.path_segments_mut() {
    Ok(mut segments) => {
      segments.pop_if_empty().push(&id.to_string());
      Ok(())
    }
    Err(()) => Err(eyre!("Cannot append item {} to a non-hierarchical URL", id)),
  }
}
