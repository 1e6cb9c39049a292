use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::cache::{ItemId, Params, Transport};

use super::endpoint::{fill, push_item_id};

/// Parameter that tells the server to treat a POST as a PUT.
const METHOD_OVERRIDE: &str = "_method";

/// HTTP transport for one collection endpoint.
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
  base_url: String,
  endpoint: String,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(base_url: &str, endpoint: &str) -> Result<Self> {
    Self::builder(base_url, endpoint).build()
  }

  pub fn builder(base_url: &str, endpoint: &str) -> HttpTransportBuilder {
    HttpTransportBuilder {
      base_url: base_url.trim_end_matches('/').to_string(),
      endpoint: endpoint.to_string(),
      token: None,
      timeout: None,
    }
  }

  /// Resolve a (filled) endpoint path against the base URL.
  fn url(&self, path: &str) -> Result<Url> {
    let full = if path.starts_with("http://") || path.starts_with("https://") {
      path.to_string()
    } else {
      format!("{}{}", self.base_url, path)
    };
    Url::parse(&full).map_err(|e| eyre!("Invalid URL {}: {}", full, e))
  }

  /// Build a request against the collection endpoint, or against one item of
  /// it when `id` is given. Placeholders are filled before the id is appended.
  fn request(
    &self,
    method: Method,
    id: Option<&ItemId>,
    params: Option<Params>,
  ) -> Result<RequestBuilder> {
    let mut params = params.unwrap_or_default();
    let mut url = self.url(&fill(&self.endpoint, &mut params))?;
    if let Some(id) = id {
      push_item_id(&mut url, id)?;
    }

    let mut request = self.client.request(method, url);
    if !params.is_empty() {
      request = request.query(&params.to_query_pairs());
    }
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    Ok(request)
  }

  async fn send_json(&self, request: RequestBuilder, what: &str) -> Result<Value> {
    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to {} {}: {}", what, self.endpoint, e))?
      .error_for_status()
      .map_err(|e| eyre!("Failed to {} {}: {}", what, self.endpoint, e))?;

    response
      .json::<Value>()
      .await
      .map_err(|e| eyre!("Failed to parse {} response from {}: {}", what, self.endpoint, e))
  }
}

pub struct HttpTransportBuilder {
  base_url: String,
  endpoint: String,
  token: Option<String>,
  timeout: Option<Duration>,
}

impl HttpTransportBuilder {
  pub fn token(mut self, token: Option<String>) -> Self {
    self.token = token;
    self
  }

  pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn build(self) -> Result<HttpTransport> {
    let mut client = Client::builder();
    if let Some(timeout) = self.timeout {
      client = client.timeout(timeout);
    }
    let client = client
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(HttpTransport {
      client,
      base_url: self.base_url,
      endpoint: self.endpoint,
      token: self.token,
    })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  fn endpoint(&self) -> &str {
    &self.endpoint
  }

  async fn list(&self, params: Option<Params>) -> Result<Value> {
    let request = self.request(Method::GET, None, params)?;
    self.send_json(request, "list").await
  }

  async fn find(&self, id: &ItemId, params: Option<Params>) -> Result<Value> {
    let request = self.request(Method::GET, Some(id), params)?;
    self.send_json(request, "find").await
  }

  async fn create(&self, payload: Value, params: Option<Params>) -> Result<Value> {
    let request = self.request(Method::POST, None, params)?.json(&payload);
    self.send_json(request, "create").await
  }

  async fn update(&self, id: &ItemId, payload: Value, params: Option<Params>) -> Result<Value> {
    let params = params.unwrap_or_default().with(METHOD_OVERRIDE, "PUT");
    let request = self.request(Method::POST, Some(id), Some(params))?.json(&payload);
    self.send_json(request, "update").await
  }

  async fn destroy(&self, id: &ItemId, params: Option<Params>) -> Result<()> {
    self
      .request(Method::DELETE, Some(id), params)?
      .send()
      .await
      .map_err(|e| eyre!("Failed to delete {}/{}: {}", self.endpoint, id, e))?
      .error_for_status()
      .map_err(|e| eyre!("Failed to delete {}/{}: {}", self.endpoint, id, e))?;
    Ok(())
  }
}
