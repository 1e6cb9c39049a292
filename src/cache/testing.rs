//! Scripted transport for store tests.

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use super::key::Params;
use super::traits::{ItemId, Transport};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
  List(Option<Params>),
  Find(ItemId, Option<Params>),
  Create(Value, Option<Params>),
  Update(ItemId, Value, Option<Params>),
  Destroy(ItemId, Option<Params>),
}

type Handler = Box<dyn Fn(&Call) -> Result<Value> + Send + Sync>;

/// Answers every call through a handler and records it.
pub struct MockTransport {
  handler: Handler,
  calls: Arc<Mutex<Vec<Call>>>,
  hang: bool,
}

impl MockTransport {
  pub fn new<F>(handler: F) -> Self
  where
    F: Fn(&Call) -> Result<Value> + Send + Sync + 'static,
  {
    Self {
      handler: Box::new(handler),
      calls: Arc::new(Mutex::new(Vec::new())),
      hang: false,
    }
  }

  /// A transport whose calls never complete.
  pub fn hanging() -> Self {
    Self {
      hang: true,
      ..Self::new(|_| Ok(Value::Null))
    }
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  async fn respond(&self, call: Call) -> Result<Value> {
    self.calls.lock().unwrap().push(call.clone());
    if self.hang {
      futures::future::pending::<()>().await;
    }
    tokio::task::yield_now().await;
    (self.handler)(&call)
  }
}

#[async_trait]
impl Transport for MockTransport {
  fn endpoint(&self) -> &str {
    "/mock"
  }

  async fn list(&self, params: Option<Params>) -> Result<Value> {
    self.respond(Call::List(params)).await
  }

  async fn find(&self, id: &ItemId, params: Option<Params>) -> Result<Value> {
    self.respond(Call::Find(id.clone(), params)).await
  }

  async fn create(&self, payload: Value, params: Option<Params>) -> Result<Value> {
    self.respond(Call::Create(payload, params)).await
  }

  async fn update(&self, id: &ItemId, payload: Value, params: Option<Params>) -> Result<Value> {
    self.respond(Call::Update(id.clone(), payload, params)).await
  }

  async fn destroy(&self, id: &ItemId, params: Option<Params>) -> Result<()> {
    self.respond(Call::Destroy(id.clone(), params)).await.map(|_| ())
  }
}
