//! Resource store that orchestrates caching logic with network fetching.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, trace, warn};

use super::error::UpstreamError;
use super::key::{serialize_params, FetchKey, FetchKind, Params};
use super::resolvers::FieldResolvers;
use super::storage::{dedup_ids, CacheSlot, StoreSnapshot, StoreState};
use super::traits::{Flag, ItemId, Pagination, Resolvers, StoreEvent, Transport};

/// Default slot name for lists.
pub const ALL: &str = "ALL";
/// Default slot name for single items.
pub const CURRENT: &str = "CURRENT";

const EVENT_CAPACITY: usize = 256;

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, UpstreamError>>>;

/// Options shared by every store operation.
#[derive(Debug, Clone, Default)]
pub struct Query {
  /// Slot name; each operation has its own default
  pub cache: Option<String>,
  pub params: Option<Params>,
  /// Bypass a valid cached result (load, load_more and find only)
  pub refresh: bool,
}

impl Query {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cache(mut self, name: impl Into<String>) -> Self {
    self.cache = Some(name.into());
    self
  }

  pub fn params(mut self, params: Params) -> Self {
    self.params = Some(params);
    self
  }

  pub fn refresh(mut self, refresh: bool) -> Self {
    self.refresh = refresh;
    self
  }

  fn cache_or(&self, default: &str) -> String {
    self.cache.clone().unwrap_or_else(|| default.to_string())
  }
}

/// Everything guarded by the store lock.
#[derive(Default)]
struct Inner {
  state: StoreState,
  list_fetches: HashMap<FetchKey, SharedFetch<Vec<Value>>>,
  item_fetches: HashMap<FetchKey, SharedFetch<Value>>,
}

struct DecodedList {
  items: Vec<(ItemId, Value)>,
  pagination: Option<Pagination>,
}

/// Client-side cache for one REST collection.
///
/// Holds an id-keyed item map shared by any number of named cache slots.
/// Identical concurrent loads and finds are coalesced onto one network call.
/// The lock is never held across an `.await`, so every commit is atomic with
/// respect to other operations.
pub struct ResourceStore<T: Transport, R: Resolvers = FieldResolvers> {
  transport: Arc<T>,
  resolvers: Arc<R>,
  inner: Arc<Mutex<Inner>>,
  events: broadcast::Sender<StoreEvent>,
}

impl<T: Transport> ResourceStore<T, FieldResolvers> {
  /// Create a store with the default field resolvers.
  pub fn new(transport: T) -> Self {
    Self::with_resolvers(transport, FieldResolvers::default())
  }
}

impl<T: Transport, R: Resolvers> ResourceStore<T, R> {
  pub fn with_resolvers(transport: T, resolvers: R) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      transport: Arc::new(transport),
      resolvers: Arc::new(resolvers),
      inner: Arc::new(Mutex::new(Inner::default())),
      events,
    }
  }

  pub fn transport(&self) -> &T {
    &self.transport
  }

  /// Receive committed changes.
  ///
  /// Events arrive in commit order across all operations; each commit's events
  /// are contiguous.
  pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
    self.events.subscribe()
  }

  /// Load a list into a slot (default `ALL`).
  ///
  /// 1. A slot fetched with the same params is returned as-is unless `refresh`
  /// 2. An identical request already in flight is awaited instead of repeated
  /// 3. Otherwise the list is fetched and replaces the slot
  pub async fn load(&self, query: Query) -> Result<Vec<Value>, UpstreamError> {
    self.fetch_list(FetchKind::Load, query).await
  }

  /// Like [`load`](Self::load), but appends the fetched ids to the slot's
  /// existing ids instead of replacing them.
  pub async fn load_more(&self, query: Query) -> Result<Vec<Value>, UpstreamError> {
    self.fetch_list(FetchKind::LoadMore, query).await
  }

  /// Fetch a single item into a slot (default `CURRENT`).
  pub async fn find(&self, id: &ItemId, query: Query) -> Result<Value, UpstreamError> {
    let cache = query.cache_or(CURRENT);
    let serialized = serialize_params(query.params.as_ref());

    let pending = {
      let mut inner = self.lock();

      if !query.refresh {
        let hit = inner
          .state
          .valid_slot(&cache, serialized.as_deref())
          .filter(|slot| slot.ids.first() == Some(id))
          .and_then(|_| inner.state.item(id).cloned());
        if let Some(item) = hit {
          debug!(
            "FIND({}):{} {}@{} ... result cache hit",
            cache,
            id,
            self.transport.endpoint(),
            serialized.as_deref().unwrap_or("null")
          );
          return Ok(item);
        }
      }

      let key = FetchKey::new(FetchKind::Find, &cache, serialized.clone());
      match inner.item_fetches.get(&key).cloned() {
        Some(pending) => {
          debug!(
            "FIND({}):{} {}@{} ... fetch in flight",
            cache,
            id,
            self.transport.endpoint(),
            serialized.as_deref().unwrap_or("null")
          );
          pending
        }
        None => {
          inner.state.set_flag(Flag::Finding, &cache, true);
          let task = tokio::spawn(self.clone().run_find(key.clone(), id.clone(), query.params));
          let pending = self.share(task, Flag::Finding, key.clone());
          inner.item_fetches.insert(key, pending.clone());
          pending
        }
      }
    };
    self.flush_events();

    pending.await
  }

  /// Create an item. On success its id is appended to the slot (default
  /// `ALL`) if that slot exists.
  pub async fn create(&self, payload: Value, query: Query) -> Result<Value, UpstreamError> {
    let cache = query.cache_or(ALL);
    self.set_flag(Flag::Submitting, &cache, true);

    let task = tokio::spawn(self.clone().run_create(cache.clone(), payload, query.params));
    self.supervise(task, Flag::Submitting, cache, None).await
  }

  /// Update an item and merge the response into the stored record.
  /// Slot membership is untouched.
  pub async fn update(
    &self,
    id: &ItemId,
    payload: Value,
    query: Query,
  ) -> Result<Value, UpstreamError> {
    let cache = query.cache_or(CURRENT);
    self.set_flag(Flag::Submitting, &cache, true);

    let task = tokio::spawn(self.clone().run_update(
      cache.clone(),
      id.clone(),
      payload,
      query.params,
    ));
    self.supervise(task, Flag::Submitting, cache, None).await
  }

  /// Delete an item upstream, then drop it from the item map and from every
  /// slot that references it.
  pub async fn delete(&self, id: &ItemId, query: Query) -> Result<(), UpstreamError> {
    let cache = query.cache_or(CURRENT);
    self.set_flag(Flag::Submitting, &cache, true);

    let task = tokio::spawn(self.clone().run_delete(cache.clone(), id.clone(), query.params));
    self.supervise(task, Flag::Submitting, cache, None).await
  }

  /// Items of a slot in slot order. Ids whose item is gone are skipped.
  pub fn items_for(&self, cache: Option<&str>) -> Vec<Value> {
    let inner = self.lock();
    inner
      .state
      .slot(cache.unwrap_or(ALL))
      .map(|slot| inner.state.resolve(&slot.ids))
      .unwrap_or_default()
  }

  /// The item behind a slot's first id.
  pub fn item_for(&self, cache: Option<&str>) -> Option<Value> {
    let inner = self.lock();
    let slot = inner.state.slot(cache.unwrap_or(CURRENT))?;
    slot
      .ids
      .first()
      .and_then(|id| inner.state.item(id).cloned())
  }

  /// A slot's pagination; empty when the slot is missing or unpaginated.
  pub fn pagination_for(&self, cache: Option<&str>) -> Pagination {
    self
      .lock()
      .state
      .slot(cache.unwrap_or(ALL))
      .and_then(|slot| slot.pagination.clone())
      .unwrap_or_default()
  }

  pub fn is_loading(&self, cache: &str) -> bool {
    self.lock().state.flag(Flag::Loading, cache)
  }

  pub fn is_finding(&self, cache: &str) -> bool {
    self.lock().state.flag(Flag::Finding, cache)
  }

  pub fn is_submitting(&self, cache: &str) -> bool {
    self.lock().state.flag(Flag::Submitting, cache)
  }

  /// Number of requests currently registered as in flight.
  pub fn pending_fetches(&self) -> usize {
    let inner = self.lock();
    inner.list_fetches.len() + inner.item_fetches.len()
  }

  pub fn snapshot(&self) -> StoreSnapshot {
    self.lock().state.snapshot()
  }

  async fn fetch_list(&self, kind: FetchKind, query: Query) -> Result<Vec<Value>, UpstreamError> {
    let cache = query.cache_or(ALL);
    let serialized = serialize_params(query.params.as_ref());

    let pending = {
      let mut inner = self.lock();

      if !query.refresh {
        if let Some(slot) = inner.state.valid_slot(&cache, serialized.as_deref()) {
          debug!(
            "{}({}) {}@{} ... result cache hit",
            kind,
            cache,
            self.transport.endpoint(),
            serialized.as_deref().unwrap_or("null")
          );
          return Ok(inner.state.resolve(&slot.ids));
        }
      }

      let key = FetchKey::new(kind, &cache, serialized.clone());
      match inner.list_fetches.get(&key).cloned() {
        Some(pending) => {
          debug!(
            "{}({}) {}@{} ... fetch in flight",
            kind,
            cache,
            self.transport.endpoint(),
            serialized.as_deref().unwrap_or("null")
          );
          pending
        }
        None => {
          inner.state.set_flag(Flag::Loading, &cache, true);
          let task = tokio::spawn(self.clone().run_list(key.clone(), query.params));
          let pending = self.share(task, Flag::Loading, key.clone());
          inner.list_fetches.insert(key, pending.clone());
          pending
        }
      }
    };
    self.flush_events();

    pending.await
  }

  async fn run_list(
    self,
    key: FetchKey,
    params: Option<Params>,
  ) -> Result<Vec<Value>, UpstreamError> {
    debug!("{} {} ... requesting", key, self.transport.endpoint());
    let decoded = match self.transport.list(params).await {
      Ok(response) => self.decode_list(response),
      Err(e) => Err(e),
    };

    let outcome = {
      let mut inner = self.lock();
      let outcome = decoded.map(|list| {
        let state = &mut inner.state;
        let mut ids: Vec<ItemId> = list.items.iter().map(|(id, _)| id.clone()).collect();
        state.merge_items(list.items);

        if key.kind == FetchKind::LoadMore {
          let existing = state
            .slot(&key.cache)
            .map(|slot| slot.ids.clone())
            .unwrap_or_default();
          ids = dedup_ids(existing.into_iter().chain(ids));
        }

        let items = state.resolve(&ids);
        state.write_slot(
          &key.cache,
          CacheSlot::new(ids, list.pagination, key.params.clone()),
        );
        let evicted = state.clean_unused_items();
        if !evicted.is_empty() {
          trace!("{} evicted {} unused items", key, evicted.len());
        }
        items
      });
      inner.state.set_flag(Flag::Loading, &key.cache, false);
      inner.list_fetches.remove(&key);
      outcome
    };
    self.flush_events();

    outcome.map_err(|e| self.upstream(&key.to_string(), e))
  }

  async fn run_find(
    self,
    key: FetchKey,
    id: ItemId,
    params: Option<Params>,
  ) -> Result<Value, UpstreamError> {
    debug!("{} {}/{} ... requesting", key, self.transport.endpoint(), id);
    let decoded = match self.transport.find(&id, params).await {
      Ok(response) => self.decode_item(response),
      Err(e) => Err(e),
    };

    let outcome = {
      let mut inner = self.lock();
      let outcome = decoded.map(|(id, item)| {
        let state = &mut inner.state;
        state.merge_items([(id.clone(), item)]);
        state.write_slot(
          &key.cache,
          CacheSlot::new(vec![id.clone()], None, key.params.clone()),
        );
        let evicted = state.clean_unused_items();
        if !evicted.is_empty() {
          trace!("{} evicted {} unused items", key, evicted.len());
        }
        state.item(&id).cloned().unwrap_or(Value::Null)
      });
      inner.state.set_flag(Flag::Finding, &key.cache, false);
      inner.item_fetches.remove(&key);
      outcome
    };
    self.flush_events();

    outcome.map_err(|e| self.upstream(&key.to_string(), e))
  }

  async fn run_create(
    self,
    cache: String,
    payload: Value,
    params: Option<Params>,
  ) -> Result<Value, UpstreamError> {
    let decoded = match self.transport.create(payload, params).await {
      Ok(response) => self.decode_item(response),
      Err(e) => Err(e),
    };

    let outcome = {
      let mut inner = self.lock();
      let outcome = decoded.map(|(id, item)| {
        let state = &mut inner.state;
        state.merge_items([(id.clone(), item)]);
        state.append_to_slot(&cache, id.clone());
        state.item(&id).cloned().unwrap_or(Value::Null)
      });
      inner.state.set_flag(Flag::Submitting, &cache, false);
      outcome
    };
    self.flush_events();

    outcome.map_err(|e| self.upstream(&format!("CREATE({})", cache), e))
  }

  async fn run_update(
    self,
    cache: String,
    id: ItemId,
    payload: Value,
    params: Option<Params>,
  ) -> Result<Value, UpstreamError> {
    let decoded = match self.transport.update(&id, payload, params).await {
      Ok(response) => self.decode_item(response),
      Err(e) => Err(e),
    };

    let outcome = {
      let mut inner = self.lock();
      let outcome = decoded.map(|(id, item)| {
        let state = &mut inner.state;
        state.merge_items([(id.clone(), item)]);
        state.item(&id).cloned().unwrap_or(Value::Null)
      });
      inner.state.set_flag(Flag::Submitting, &cache, false);
      outcome
    };
    self.flush_events();

    outcome.map_err(|e| self.upstream(&format!("UPDATE({}):{}", cache, id), e))
  }

  async fn run_delete(
    self,
    cache: String,
    id: ItemId,
    params: Option<Params>,
  ) -> Result<(), UpstreamError> {
    let result = self.transport.destroy(&id, params).await;

    {
      let mut inner = self.lock();
      if result.is_ok() {
        inner.state.delete_item(&id);
      }
      inner.state.set_flag(Flag::Submitting, &cache, false);
    }
    self.flush_events();

    result.map_err(|e| self.upstream(&format!("DELETE({}):{}", cache, id), e))
  }

  fn decode_list(&self, response: Value) -> Result<DecodedList> {
    let pagination = self.resolvers.pagination(&response);
    let items = self
      .resolvers
      .items(response)?
      .into_iter()
      .map(|item| -> Result<(ItemId, Value)> { Ok((self.resolvers.id(&item)?, item)) })
      .collect::<Result<Vec<_>>>()?;
    Ok(DecodedList { items, pagination })
  }

  fn decode_item(&self, response: Value) -> Result<(ItemId, Value)> {
    let item = self.resolvers.item(response)?;
    let id = self.resolvers.id(&item)?;
    Ok((id, item))
  }

  /// Wrap a spawned fetch so every caller can await the same outcome.
  fn share<V>(
    &self,
    task: JoinHandle<Result<V, UpstreamError>>,
    flag: Flag,
    key: FetchKey,
  ) -> SharedFetch<V>
  where
    V: Clone + Send + Sync + 'static,
  {
    let cache = key.cache.clone();
    self.supervise(task, flag, cache, Some(key)).shared()
  }

  /// Await a spawned operation on a second task.
  ///
  /// The operation clears its own flag and registry entry. If it panics, the
  /// supervisor does the clearing instead, whether or not anyone still waits
  /// on the result.
  fn supervise<V>(
    &self,
    task: JoinHandle<Result<V, UpstreamError>>,
    flag: Flag,
    cache: String,
    key: Option<FetchKey>,
  ) -> BoxFuture<'static, Result<V, UpstreamError>>
  where
    V: Send + 'static,
  {
    let store = self.clone();
    let supervisor =
      tokio::spawn(async move { store.settle(task.await, flag, &cache, key.as_ref()) });

    async move {
      supervisor
        .await
        .unwrap_or_else(|e| Err(UpstreamError::from(eyre!("Request task failed: {}", e))))
    }
    .boxed()
  }

  fn settle<V>(
    &self,
    joined: Result<Result<V, UpstreamError>, JoinError>,
    flag: Flag,
    cache: &str,
    key: Option<&FetchKey>,
  ) -> Result<V, UpstreamError> {
    match joined {
      Ok(outcome) => outcome,
      Err(e) => {
        {
          let mut inner = self.lock();
          inner.state.set_flag(flag, cache, false);
          if let Some(key) = key {
            inner.list_fetches.remove(key);
            inner.item_fetches.remove(key);
          }
        }
        self.flush_events();
        Err(self.upstream(cache, eyre!("Request task failed: {}", e)))
      }
    }
  }

  fn upstream(&self, operation: &str, report: color_eyre::Report) -> UpstreamError {
    warn!(
      "{} {} ... failed: {}",
      operation,
      self.transport.endpoint(),
      report
    );
    UpstreamError::from(report)
  }

  fn set_flag(&self, flag: Flag, cache: &str, active: bool) {
    self.lock().state.set_flag(flag, cache, active);
    self.flush_events();
  }

  /// Broadcast queued events. Sent under the lock so batches from concurrent
  /// commits cannot overtake each other.
  fn flush_events(&self) {
    let mut inner = self.lock();
    for event in inner.state.take_events() {
      // No subscribers is fine
      let _ = self.events.send(event);
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl<T: Transport, R: Resolvers> Clone for ResourceStore<T, R> {
  fn clone(&self) -> Self {
    Self {
      transport: Arc::clone(&self.transport),
      resolvers: Arc::clone(&self.resolvers),
      inner: Arc::clone(&self.inner),
      events: self.events.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::testing::{Call, MockTransport};
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::time::Duration;

  fn page(ids: &[i64]) -> Value {
    Value::Array(
      ids
        .iter()
        .map(|id| json!({"id": id, "name": format!("item {}", id)}))
        .collect(),
    )
  }

  /// Lists answer with the ids in the `ids` param (comma separated), or 1..=3.
  fn echo_store() -> ResourceStore<MockTransport> {
    ResourceStore::new(MockTransport::new(|call| match call {
      Call::List(params) => {
        let ids: Vec<i64> = params
          .as_ref()
          .and_then(|p| p.get("ids"))
          .and_then(Value::as_str)
          .map(|s| s.split(',').filter_map(|n| n.parse().ok()).collect())
          .unwrap_or_else(|| vec![1, 2, 3]);
        Ok(page(&ids))
      }
      Call::Find(ItemId::Int(id), _) => Ok(json!({"id": id, "name": "found"})),
      Call::Find(_, _) => Err(eyre!("not found")),
      Call::Create(payload, _) => {
        let mut item = payload.clone();
        item["id"] = json!(100);
        Ok(item)
      }
      Call::Update(_, payload, _) => Ok(payload.clone()),
      Call::Destroy(_, _) => Ok(Value::Null),
    }))
  }

  fn ids_param(ids: &str) -> Query {
    Query::new().params(Params::new().with("ids", ids))
  }

  fn ids_of(items: &[Value]) -> Vec<i64> {
    items.iter().filter_map(|i| i["id"].as_i64()).collect()
  }

  #[tokio::test]
  async fn test_second_load_is_a_cache_hit() {
    let store = echo_store();

    let first = store.load(Query::new()).await.unwrap();
    let second = store.load(Query::new()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(ids_of(&first), vec![1, 2, 3]);
    assert_eq!(store.transport().call_count(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_loads_are_coalesced() {
    let store = echo_store();

    let (a, b) = tokio::join!(store.load(Query::new()), store.load(Query::new()));

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(store.transport().call_count(), 1);
    assert_eq!(store.pending_fetches(), 0);
  }

  #[tokio::test]
  async fn test_concurrent_finds_are_coalesced() {
    let store = echo_store();

    let (a, b) = tokio::join!(
      store.find(&ItemId::Int(1), Query::new()),
      store.find(&ItemId::Int(1), Query::new())
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(store.transport().call_count(), 1);
    assert_eq!(store.pending_fetches(), 0);
    assert!(!store.is_finding(CURRENT));
  }

  #[tokio::test]
  async fn test_concurrent_finds_in_one_slot_share_a_request_across_ids() {
    let store = echo_store();

    let (a, b) = tokio::join!(
      store.find(&ItemId::Int(1), Query::new()),
      store.find(&ItemId::Int(2), Query::new())
    );

    // The in-flight key is slot + params, so the second id rides on the first
    assert_eq!(a.unwrap()["id"], 1);
    assert_eq!(b.unwrap()["id"], 1);
    assert_eq!(store.transport().calls(), vec![Call::Find(ItemId::Int(1), None)]);
  }

  #[tokio::test]
  async fn test_param_change_invalidates_slot() {
    let store = echo_store();

    store.load(ids_param("1,2")).await.unwrap();
    let second = store.load(ids_param("5")).await.unwrap();

    assert_eq!(store.transport().call_count(), 2);
    assert_eq!(
      store.transport().calls()[1],
      Call::List(Some(Params::new().with("ids", "5")))
    );
    assert_eq!(ids_of(&second), vec![5]);
    assert_eq!(ids_of(&store.items_for(None)), vec![5]);

    // The old params are no longer cached either
    store.load(ids_param("1,2")).await.unwrap();
    assert_eq!(store.transport().call_count(), 3);
  }

  #[tokio::test]
  async fn test_refresh_bypasses_valid_slot() {
    let store = echo_store();

    store.load(Query::new()).await.unwrap();
    store.load(Query::new().refresh(true)).await.unwrap();

    assert_eq!(store.transport().call_count(), 2);
  }

  #[tokio::test]
  async fn test_absent_and_empty_params_are_different_slots() {
    let store = echo_store();

    store.load(Query::new()).await.unwrap();
    store.load(Query::new().params(Params::new())).await.unwrap();

    assert_eq!(store.transport().call_count(), 2);
  }

  #[tokio::test]
  async fn test_load_more_appends_unique_ids() {
    let store = ResourceStore::new(MockTransport::new(|call| match call {
      Call::List(Some(params)) if params.get("page") == Some(&json!(2)) => Ok(json!({
        "data": page(&[2, 3]),
        "total": 3,
        "per_page": 2,
        "current_page": 2,
        "last_page": 2
      })),
      _ => Ok(json!({
        "data": page(&[1, 2]),
        "total": 3,
        "per_page": 2,
        "current_page": 1,
        "last_page": 2
      })),
    }));

    store
      .load(Query::new().params(Params::new().with("page", 1)))
      .await
      .unwrap();
    let all = store
      .load_more(Query::new().params(Params::new().with("page", 2)))
      .await
      .unwrap();

    assert_eq!(ids_of(&all), vec![1, 2, 3]);
    assert_eq!(ids_of(&store.items_for(None)), vec![1, 2, 3]);
    assert_eq!(store.pagination_for(None).current_page, Some(2));
  }

  #[tokio::test]
  async fn test_load_more_without_slot_behaves_like_load() {
    let store = echo_store();

    let items = store.load_more(ids_param("4,4,5")).await.unwrap();

    assert_eq!(ids_of(&items), vec![4, 5]);
  }

  #[tokio::test]
  async fn test_items_referenced_by_other_slots_survive_gc() {
    let store = echo_store();

    store.load(ids_param("1,2").cache("A")).await.unwrap();
    store.load(ids_param("3,4").cache("B")).await.unwrap();

    assert_eq!(ids_of(&store.items_for(Some("A"))), vec![1, 2]);
    assert_eq!(ids_of(&store.items_for(Some("B"))), vec![3, 4]);
    assert_eq!(store.snapshot().items.len(), 4);
  }

  #[tokio::test]
  async fn test_reload_evicts_unreferenced_items() {
    let store = echo_store();

    store.load(ids_param("1,2")).await.unwrap();
    store.load(ids_param("2,3")).await.unwrap();

    let snapshot = store.snapshot();
    assert!(!snapshot.items.contains_key(&ItemId::Int(1)));
    assert!(snapshot.items.contains_key(&ItemId::Int(2)));
    assert!(snapshot.items.contains_key(&ItemId::Int(3)));
  }

  #[tokio::test]
  async fn test_find_caches_by_id_and_params() {
    let store = echo_store();

    let item = store.find(&ItemId::Int(7), Query::new()).await.unwrap();
    assert_eq!(item["name"], "found");
    store.find(&ItemId::Int(7), Query::new()).await.unwrap();
    assert_eq!(store.transport().call_count(), 1);

    // Different id in the same slot is a miss and replaces it
    store.find(&ItemId::Int(8), Query::new()).await.unwrap();
    assert_eq!(store.transport().call_count(), 2);
    assert_eq!(store.item_for(None).unwrap()["id"], 8);

    // Item 7 is no longer referenced anywhere
    assert!(!store.snapshot().items.contains_key(&ItemId::Int(7)));
  }

  #[tokio::test]
  async fn test_find_merges_into_list_item() {
    let store = ResourceStore::new(MockTransport::new(|call| match call {
      Call::List(_) => Ok(json!([{"id": 1, "name": "a", "summary": "short"}])),
      _ => Ok(json!({"id": 1, "name": "a", "body": "full"})),
    }));

    store.load(Query::new()).await.unwrap();
    let found = store.find(&ItemId::Int(1), Query::new()).await.unwrap();

    assert_eq!(found, json!({"id": 1, "name": "a", "summary": "short", "body": "full"}));
    assert_eq!(store.items_for(None), vec![found]);
  }

  #[tokio::test]
  async fn test_create_appends_to_existing_slot_only() {
    let store = echo_store();

    let created = store
      .create(json!({"name": "new"}), Query::new().cache("OTHER"))
      .await
      .unwrap();
    assert_eq!(created, json!({"id": 100, "name": "new"}));
    assert!(store.items_for(Some("OTHER")).is_empty());

    store.load(ids_param("1")).await.unwrap();
    store.create(json!({"name": "new"}), Query::new()).await.unwrap();

    assert_eq!(ids_of(&store.items_for(None)), vec![1, 100]);
    assert!(!store.is_submitting(ALL));
  }

  #[tokio::test]
  async fn test_update_merges_fields() {
    let store = ResourceStore::new(MockTransport::new(|call| match call {
      Call::Find(_, _) => Ok(json!({"id": 1, "name": "a", "extra": "x"})),
      _ => Ok(json!({"id": 1, "name": "b"})),
    }));

    store.find(&ItemId::Int(1), Query::new()).await.unwrap();
    let updated = store
      .update(&ItemId::Int(1), json!({"name": "b"}), Query::new())
      .await
      .unwrap();

    assert_eq!(updated, json!({"id": 1, "name": "b", "extra": "x"}));
    assert_eq!(store.item_for(None).unwrap(), updated);
    assert_eq!(store.snapshot().caches[CURRENT].ids, vec![ItemId::Int(1)]);
  }

  #[tokio::test]
  async fn test_delete_scrubs_every_slot() {
    let store = echo_store();

    store.load(ids_param("1,2")).await.unwrap();
    store.find(&ItemId::Int(2), Query::new()).await.unwrap();

    store.delete(&ItemId::Int(2), Query::new()).await.unwrap();

    assert_eq!(ids_of(&store.items_for(None)), vec![1]);
    assert_eq!(store.item_for(None), None);
    assert!(!store.snapshot().items.contains_key(&ItemId::Int(2)));
    assert!(!store.is_submitting(CURRENT));
  }

  #[tokio::test]
  async fn test_failed_load_keeps_slot_and_clears_flag() {
    let store = ResourceStore::new(MockTransport::new(|call| match call {
      Call::List(Some(_)) => Err(eyre!("connection refused")),
      _ => Ok(page(&[1])),
    }));

    store.load(Query::new()).await.unwrap();
    let err = store
      .load(Query::new().params(Params::new().with("page", 2)))
      .await
      .unwrap_err();

    assert!(err.to_string().contains("connection refused"));
    assert!(!store.is_loading(ALL));
    assert_eq!(store.pending_fetches(), 0);
    assert_eq!(ids_of(&store.items_for(None)), vec![1]);
    assert_eq!(store.snapshot().caches[ALL].params, None);
  }

  #[tokio::test]
  async fn test_coalesced_callers_share_the_error() {
    let store = ResourceStore::new(MockTransport::new(|_| Err(eyre!("boom"))));

    let (a, b) = tokio::join!(store.load(Query::new()), store.load(Query::new()));

    assert_eq!(a.unwrap_err().to_string(), b.unwrap_err().to_string());
    assert_eq!(store.transport().call_count(), 1);
  }

  #[tokio::test]
  async fn test_undecodable_response_commits_nothing() {
    let store = ResourceStore::new(MockTransport::new(|_| {
      Ok(json!([{"id": 1}, {"name": "no id"}]))
    }));

    assert!(store.load(Query::new()).await.is_err());
    assert!(store.snapshot().items.is_empty());
    assert!(store.snapshot().caches.is_empty());
  }

  #[tokio::test]
  async fn test_failed_submissions_change_nothing() {
    let store = ResourceStore::new(MockTransport::new(|call| match call {
      Call::List(_) => Ok(page(&[1])),
      _ => Err(eyre!("rejected")),
    }));
    store.load(Query::new()).await.unwrap();
    let before = store.items_for(None);

    assert!(store.create(json!({"name": "x"}), Query::new()).await.is_err());
    assert!(store
      .update(&ItemId::Int(1), json!({"name": "x"}), Query::new())
      .await
      .is_err());
    assert!(store.delete(&ItemId::Int(1), Query::new().cache(ALL)).await.is_err());

    assert_eq!(store.items_for(None), before);
    assert!(!store.is_submitting(ALL));
    assert!(!store.is_submitting(CURRENT));
  }

  #[tokio::test]
  async fn test_hanging_request_keeps_its_key_occupied() {
    let store = ResourceStore::new(MockTransport::hanging());

    let first = tokio::time::timeout(Duration::from_millis(20), store.load(Query::new())).await;
    assert!(first.is_err());
    assert!(store.is_loading(ALL));
    assert_eq!(store.pending_fetches(), 1);

    // Same key waits on the stuck request instead of issuing a new one
    let second = tokio::time::timeout(Duration::from_millis(20), store.load(Query::new())).await;
    assert!(second.is_err());
    assert_eq!(store.transport().call_count(), 1);

    // A different key is not blocked from dispatching
    let other = tokio::time::timeout(
      Duration::from_millis(20),
      store.load(Query::new().cache("OTHER")),
    )
    .await;
    assert!(other.is_err());
    assert_eq!(store.transport().call_count(), 2);
  }

  #[tokio::test]
  async fn test_finding_flag_tracks_in_flight_find() {
    let store = ResourceStore::new(MockTransport::hanging());

    let _ = tokio::time::timeout(
      Duration::from_millis(20),
      store.find(&ItemId::Int(1), Query::new()),
    )
    .await;

    assert!(store.is_finding(CURRENT));
    assert!(!store.is_loading(CURRENT));
  }

  #[tokio::test]
  async fn test_accessors_on_empty_store() {
    let store = echo_store();

    assert!(store.items_for(None).is_empty());
    assert_eq!(store.item_for(None), None);
    assert!(store.pagination_for(None).is_empty());
    assert!(!store.is_loading(ALL));
    assert!(!store.is_finding(CURRENT));
    assert!(!store.is_submitting(ALL));
  }

  #[tokio::test]
  async fn test_subscribers_see_committed_changes() {
    let store = echo_store();
    let mut events = store.subscribe();

    store.load(ids_param("1")).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
      seen.push(event);
    }
    assert_eq!(
      seen,
      vec![
        StoreEvent::FlagChanged {
          flag: Flag::Loading,
          cache: ALL.to_string(),
          active: true,
        },
        StoreEvent::ItemsMerged {
          ids: vec![ItemId::Int(1)],
        },
        StoreEvent::SlotWritten {
          cache: ALL.to_string(),
        },
        StoreEvent::FlagChanged {
          flag: Flag::Loading,
          cache: ALL.to_string(),
          active: false,
        },
      ]
    );
  }

  #[tokio::test]
  async fn test_dropped_caller_does_not_cancel_the_fetch() {
    let store = echo_store();

    // Dispatch, then drop the only caller
    assert!(store.load(Query::new()).now_or_never().is_none());
    assert!(store.is_loading(ALL));

    for _ in 0..10 {
      tokio::task::yield_now().await;
    }

    assert_eq!(ids_of(&store.items_for(None)), vec![1, 2, 3]);
    assert!(!store.is_loading(ALL));
    assert_eq!(store.pending_fetches(), 0);
    assert_eq!(store.transport().call_count(), 1);
  }

  struct PanickingResolvers;

  impl Resolvers for PanickingResolvers {
    fn id(&self, item: &Value) -> Result<ItemId> {
      FieldResolvers::default().id(item)
    }

    fn item(&self, response: Value) -> Result<Value> {
      Ok(response)
    }

    fn items(&self, _response: Value) -> Result<Vec<Value>> {
      panic!("items resolver blew up");
    }

    fn pagination(&self, _response: &Value) -> Option<Pagination> {
      None
    }
  }

  fn panicking_store() -> ResourceStore<MockTransport, PanickingResolvers> {
    ResourceStore::with_resolvers(MockTransport::new(|_| Ok(page(&[1]))), PanickingResolvers)
  }

  #[tokio::test]
  async fn test_panicking_fetch_clears_flag_and_registry() {
    let store = panicking_store();

    let err = store.load(Query::new()).await.unwrap_err();

    assert!(err.to_string().contains("Request task failed"));
    assert!(!store.is_loading(ALL));
    assert_eq!(store.pending_fetches(), 0);
    assert!(store.snapshot().caches.is_empty());
  }

  #[tokio::test]
  async fn test_panicking_fetch_without_waiters_frees_its_key() {
    let store = panicking_store();

    assert!(store.load(Query::new()).now_or_never().is_none());
    for _ in 0..10 {
      tokio::task::yield_now().await;
    }

    assert!(!store.is_loading(ALL));
    assert_eq!(store.pending_fetches(), 0);

    // The next load dispatches again instead of joining a dead request
    assert!(store.load(Query::new()).await.is_err());
    assert_eq!(store.transport().call_count(), 2);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_commits_are_broadcast_contiguously() {
    let store = echo_store();
    let mut events = store.subscribe();

    let loads: Vec<_> = (0..8)
      .map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
          let query = ids_param(&i.to_string()).cache(format!("S{}", i));
          store.load(query).await
        })
      })
      .collect();
    for load in loads {
      load.await.unwrap().unwrap();
    }

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
      seen.push(event);
    }

    let mut commits = 0;
    for (at, event) in seen.iter().enumerate() {
      if let StoreEvent::ItemsMerged { ids } = event {
        let cache = format!("S{}", ids[0]);
        assert_eq!(seen[at + 1], StoreEvent::SlotWritten { cache: cache.clone() });
        assert_eq!(
          seen[at + 2],
          StoreEvent::FlagChanged {
            flag: Flag::Loading,
            cache,
            active: false,
          }
        );
        commits += 1;
      }
    }
    assert_eq!(commits, 8);
  }
}
