//! In-memory item map and named cache slots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::traits::{Flag, ItemId, Pagination, StoreEvent};

/// The result of the most recent successful load or find under one name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSlot {
  /// Item ids in response order
  pub ids: Vec<ItemId>,
  pub pagination: Option<Pagination>,
  /// Serialized parameters the slot was fetched with
  pub params: Option<String>,
  /// When the slot was written
  pub fetched_at: DateTime<Utc>,
}

impl CacheSlot {
  pub fn new(ids: Vec<ItemId>, pagination: Option<Pagination>, params: Option<String>) -> Self {
    Self {
      ids,
      pagination,
      params,
      fetched_at: Utc::now(),
    }
  }
}

/// Serializable copy of the whole store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
  pub items: BTreeMap<ItemId, Value>,
  pub caches: BTreeMap<String, CacheSlot>,
  pub loading: BTreeSet<String>,
  pub finding: BTreeSet<String>,
  pub submitting: BTreeSet<String>,
}

/// Items, slots and progress flags.
///
/// Every mutation queues a [`StoreEvent`]; the owner drains them with
/// [`StoreState::take_events`] once the lock is released.
#[derive(Debug, Default)]
pub struct StoreState {
  items: HashMap<ItemId, Value>,
  caches: HashMap<String, CacheSlot>,
  loading: HashSet<String>,
  finding: HashSet<String>,
  submitting: HashSet<String>,
  events: Vec<StoreEvent>,
}

impl StoreState {
  pub fn item(&self, id: &ItemId) -> Option<&Value> {
    self.items.get(id)
  }

  pub fn slot(&self, cache: &str) -> Option<&CacheSlot> {
    self.caches.get(cache)
  }

  /// A slot is only usable for a request with identical serialized params.
  pub fn valid_slot(&self, cache: &str, params: Option<&str>) -> Option<&CacheSlot> {
    self
      .caches
      .get(cache)
      .filter(|slot| slot.params.as_deref() == params)
  }

  /// Items for `ids` in order, skipping ids that are no longer stored.
  pub fn resolve(&self, ids: &[ItemId]) -> Vec<Value> {
    ids
      .iter()
      .filter_map(|id| self.items.get(id).cloned())
      .collect()
  }

  /// Upsert items, overlaying new fields onto existing records.
  pub fn merge_items(&mut self, items: impl IntoIterator<Item = (ItemId, Value)>) {
    let mut ids = Vec::new();
    for (id, item) in items {
      match self.items.get_mut(&id) {
        Some(existing) => merge_record(existing, item),
        None => {
          self.items.insert(id.clone(), item);
        }
      }
      ids.push(id);
    }
    if !ids.is_empty() {
      self.events.push(StoreEvent::ItemsMerged { ids });
    }
  }

  pub fn write_slot(&mut self, cache: &str, slot: CacheSlot) {
    self.caches.insert(cache.to_string(), slot);
    self.events.push(StoreEvent::SlotWritten {
      cache: cache.to_string(),
    });
  }

  /// Append an id to an existing slot. Returns false when there is no slot.
  pub fn append_to_slot(&mut self, cache: &str, id: ItemId) -> bool {
    let Some(slot) = self.caches.get_mut(cache) else {
      return false;
    };
    slot.ids.push(id);
    self.events.push(StoreEvent::SlotWritten {
      cache: cache.to_string(),
    });
    true
  }

  /// Drop an item from the item map and from every slot that references it.
  pub fn delete_item(&mut self, id: &ItemId) {
    self.items.remove(id);

    let mut touched: Vec<String> = Vec::new();
    for (name, slot) in self.caches.iter_mut() {
      if slot.ids.contains(id) {
        slot.ids.retain(|existing| existing != id);
        touched.push(name.clone());
      }
    }
    touched.sort();

    self.events.push(StoreEvent::ItemDeleted { id: id.clone() });
    for cache in touched {
      self.events.push(StoreEvent::SlotWritten { cache });
    }
  }

  /// Evict every item not referenced by any slot. Returns the evicted ids.
  pub fn clean_unused_items(&mut self) -> Vec<ItemId> {
    let keep: HashSet<&ItemId> = self.caches.values().flat_map(|slot| slot.ids.iter()).collect();

    let mut evicted: Vec<ItemId> = self
      .items
      .keys()
      .filter(|id| !keep.contains(id))
      .cloned()
      .collect();

    for id in &evicted {
      self.items.remove(id);
    }

    if !evicted.is_empty() {
      evicted.sort();
      self.events.push(StoreEvent::ItemsEvicted {
        ids: evicted.clone(),
      });
    }
    evicted
  }

  pub fn flag(&self, flag: Flag, cache: &str) -> bool {
    self.flags(flag).contains(cache)
  }

  pub fn set_flag(&mut self, flag: Flag, cache: &str, active: bool) {
    let set = self.flags_mut(flag);
    let changed = if active {
      set.insert(cache.to_string())
    } else {
      set.remove(cache)
    };
    if changed {
      self.events.push(StoreEvent::FlagChanged {
        flag,
        cache: cache.to_string(),
        active,
      });
    }
  }

  pub fn take_events(&mut self) -> Vec<StoreEvent> {
    std::mem::take(&mut self.events)
  }

  pub fn snapshot(&self) -> StoreSnapshot {
    StoreSnapshot {
      items: self
        .items
        .iter()
        .map(|(id, item)| (id.clone(), item.clone()))
        .collect(),
      caches: self
        .caches
        .iter()
        .map(|(name, slot)| (name.clone(), slot.clone()))
        .collect(),
      loading: self.loading.iter().cloned().collect(),
      finding: self.finding.iter().cloned().collect(),
      submitting: self.submitting.iter().cloned().collect(),
    }
  }

  fn flags(&self, flag: Flag) -> &HashSet<String> {
    match flag {
      Flag::Loading => &self.loading,
      Flag::Finding => &self.finding,
      Flag::Submitting => &self.submitting,
    }
  }

  fn flags_mut(&mut self, flag: Flag) -> &mut HashSet<String> {
    match flag {
      Flag::Loading => &mut self.loading,
      Flag::Finding => &mut self.finding,
      Flag::Submitting => &mut self.submitting,
    }
  }
}

/// Shallow overlay of `incoming` onto `existing`, key by key.
/// Anything that is not a pair of objects is replaced outright.
pub fn merge_record(existing: &mut Value, incoming: Value) {
  match (existing, incoming) {
    (Value::Object(current), Value::Object(update)) => {
      for (key, value) in update {
        current.insert(key, value);
      }
    }
    (slot, incoming) => *slot = incoming,
  }
}

/// Remove repeated ids, keeping the first occurrence.
pub fn dedup_ids(ids: impl IntoIterator<Item = ItemId>) -> Vec<ItemId> {
  let mut seen = HashSet::new();
  ids
    .into_iter()
    .filter(|id| seen.insert(id.clone()))
    .collect()
}
