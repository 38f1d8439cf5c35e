//! The generic entity cache: TTL fetch, keyed merge, local mutation, change events.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::bus::{EventBus, Subscription};
use super::payload::{extract_list, unwrap_envelope};
use super::storage::{decode_snapshot, encode_snapshot, snapshot_key, KeyValueStore};
use super::traits::{normalize, shallow_merge, Entity, InsertOrder, MergeOutcome};
use crate::clock::Clock;
use crate::error::SyncError;
use crate::transport::{FetchOptions, Transport};

pub type SortFn<T> = fn(&T, &T) -> Ordering;

type InFlight<T> = Shared<BoxFuture<'static, Result<Vec<T>, SyncError>>>;

/// Collaborators shared by every cache of one session.
#[derive(Clone)]
pub struct CacheDeps {
  pub transport: Arc<dyn Transport>,
  pub storage: Arc<dyn KeyValueStore>,
  pub clock: Arc<dyn Clock>,
  /// Storage key prefix (see [`storage_namespace`](super::storage::storage_namespace)).
  pub namespace: String,
}

/// Per-cache configuration.
#[derive(Clone)]
pub struct CacheConfig<T> {
  /// Name used in logs and as the snapshot key (e.g. "alerts", "messages:12").
  pub name: String,
  /// List endpoint fetched by [`EntityCache::fetch`].
  pub endpoint: String,
  /// Extra query parameters for the list endpoint.
  pub query: Vec<(String, String)>,
  /// Object keys a list response may wrap its records in.
  pub list_keys: &'static [&'static str],
  /// How long before cached data is considered stale.
  pub stale_after: Duration,
  pub insert_order: InsertOrder,
  pub sort_by: Option<SortFn<T>>,
}

impl<T> CacheConfig<T> {
  pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      endpoint: endpoint.into(),
      query: Vec::new(),
      list_keys: &[],
      stale_after: Duration::minutes(5),
      insert_order: InsertOrder::Append,
      sort_by: None,
    }
  }

  pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
    self.stale_after = stale_after;
    self
  }

  pub fn with_list_keys(mut self, keys: &'static [&'static str]) -> Self {
    self.list_keys = keys;
    self
  }

  pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.query.push((key.into(), value.into()));
    self
  }

  pub fn prepend(mut self) -> Self {
    self.insert_order = InsertOrder::Prepend;
    self
  }

  /// Keep items ordered by `sort_by`; fetched lists are sorted and new items
  /// are inserted at their ordered position.
  pub fn sorted_by(mut self, sort_by: SortFn<T>) -> Self {
    self.insert_order = InsertOrder::Sorted;
    self.sort_by = Some(sort_by);
    self
  }
}

/// Topics a cache emits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTopic {
  /// The item list changed in any way.
  Changed,
  /// The loading flag flipped.
  Loading,
  /// A fetch failed.
  Error,
  /// A key not seen before arrived through `merge_one`. Never raised by a
  /// fetch, so side effects fire only for genuine arrivals.
  NewItem,
  /// An item was removed.
  Removed,
}

#[derive(Debug, Clone)]
pub enum CacheEvent<T> {
  Changed { len: usize },
  Loading(bool),
  Error(SyncError),
  NewItem(T),
  Removed(String),
}

impl<T> CacheEvent<T> {
  pub fn topic(&self) -> CacheTopic {
    match self {
      CacheEvent::Changed { .. } => CacheTopic::Changed,
      CacheEvent::Loading(_) => CacheTopic::Loading,
      CacheEvent::Error(_) => CacheTopic::Error,
      CacheEvent::NewItem(_) => CacheTopic::NewItem,
      CacheEvent::Removed(_) => CacheTopic::Removed,
    }
  }
}

struct CacheState<T> {
  items: Vec<T>,
  loading: bool,
  error: Option<SyncError>,
  last_fetched_at: Option<DateTime<Utc>>,
  in_flight: Option<InFlight<T>>,
  /// Bumped by `clear`; a fetch started under an older generation is discarded.
  generation: u64,
}

struct Inner<T: Entity> {
  config: CacheConfig<T>,
  deps: CacheDeps,
  storage_key: String,
  state: Mutex<CacheState<T>>,
  bus: EventBus<CacheTopic, CacheEvent<T>>,
}

/// One shared, ordered, keyed store of `T`.
///
/// Cloning is cheap and yields a handle to the same cache.
pub struct EntityCache<T: Entity> {
  inner: Arc<Inner<T>>,
}

impl<T: Entity> Clone for EntityCache<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Entity> EntityCache<T> {
  /// Create a cache, hydrating it from the persisted snapshot if one exists.
  pub fn new(config: CacheConfig<T>, deps: CacheDeps) -> Self {
    let storage_key = snapshot_key(&deps.namespace, &config.name);
    let items = load_snapshot::<T>(deps.storage.as_ref(), &storage_key);
    if !items.is_empty() {
      debug!(cache = %config.name, count = items.len(), "hydrated from snapshot");
    }

    Self {
      inner: Arc::new(Inner {
        config,
        deps,
        storage_key,
        state: Mutex::new(CacheState {
          items,
          loading: false,
          error: None,
          last_fetched_at: None,
          in_flight: None,
          generation: 0,
        }),
        bus: EventBus::new(),
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.inner.config.name
  }

  pub fn stale_after(&self) -> Duration {
    self.inner.config.stale_after
  }

  /// Current snapshot. Never performs I/O.
  pub fn get_sync(&self) -> Vec<T> {
    self.inner.lock().items.clone()
  }

  /// Read the items in place without cloning the whole list.
  pub fn with_items<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
    f(&self.inner.lock().items)
  }

  pub fn get(&self, id: &str) -> Option<T> {
    self.with_items(|items| items.iter().find(|i| i.cache_key() == id).cloned())
  }

  pub fn filtered(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
    self.with_items(|items| items.iter().filter(|i| predicate(i)).cloned().collect())
  }

  pub fn len(&self) -> usize {
    self.inner.lock().items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_loading(&self) -> bool {
    self.inner.lock().loading
  }

  pub fn error(&self) -> Option<SyncError> {
    self.inner.lock().error.clone()
  }

  pub fn last_fetched_at(&self) -> Option<DateTime<Utc>> {
    self.inner.lock().last_fetched_at
  }

  /// Whether a fetch now would be served from memory.
  pub fn is_fresh(&self) -> bool {
    let state = self.inner.lock();
    !state.items.is_empty() && self.inner.is_fresh(&state)
  }

  /// Fetch with a cache-first strategy.
  ///
  /// 1. Unless `force`, fresh non-empty data is returned immediately
  /// 2. A fetch already in flight is joined rather than duplicated
  /// 3. Otherwise the list endpoint is called once and replaces the items
  /// 4. On failure the cached items are kept and the error is recorded
  pub async fn fetch(&self, force: bool) -> Result<Vec<T>, SyncError> {
    let (in_flight, started) = {
      let mut state = self.inner.lock();

      if !force && !state.items.is_empty() && self.inner.is_fresh(&state) {
        debug!(cache = %self.inner.config.name, "cache fresh, skipping fetch");
        return Ok(state.items.clone());
      }

      match &state.in_flight {
        Some(existing) => (existing.clone(), false),
        None => {
          let fut = Arc::clone(&self.inner)
            .run_fetch(state.generation)
            .boxed()
            .shared();
          state.in_flight = Some(fut.clone());
          state.loading = true;
          (fut, true)
        }
      }
    };

    if started {
      self.inner.publish(vec![CacheEvent::Loading(true)]);
    } else {
      debug!(cache = %self.inner.config.name, "joining in-flight fetch");
    }

    in_flight.await
  }

  /// Keyed upsert of a raw payload (push event or single-record response).
  ///
  /// An existing entry is replaced in place with the shallow merge of old and
  /// new fields; an unknown key is inserted and announced on
  /// [`CacheTopic::NewItem`].
  pub fn merge_one(&self, payload: &Value) -> MergeOutcome {
    let payload = unwrap_envelope(payload);
    let incoming: T = normalize(payload);
    let key = incoming.cache_key();

    self.inner.upsert_with(key, true, move |previous| match previous {
      Some(previous) => shallow_merge(previous, payload),
      None => incoming,
    })
  }

  /// Bulk upsert, e.g. an older page of messages. `announce` controls whether
  /// new keys raise [`CacheTopic::NewItem`].
  pub fn merge_many<'a>(&self, payloads: impl IntoIterator<Item = &'a Value>, announce: bool) -> usize {
    let mut inserted = 0;
    for payload in payloads {
      let incoming: T = normalize(payload);
      let key = incoming.cache_key();
      let outcome = self.inner.upsert_with(key, announce, move |previous| match previous {
        Some(previous) => shallow_merge(previous, payload),
        None => incoming,
      });
      if outcome.is_new() {
        inserted += 1;
      }
    }
    inserted
  }

  /// Typed upsert for local (optimistic) records. Never announces.
  pub fn upsert(&self, item: T) -> MergeOutcome {
    let key = item.cache_key();
    self.inner.upsert_with(key, false, move |previous| match previous {
      Some(previous) => T::reconcile(previous, item),
      None => item,
    })
  }

  /// Mutate one item in place. Returns false when the key is unknown.
  pub fn update_one(&self, id: &str, f: impl FnOnce(&mut T)) -> bool {
    let snapshot = {
      let mut state = self.inner.lock();
      let Some(item) = state.items.iter_mut().find(|i| i.cache_key() == id) else {
        return false;
      };
      f(item);
      self.inner.encode(&state.items)
    };

    self.inner.write_snapshot(snapshot);
    self.inner.publish(vec![CacheEvent::Changed { len: self.len() }]);
    true
  }

  /// Mutate every item; `f` reports whether it changed anything. Returns the
  /// number of changed items.
  pub fn update_all(&self, mut f: impl FnMut(&mut T) -> bool) -> usize {
    let (changed, len, snapshot) = {
      let mut state = self.inner.lock();
      let changed = state.items.iter_mut().map(&mut f).filter(|c| *c).count();
      if changed == 0 {
        return 0;
      }
      (changed, state.items.len(), self.inner.encode(&state.items))
    };

    self.inner.write_snapshot(snapshot);
    self.inner.publish(vec![CacheEvent::Changed { len }]);
    changed
  }

  /// Replace a provisional entry (keyed `old_id`) with its server record,
  /// keeping the provisional entry's position. If the server record already
  /// arrived under its own key, the two collapse into one.
  pub fn rekey(&self, old_id: &str, item: T) -> MergeOutcome {
    let new_id = item.cache_key();
    if new_id.is_empty() {
      return MergeOutcome::Skipped;
    }

    let (outcome, len, snapshot) = {
      let mut state = self.inner.lock();
      let items = &mut state.items;
      let old_idx = items.iter().position(|i| i.cache_key() == old_id);
      let new_idx = if new_id == old_id {
        old_idx
      } else {
        items.iter().position(|i| i.cache_key() == new_id)
      };

      let outcome = match (old_idx, new_idx) {
        (Some(o), Some(n)) if o == n => {
          items[o] = T::reconcile(&items[o], item);
          MergeOutcome::Updated
        }
        (Some(mut o), Some(n)) => {
          let existing = items.remove(n);
          if n < o {
            o -= 1;
          }
          items[o] = T::reconcile(&existing, item);
          MergeOutcome::Updated
        }
        (Some(o), None) => {
          items[o] = item;
          MergeOutcome::Updated
        }
        (None, Some(n)) => {
          items[n] = T::reconcile(&items[n], item);
          MergeOutcome::Updated
        }
        (None, None) => {
          let pos = self.inner.insert_position(&items[..], &item);
          items.insert(pos, item);
          MergeOutcome::Inserted
        }
      };

      (outcome, items.len(), self.inner.encode(&state.items))
    };

    self.inner.write_snapshot(snapshot);
    self.inner.publish(vec![CacheEvent::Changed { len }]);
    outcome
  }

  /// Move an item to the front (most recent activity first).
  pub fn promote(&self, id: &str) -> bool {
    let snapshot = {
      let mut state = self.inner.lock();
      match state.items.iter().position(|i| i.cache_key() == id) {
        Some(0) => return true,
        Some(idx) => {
          let item = state.items.remove(idx);
          state.items.insert(0, item);
          self.inner.encode(&state.items)
        }
        None => return false,
      }
    };

    self.inner.write_snapshot(snapshot);
    self.inner.publish(vec![CacheEvent::Changed { len: self.len() }]);
    true
  }

  /// Remove by key. Absent keys are a no-op.
  pub fn remove_one(&self, id: &str) -> bool {
    let (len, snapshot) = {
      let mut state = self.inner.lock();
      let Some(idx) = state.items.iter().position(|i| i.cache_key() == id) else {
        return false;
      };
      state.items.remove(idx);
      (state.items.len(), self.inner.encode(&state.items))
    };

    self.inner.write_snapshot(snapshot);
    self.inner.publish(vec![
      CacheEvent::Changed { len },
      CacheEvent::Removed(id.to_string()),
    ]);
    true
  }

  /// Empty the cache (logout). Also forgets freshness, so the next fetch hits
  /// the network. A fetch still in flight is orphaned: its result reaches its
  /// own waiters but is never applied.
  pub fn clear(&self) {
    let snapshot = {
      let mut state = self.inner.lock();
      state.generation = state.generation.wrapping_add(1);
      state.items.clear();
      state.error = None;
      state.loading = false;
      state.last_fetched_at = None;
      state.in_flight = None;
      self.inner.encode(&state.items)
    };

    self.inner.write_snapshot(snapshot);
    self.inner.publish(vec![
      CacheEvent::Loading(false),
      CacheEvent::Changed { len: 0 },
    ]);
  }

  pub fn on_change<F>(&self, topic: CacheTopic, handler: F) -> Subscription
  where
    F: Fn(&CacheEvent<T>) + Send + Sync + 'static,
  {
    self.inner.bus.subscribe(topic, handler)
  }
}

impl<T: Entity> Inner<T> {
  fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn is_fresh(&self, state: &CacheState<T>) -> bool {
    match state.last_fetched_at {
      Some(fetched_at) => self.deps.clock.now() - fetched_at < self.config.stale_after,
      None => false,
    }
  }

  async fn run_fetch(self: Arc<Self>, generation: u64) -> Result<Vec<T>, SyncError> {
    let options = FetchOptions {
      query: self.config.query.clone(),
      ..FetchOptions::get()
    };
    let response = self
      .deps
      .transport
      .fetch_json(&self.config.endpoint, options)
      .await;
    let now = self.deps.clock.now();

    let mut events = Vec::new();
    let (result, snapshot) = {
      let mut state = self.lock();
      if state.generation != generation {
        debug!(cache = %self.config.name, "cache cleared during fetch, discarding result");
        return match response {
          Ok(payload) => Ok(self.normalize_list(&payload)),
          Err(e) => Err(SyncError::fetch(T::entity_type(), &e)),
        };
      }
      state.in_flight = None;
      state.loading = false;

      match response {
        Ok(payload) => {
          let items = self.normalize_list(&payload);
          debug!(cache = %self.config.name, count = items.len(), "fetched");
          state.items = items.clone();
          state.last_fetched_at = Some(now);
          state.error = None;
          events.push(CacheEvent::Changed { len: items.len() });
          events.push(CacheEvent::Loading(false));
          let snapshot = self.encode(&state.items);
          (Ok(items), snapshot)
        }
        Err(e) => {
          let err = SyncError::fetch(T::entity_type(), &e);
          warn!(cache = %self.config.name, error = %err, "fetch failed, serving cached items");
          state.error = Some(err.clone());
          events.push(CacheEvent::Loading(false));
          events.push(CacheEvent::Error(err.clone()));
          (Err(err), None)
        }
      }
    };

    self.write_snapshot(snapshot);
    self.publish(events);
    result
  }

  /// Normalize a list response: skip keyless records, collapse duplicate
  /// keys (later wins, first position kept), then sort if configured.
  fn normalize_list(&self, payload: &Value) -> Vec<T> {
    let mut items: Vec<T> = Vec::new();
    let mut positions: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for raw in extract_list(payload, self.config.list_keys) {
      let item: T = normalize(raw);
      let key = item.cache_key();
      if key.is_empty() {
        debug!(cache = %self.config.name, "skipping record without identity key");
        continue;
      }
      match positions.get(&key) {
        Some(&idx) => items[idx] = shallow_merge(&items[idx], raw),
        None => {
          positions.insert(key, items.len());
          items.push(item);
        }
      }
    }

    if let Some(sort_by) = self.config.sort_by {
      items.sort_by(sort_by);
    }
    items
  }

  fn insert_position(&self, items: &[T], item: &T) -> usize {
    match (self.config.insert_order, self.config.sort_by) {
      (InsertOrder::Prepend, _) => 0,
      (InsertOrder::Sorted, Some(sort_by)) => {
        items.partition_point(|existing| sort_by(existing, item) != Ordering::Greater)
      }
      _ => items.len(),
    }
  }

  fn upsert_with(
    &self,
    key: String,
    announce: bool,
    build: impl FnOnce(Option<&T>) -> T,
  ) -> MergeOutcome {
    if key.is_empty() {
      debug!(cache = %self.config.name, "ignoring payload without identity key");
      return MergeOutcome::Skipped;
    }

    let mut events = Vec::new();
    let (outcome, snapshot) = {
      let mut state = self.lock();
      let outcome = match state.items.iter().position(|i| i.cache_key() == key) {
        Some(idx) => {
          let merged = build(Some(&state.items[idx]));
          state.items[idx] = merged;
          MergeOutcome::Updated
        }
        None => {
          let item = build(None);
          let pos = self.insert_position(&state.items, &item);
          if announce {
            events.push(CacheEvent::NewItem(item.clone()));
          }
          state.items.insert(pos, item);
          MergeOutcome::Inserted
        }
      };
      let len = state.items.len();
      events.insert(0, CacheEvent::Changed { len });
      (outcome, self.encode(&state.items))
    };

    self.write_snapshot(snapshot);
    self.publish(events);
    outcome
  }

  fn encode(&self, items: &[T]) -> Option<String> {
    match encode_snapshot(items, self.deps.clock.now()) {
      Ok(snapshot) => Some(snapshot),
      Err(e) => {
        warn!(cache = %self.config.name, error = %e, "failed to encode snapshot");
        None
      }
    }
  }

  fn write_snapshot(&self, snapshot: Option<String>) {
    let Some(snapshot) = snapshot else {
      return;
    };
    if let Err(e) = self.deps.storage.set(&self.storage_key, &snapshot) {
      warn!(cache = %self.config.name, error = %e, "failed to persist snapshot");
    }
  }

  fn publish(&self, events: Vec<CacheEvent<T>>) {
    for event in events {
      self.bus.emit(&event.topic(), &event);
    }
  }
}

fn load_snapshot<T: Entity>(storage: &dyn KeyValueStore, key: &str) -> Vec<T> {
  let raw = match storage.get(key) {
    Ok(Some(raw)) => raw,
    Ok(None) => return Vec::new(),
    Err(e) => {
      warn!(key, error = %e, "failed to read snapshot");
      return Vec::new();
    }
  };

  let Some(items) = decode_snapshot::<T>(&raw) else {
    debug!(key, "discarding unreadable snapshot");
    return Vec::new();
  };

  let mut seen = std::collections::HashSet::new();
  items
    .into_iter()
    .filter(|item| {
      let key = item.cache_key();
      !key.is_empty() && seen.insert(key)
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStorage;
  use crate::cache::traits::RawRecord;
  use crate::cache::payload::Fields;
  use crate::testing::{ManualClock, MockTransport};
  use serde::{Deserialize, Serialize};
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Widget {
    id: String,
    name: String,
    size: i64,
  }

  #[derive(Debug, Default, Serialize)]
  struct RawWidget {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<i64>,
  }

  impl RawRecord<Widget> for RawWidget {
    fn from_payload(payload: &Value) -> Self {
      let f = Fields::new(payload);
      Self {
        id: f.string(&["id", "widget_id"]),
        name: f.string(&["name", "label"]),
        size: f.i64(&["size"]),
      }
    }

    fn into_entity(self) -> Widget {
      Widget {
        id: self.id.unwrap_or_default(),
        name: self.name.unwrap_or_default(),
        size: self.size.unwrap_or_default(),
      }
    }
  }

  impl Entity for Widget {
    type Raw = RawWidget;

    fn cache_key(&self) -> String {
      self.id.clone()
    }

    fn entity_type() -> &'static str {
      "widget"
    }
  }

  fn by_size(a: &Widget, b: &Widget) -> Ordering {
    a.size.cmp(&b.size)
  }

  struct Fixture {
    cache: EntityCache<Widget>,
    transport: Arc<MockTransport>,
    clock: Arc<ManualClock>,
    storage: Arc<MemoryStorage>,
  }

  fn fixture_with(config: CacheConfig<Widget>) -> Fixture {
    let transport = MockTransport::new();
    let clock = ManualClock::new();
    let storage = Arc::new(MemoryStorage::new());
    let deps = CacheDeps {
      transport: transport.clone(),
      storage: storage.clone(),
      clock: clock.clone(),
      namespace: "test".into(),
    };
    Fixture {
      cache: EntityCache::new(config, deps),
      transport,
      clock,
      storage,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(CacheConfig::new("widgets", "/widgets").with_stale_after(Duration::minutes(2)))
  }

  #[test]
  fn test_merge_one_is_idempotent() {
    let f = fixture();
    let x = json!({"id": "w1", "name": "pump"});

    assert_eq!(f.cache.merge_one(&x), MergeOutcome::Inserted);
    let len = f.cache.len();
    assert_eq!(f.cache.merge_one(&x), MergeOutcome::Updated);

    assert_eq!(f.cache.len(), len);
    assert_eq!(
      f.cache.get_sync().iter().filter(|w| w.id == "w1").count(),
      1
    );
  }

  #[test]
  fn test_merge_replaces_in_place_keeping_absent_fields() {
    let f = fixture();
    f.cache.merge_one(&json!({"id": "a", "name": "aerator", "size": 3}));
    f.cache.merge_one(&json!({"id": "b", "name": "feeder", "size": 1}));

    f.cache.merge_one(&json!({"widget_id": "a", "size": 9}));

    let items = f.cache.get_sync();
    assert_eq!(items[0], Widget { id: "a".into(), name: "aerator".into(), size: 9 });
    assert_eq!(items[1].id, "b");
  }

  #[test]
  fn test_new_item_event_only_for_unknown_keys() {
    let f = fixture();
    let new_items = Arc::new(AtomicUsize::new(0));
    let changes = Arc::new(AtomicUsize::new(0));

    let n = Arc::clone(&new_items);
    let _s1 = f.cache.on_change(CacheTopic::NewItem, move |_| {
      n.fetch_add(1, AtomicOrdering::SeqCst);
    });
    let c = Arc::clone(&changes);
    let _s2 = f.cache.on_change(CacheTopic::Changed, move |_| {
      c.fetch_add(1, AtomicOrdering::SeqCst);
    });

    f.cache.merge_one(&json!({"id": "a"}));
    f.cache.merge_one(&json!({"id": "a", "name": "renamed"}));

    assert_eq!(new_items.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(changes.load(AtomicOrdering::SeqCst), 2);
  }

  #[test]
  fn test_keyless_payload_is_skipped() {
    let f = fixture();
    assert_eq!(f.cache.merge_one(&json!({"name": "orphan"})), MergeOutcome::Skipped);
    assert_eq!(f.cache.merge_one(&json!("not an object")), MergeOutcome::Skipped);
    assert!(f.cache.is_empty());
  }

  #[test]
  fn test_merge_one_unwraps_envelopes_but_not_data_fields() {
    let f = fixture();
    assert_eq!(
      f.cache.merge_one(&json!({"id": "a", "name": "feeder", "data": {"pond_id": 3}})),
      MergeOutcome::Inserted
    );
    assert_eq!(
      f.cache.merge_one(&json!({"event": "widget:new", "data": {"id": "b"}})),
      MergeOutcome::Inserted
    );

    let ids: Vec<String> = f.cache.get_sync().into_iter().map(|w| w.id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(f.cache.get("a").unwrap().name, "feeder");
  }

  #[tokio::test]
  async fn test_fresh_cache_skips_transport_until_stale() {
    let f = fixture();
    f.transport.respond("/widgets", json!([{"id": "a"}]));

    f.cache.fetch(false).await.unwrap();
    assert_eq!(f.transport.calls_to("/widgets"), 1);

    f.clock.advance(Duration::minutes(2) - Duration::milliseconds(1));
    f.cache.fetch(false).await.unwrap();
    assert_eq!(f.transport.calls_to("/widgets"), 1);

    f.clock.advance(Duration::milliseconds(2));
    f.cache.fetch(false).await.unwrap();
    assert_eq!(f.transport.calls_to("/widgets"), 2);
  }

  #[tokio::test]
  async fn test_fresh_but_empty_cache_still_fetches() {
    let f = fixture();
    f.transport.respond("/widgets", json!([]));

    f.cache.fetch(false).await.unwrap();
    f.cache.fetch(false).await.unwrap();
    assert_eq!(f.transport.calls_to("/widgets"), 2);
  }

  #[tokio::test]
  async fn test_force_bypasses_freshness() {
    let f = fixture();
    f.transport.respond("/widgets", json!([{"id": "a"}]));

    f.cache.fetch(false).await.unwrap();
    f.cache.fetch(true).await.unwrap();
    assert_eq!(f.transport.calls_to("/widgets"), 2);
  }

  #[tokio::test]
  async fn test_concurrent_fetches_share_one_request() {
    let f = fixture();
    f.transport.set_delay(std::time::Duration::from_millis(20));
    f.transport.respond("/widgets", json!([{"id": "a"}, {"id": "b"}]));

    let (first, second) = tokio::join!(f.cache.fetch(true), f.cache.fetch(true));

    assert_eq!(f.transport.calls_to("/widgets"), 1);
    assert_eq!(first.unwrap().len(), 2);
    assert_eq!(second.unwrap().len(), 2);
    assert!(!f.cache.is_loading());
  }

  #[tokio::test]
  async fn test_failed_fetch_preserves_items() {
    let f = fixture();
    f.cache.merge_one(&json!({"id": "a"}));
    f.cache.merge_one(&json!({"id": "b"}));
    f.transport.fail("/widgets", "503 Service Unavailable");

    let loading = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&loading);
    let _sub = f.cache.on_change(CacheTopic::Loading, move |e| {
      if let CacheEvent::Loading(v) = e {
        l.lock().unwrap().push(*v);
      }
    });

    let result = f.cache.fetch(true).await;

    assert!(matches!(result, Err(SyncError::TransientFetch { .. })));
    assert_eq!(f.cache.len(), 2);
    assert!(f.cache.error().is_some());
    assert!(!f.cache.is_loading());
    assert_eq!(*loading.lock().unwrap(), vec![true, false]);
  }

  #[tokio::test]
  async fn test_successful_fetch_clears_error_and_replaces_items() {
    let f = fixture();
    f.cache.merge_one(&json!({"id": "stale"}));
    f.transport.fail("/widgets", "boom");
    let _ = f.cache.fetch(true).await;
    assert!(f.cache.error().is_some());

    f.transport.respond("/widgets", json!({"data": [{"id": "fresh"}]}));
    let items = f.cache.fetch(true).await.unwrap();

    assert_eq!(items.len(), 1);
    assert_eq!(f.cache.get_sync()[0].id, "fresh");
    assert!(f.cache.error().is_none());
    assert_eq!(f.cache.last_fetched_at(), Some(f.clock.now()));
  }

  #[tokio::test]
  async fn test_fetch_collapses_duplicate_keys() {
    let f = fixture();
    f.transport.respond(
      "/widgets",
      json!([
        {"id": "a", "name": "first", "size": 1},
        {"id": "b"},
        {"id": "a", "size": 5},
        {"name": "no key"}
      ]),
    );

    let items = f.cache.fetch(true).await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0], Widget { id: "a".into(), name: "first".into(), size: 5 });
  }

  #[tokio::test]
  async fn test_fetch_does_not_announce_new_items() {
    let f = fixture();
    f.transport.respond("/widgets", json!([{"id": "a"}]));
    let announced = Arc::new(AtomicUsize::new(0));
    let a = Arc::clone(&announced);
    let _sub = f.cache.on_change(CacheTopic::NewItem, move |_| {
      a.fetch_add(1, AtomicOrdering::SeqCst);
    });

    f.cache.fetch(true).await.unwrap();
    assert_eq!(announced.load(AtomicOrdering::SeqCst), 0);
  }

  #[test]
  fn test_remove_one_is_idempotent() {
    let f = fixture();
    f.cache.merge_one(&json!({"id": "a"}));

    assert!(f.cache.remove_one("a"));
    assert!(!f.cache.remove_one("a"));
    assert!(!f.cache.remove_one("never"));
    assert!(f.cache.is_empty());
  }

  #[tokio::test]
  async fn test_clear_forgets_items_and_freshness() {
    let f = fixture();
    f.transport.respond("/widgets", json!([{"id": "a"}]));
    f.cache.fetch(false).await.unwrap();

    f.cache.clear();
    assert!(f.cache.is_empty());
    assert!(f.cache.last_fetched_at().is_none());

    f.cache.fetch(false).await.unwrap();
    assert_eq!(f.transport.calls_to("/widgets"), 2);
  }

  #[tokio::test]
  async fn test_clear_during_fetch_discards_the_orphaned_result() {
    let f = fixture();
    f.transport.set_delay(std::time::Duration::from_millis(100));
    f.transport.respond("/widgets", json!([{"id": "previous-session"}]));

    let cache = f.cache.clone();
    let orphaned = tokio::spawn(async move { cache.fetch(true).await });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(f.cache.is_loading());

    f.cache.clear();
    tokio::time::sleep(std::time::Duration::from_millis(40)).await;
    let cache = f.cache.clone();
    let current = tokio::spawn(async move { cache.fetch(true).await });
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    // The orphaned fetch finishes first and must not touch the cleared cache.
    assert_eq!(orphaned.await.unwrap().unwrap().len(), 1);
    assert!(f.cache.is_empty());
    assert!(f.cache.last_fetched_at().is_none());
    assert!(f.cache.is_loading());

    // A third caller joins the fetch started after the clear.
    let joined = f.cache.fetch(true).await.unwrap();
    assert_eq!(f.transport.calls_to("/widgets"), 2);
    assert_eq!(joined.len(), 1);
    assert_eq!(current.await.unwrap().unwrap().len(), 1);
    assert_eq!(f.cache.len(), 1);
    assert!(!f.cache.is_loading());
  }

  #[test]
  fn test_snapshot_hydrates_new_cache() {
    let f = fixture();
    f.cache.merge_one(&json!({"id": "a", "name": "kept"}));

    let deps = CacheDeps {
      transport: f.transport.clone(),
      storage: f.storage.clone(),
      clock: f.clock.clone(),
      namespace: "test".into(),
    };
    let reopened: EntityCache<Widget> = EntityCache::new(CacheConfig::new("widgets", "/widgets"), deps);

    assert_eq!(reopened.get("a").map(|w| w.name), Some("kept".to_string()));
    assert!(reopened.last_fetched_at().is_none());
  }

  #[test]
  fn test_sorted_cache_inserts_in_order() {
    let f = fixture_with(CacheConfig::new("widgets", "/widgets").sorted_by(by_size));
    for (id, size) in [("c", 3), ("a", 1), ("b", 2), ("d", 2)] {
      f.cache.merge_one(&json!({"id": id, "size": size}));
    }

    let ids: Vec<String> = f.cache.get_sync().into_iter().map(|w| w.id).collect();
    assert_eq!(ids, vec!["a", "b", "d", "c"]);
  }

  #[test]
  fn test_prepend_cache_puts_new_items_first() {
    let f = fixture_with(CacheConfig::new("widgets", "/widgets").prepend());
    f.cache.merge_one(&json!({"id": "old"}));
    f.cache.merge_one(&json!({"id": "new"}));

    assert_eq!(f.cache.get_sync()[0].id, "new");
    assert!(f.cache.promote("old"));
    assert_eq!(f.cache.get_sync()[0].id, "old");
  }

  #[test]
  fn test_rekey_collapses_provisional_and_server_entries() {
    let f = fixture();
    f.cache.merge_one(&json!({"id": "local-1", "name": "draft"}));
    f.cache.merge_one(&json!({"id": "other"}));
    f.cache.merge_one(&json!({"id": "srv-9", "name": "echo"}));

    let server = Widget { id: "srv-9".into(), name: "final".into(), size: 0 };
    assert_eq!(f.cache.rekey("local-1", server), MergeOutcome::Updated);

    let ids: Vec<String> = f.cache.get_sync().into_iter().map(|w| w.id).collect();
    assert_eq!(ids, vec!["srv-9", "other"]);
    assert_eq!(f.cache.get("srv-9").unwrap().name, "final");
  }

  #[test]
  fn test_update_all_counts_changes() {
    let f = fixture();
    f.cache.merge_one(&json!({"id": "a", "size": 1}));
    f.cache.merge_one(&json!({"id": "b", "size": 5}));

    let changed = f.cache.update_all(|w| {
      if w.size < 3 {
        w.size = 3;
        true
      } else {
        false
      }
    });
    assert_eq!(changed, 1);
    assert!(f.cache.update_one("b", |w| w.size = 0));
    assert!(!f.cache.update_one("zzz", |w| w.size = 0));
    assert_eq!(f.cache.get("b").unwrap().size, 0);
  }
}
