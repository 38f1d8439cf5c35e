//! Routes push payloads into caches and resyncs them on every (re)connection.
//!
//! Push events are a freshness optimization, never the only source of truth:
//! whenever the channel comes up, every cache that has at least one live
//! route is force-fetched, healing whatever was missed while it was down.

use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::{ConnectionState, RealtimeTransport};
use crate::cache::payload::unwrap_envelope;
use crate::cache::{normalize, Entity, EntityCache, EventBus, Subscription};
use crate::error::SyncError;

/// Something that can be force-refreshed after a reconnect.
pub trait Resync: Send + Sync {
  /// Stable name; routes sharing a name share one resync.
  fn resync_name(&self) -> String;

  fn resync(&self) -> BoxFuture<'static, ()>;
}

impl<T: Entity> Resync for EntityCache<T> {
  fn resync_name(&self) -> String {
    self.name().to_string()
  }

  fn resync(&self) -> BoxFuture<'static, ()> {
    let cache = self.clone();
    async move {
      if let Err(e) = cache.fetch(true).await {
        warn!(cache = %cache.name(), error = %e, "resync failed");
      }
    }
    .boxed()
  }
}

/// What a routed topic does to its cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAction {
  /// Creation or update: keyed upsert.
  Upsert,
  /// Terminal transition (resolved, deleted): remove by key.
  Remove,
}

struct RouteTarget {
  target: Arc<dyn Resync>,
  routes: usize,
}

struct BridgeInner {
  transport: Arc<dyn RealtimeTransport>,
  targets: Mutex<HashMap<String, RouteTarget>>,
  state: watch::Sender<ConnectionState>,
  bus: EventBus<(), ConnectionState>,
  attached: Mutex<Option<Subscription>>,
}

/// Owns the push connection's routing table.
#[derive(Clone)]
pub struct SyncBridge {
  inner: Arc<BridgeInner>,
}

impl SyncBridge {
  pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
    let (state, _) = watch::channel(ConnectionState::Disconnected);
    Self {
      inner: Arc::new(BridgeInner {
        transport,
        targets: Mutex::new(HashMap::new()),
        state,
        bus: EventBus::new(),
        attached: Mutex::new(None),
      }),
    }
  }

  pub fn connection_state(&self) -> ConnectionState {
    *self.inner.state.borrow()
  }

  pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
    self.inner.state.subscribe()
  }

  pub fn on_connection_change<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&ConnectionState) + Send + Sync + 'static,
  {
    self.inner.bus.subscribe((), handler)
  }

  /// Listen for connection changes and open the connection.
  pub async fn start(&self) -> color_eyre::Result<()> {
    {
      let mut attached = self
        .inner
        .attached
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      if attached.is_none() {
        let weak = Arc::downgrade(&self.inner);
        // State and listeners are updated on the transport's task, in
        // arrival order; only the resync runs detached.
        *attached = Some(self.inner.transport.on_connection(Box::new(move |state| {
          let Some(inner) = weak.upgrade() else {
            return;
          };
          if inner.apply_state(*state) {
            tokio::spawn(async move {
              inner.resync_all().await;
            });
          }
        })));
      }
    }

    self.inner.transport.connect().await
  }

  /// Apply a connection state change; when the channel comes up, resync
  /// every routed cache.
  pub async fn handle_connection(&self, state: ConnectionState) {
    Arc::clone(&self.inner).handle_connection(state).await;
  }

  /// Force-fetch every target with at least one live route.
  pub async fn resync_all(&self) {
    self.inner.resync_all().await;
  }

  /// Names of the caches that will be resynced on the next connection.
  pub fn resync_targets(&self) -> Vec<String> {
    let targets = self.inner.targets();
    let mut names: Vec<String> = targets
      .iter()
      .filter(|(_, t)| t.routes > 0)
      .map(|(name, _)| name.clone())
      .collect();
    names.sort();
    names
  }

  /// Route `topic` into `cache`.
  pub fn route<T: Entity>(&self, topic: &str, cache: &EntityCache<T>, action: PushAction) -> Subscription {
    let target = cache.clone();
    let topic_name = topic.to_string();
    self.route_with(topic, Arc::new(cache.clone()), move |payload| match action {
      PushAction::Upsert => {
        let outcome = target.merge_one(payload);
        trace!(topic = %topic_name, cache = %target.name(), ?outcome, "push merged");
      }
      PushAction::Remove => match removal_key::<T>(payload) {
        Some(key) => {
          let removed = target.remove_one(&key);
          trace!(topic = %topic_name, cache = %target.name(), key = %key, removed, "push removed");
        }
        None => debug!(topic = %topic_name, "removal push without identity key"),
      },
    })
  }

  /// Route `topic` to a custom handler; `target` is resynced on reconnect
  /// while this route is alive.
  pub fn route_with<F>(&self, topic: &str, target: Arc<dyn Resync>, handler: F) -> Subscription
  where
    F: Fn(&Value) + Send + Sync + 'static,
  {
    let name = target.resync_name();
    {
      let mut targets = self.inner.targets();
      targets
        .entry(name.clone())
        .or_insert_with(|| RouteTarget { target, routes: 0 })
        .routes += 1;
    }

    let push = self.inner.transport.on(topic, Box::new(handler));
    let weak = Arc::downgrade(&self.inner);
    let release = Subscription::new(move || {
      let Some(inner) = weak.upgrade() else {
        return;
      };
      let mut targets = inner.targets();
      if let Some(entry) = targets.get_mut(&name) {
        entry.routes = entry.routes.saturating_sub(1);
        if entry.routes == 0 {
          targets.remove(&name);
        }
      }
    });

    Subscription::join([push, release])
  }

  pub fn send(&self, topic: &str, payload: Value) -> Result<(), SyncError> {
    self.inner.transport.send(topic, payload)
  }
}

impl BridgeInner {
  fn targets(&self) -> MutexGuard<'_, HashMap<String, RouteTarget>> {
    self.targets.lock().unwrap_or_else(PoisonError::into_inner)
  }

  async fn handle_connection(self: Arc<Self>, state: ConnectionState) {
    if self.apply_state(state) {
      self.resync_all().await;
    }
  }

  /// Record and broadcast a state change. Returns whether the channel is up.
  fn apply_state(&self, state: ConnectionState) -> bool {
    let previous = self.state.send_replace(state);
    if previous != state {
      info!(from = %previous, to = %state, "push connection state changed");
    }
    self.bus.emit(&(), &state);
    state.is_up()
  }

  async fn resync_all(&self) {
    let targets: Vec<Arc<dyn Resync>> = self
      .targets()
      .values()
      .filter(|t| t.routes > 0)
      .map(|t| Arc::clone(&t.target))
      .collect();

    debug!(count = targets.len(), "resyncing routed caches");
    join_all(targets.iter().map(|t| t.resync())).await;
  }
}

/// Identity key of a removal payload: a bare id, or any record shape the
/// entity normalizes.
fn removal_key<T: Entity>(payload: &Value) -> Option<String> {
  let key = match payload {
    Value::String(s) => s.clone(),
    Value::Number(n) => n.to_string(),
    other => normalize::<T>(unwrap_envelope(other)).cache_key(),
  };
  (!key.is_empty()).then_some(key)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::farm::{Alert, AlertStore};
  use crate::testing::{deps, MockRealtime, MockTransport};
  use crate::cache::CacheConfig;
  use serde_json::json;
  use std::time::Duration;

  fn setup() -> (SyncBridge, Arc<MockRealtime>, Arc<MockTransport>, AlertStore) {
    let realtime = MockRealtime::new();
    let transport = MockTransport::new();
    let alerts = AlertStore::new(deps(&transport), chrono::Duration::minutes(2));
    (SyncBridge::new(realtime.clone()), realtime, transport, alerts)
  }

  #[tokio::test]
  async fn test_duplicate_push_is_merged_once() {
    let (bridge, realtime, _transport, alerts) = setup();
    let _sub = bridge.route("alert:created", alerts.cache(), PushAction::Upsert);

    let payload = json!({"alert_id": 1, "title": "Low oxygen", "severity": "critical"});
    realtime.push("alert:created", payload.clone());
    realtime.push("alert:created", payload);

    assert_eq!(alerts.get_all().len(), 1);
  }

  #[tokio::test]
  async fn test_remove_route_accepts_bare_ids_and_records() {
    let (bridge, realtime, _transport, alerts) = setup();
    let _a = bridge.route("alert:created", alerts.cache(), PushAction::Upsert);
    let _b = bridge.route("alert:deleted", alerts.cache(), PushAction::Remove);

    realtime.push("alert:created", json!({"id": 1}));
    realtime.push("alert:created", json!({"id": 2}));
    realtime.push("alert:deleted", json!(1));
    realtime.push("alert:deleted", json!({"data": {"alertId": "2"}}));
    realtime.push("alert:deleted", json!({"alert_id": 99}));

    assert!(alerts.get_all().is_empty());
  }

  #[tokio::test]
  async fn test_reconnect_resyncs_only_routed_caches() {
    let realtime = MockRealtime::new();
    let transport = MockTransport::new();
    let routed: EntityCache<Alert> = EntityCache::new(CacheConfig::new("routed", "/routed"), deps(&transport));
    let other: EntityCache<Alert> = EntityCache::new(CacheConfig::new("other", "/other"), deps(&transport));
    let _silent: EntityCache<Alert> = EntityCache::new(CacheConfig::new("silent", "/silent"), deps(&transport));
    let bridge = SyncBridge::new(realtime.clone());

    let _r = bridge.route("a", &routed, PushAction::Upsert);
    let _o = bridge.route("b", &other, PushAction::Remove);
    let _o2 = bridge.route("c", &other, PushAction::Upsert);

    bridge.handle_connection(ConnectionState::Reconnected).await;

    assert_eq!(transport.calls_to("/routed"), 1);
    assert_eq!(transport.calls_to("/other"), 1);
    assert_eq!(transport.calls_to("/silent"), 0);
    assert_eq!(bridge.connection_state(), ConnectionState::Reconnected);
  }

  #[tokio::test]
  async fn test_disconnect_does_not_resync() {
    let (bridge, _realtime, transport, alerts) = setup();
    let _sub = bridge.route("alert:created", alerts.cache(), PushAction::Upsert);

    bridge.handle_connection(ConnectionState::Disconnected).await;
    bridge.handle_connection(ConnectionState::Connecting).await;

    assert!(transport.calls().is_empty());
  }

  #[tokio::test]
  async fn test_disposing_last_route_drops_resync_target() {
    let (bridge, realtime, transport, alerts) = setup();
    let first = bridge.route("alert:created", alerts.cache(), PushAction::Upsert);
    let second = bridge.route("alert:updated", alerts.cache(), PushAction::Upsert);
    assert_eq!(bridge.resync_targets(), vec!["alerts".to_string()]);

    first.unsubscribe();
    assert_eq!(bridge.resync_targets(), vec!["alerts".to_string()]);
    realtime.push("alert:created", json!({"id": 5}));
    realtime.push("alert:updated", json!({"id": 6}));
    assert_eq!(alerts.get_all().len(), 1);

    second.unsubscribe();
    assert!(bridge.resync_targets().is_empty());
    bridge.handle_connection(ConnectionState::Reconnected).await;
    assert_eq!(transport.calls_to("/alerts"), 0);
  }

  #[tokio::test]
  async fn test_start_connects_and_resyncs_on_connected() {
    let (bridge, realtime, transport, alerts) = setup();
    let _sub = bridge.route("alert:created", alerts.cache(), PushAction::Upsert);
    let mut rx = bridge.watch_connection();

    bridge.start().await.unwrap();
    rx.changed().await.unwrap();
    assert!(realtime.is_connected());

    for _ in 0..50 {
      if transport.calls_to("/alerts") > 0 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(transport.calls_to("/alerts"), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_transport_state_changes_apply_in_order() {
    let (bridge, realtime, _transport, _alerts) = setup();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = bridge.on_connection_change(move |state| s.lock().unwrap().push(*state));
    bridge.start().await.unwrap();

    for _ in 0..100 {
      realtime.set_connection(ConnectionState::Disconnected);
      realtime.set_connection(ConnectionState::Connecting);
      realtime.set_connection(ConnectionState::Reconnected);
      assert_eq!(bridge.connection_state(), ConnectionState::Reconnected);
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 301);
    assert_eq!(seen[0], ConnectionState::Connected);
    assert_eq!(
      seen[1..4],
      [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Reconnected
      ]
    );
    assert_eq!(seen.last(), Some(&ConnectionState::Reconnected));
  }

  #[tokio::test]
  async fn test_send_requires_a_live_connection() {
    let (bridge, realtime, _transport, _alerts) = setup();

    let offline = bridge.send("typing", json!({"conversation_id": "c1"}));
    assert!(matches!(offline, Err(SyncError::ConnectionLost(_))));

    bridge.start().await.unwrap();
    bridge.send("typing", json!({"conversation_id": "c1"})).unwrap();

    realtime.set_connection(ConnectionState::Disconnected);
    assert!(bridge.send("typing", json!({})).is_err());

    assert_eq!(realtime.sent(), vec![("typing".to_string(), json!({"conversation_id": "c1"}))]);
  }

  #[tokio::test]
  async fn test_connection_listeners_see_every_change() {
    let (bridge, _realtime, _transport, _alerts) = setup();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = bridge.on_connection_change(move |state| s.lock().unwrap().push(*state));

    bridge.handle_connection(ConnectionState::Connecting).await;
    bridge.handle_connection(ConnectionState::Connected).await;
    bridge.handle_connection(ConnectionState::Disconnected).await;

    assert_eq!(
      *seen.lock().unwrap(),
      vec![
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Disconnected
      ]
    );
  }
}
