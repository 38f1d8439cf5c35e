//! The per-session cache manager: one store per entity type, constructed
//! from injected collaborators.

use chrono::Duration;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use super::alerts::AlertStore;
use super::chat::{ChatStore, Receipt};
use super::notifications::NotificationStore;
use super::types::{Fish, Pond, Sampling, Task, User};
use crate::cache::payload::{unwrap_envelope, Fields};
use crate::cache::{CacheConfig, CacheDeps, EntityCache, Subscription};
use crate::clock::Clock;
use crate::config::CacheSettings;
use crate::error::SyncError;
use crate::realtime::{PushAction, SyncBridge};

#[derive(Clone)]
pub struct FarmCache {
  pub users: EntityCache<User>,
  pub ponds: EntityCache<Pond>,
  pub fish: EntityCache<Fish>,
  pub samplings: EntityCache<Sampling>,
  pub tasks: EntityCache<Task>,
  pub alerts: AlertStore,
  pub notifications: NotificationStore,
  pub chat: ChatStore,
  clock: Arc<dyn Clock>,
}

impl FarmCache {
  pub fn new(deps: CacheDeps, settings: &CacheSettings, user_id: Option<String>) -> Self {
    let stale = |name: &str, minutes: i64| settings.stale_after(name, Duration::minutes(minutes));

    Self {
      users: EntityCache::new(
        CacheConfig::new("users", "/users")
          .with_list_keys(&["users"])
          .with_stale_after(stale("users", 5)),
        deps.clone(),
      ),
      ponds: EntityCache::new(
        CacheConfig::new("ponds", "/ponds")
          .with_list_keys(&["ponds"])
          .with_stale_after(stale("ponds", 5)),
        deps.clone(),
      ),
      fish: EntityCache::new(
        CacheConfig::new("fish", "/fish")
          .with_list_keys(&["fish", "stocks"])
          .with_stale_after(stale("fish", 5)),
        deps.clone(),
      ),
      samplings: EntityCache::new(
        CacheConfig::new("samplings", "/samplings")
          .with_list_keys(&["samplings"])
          .with_stale_after(stale("samplings", 5)),
        deps.clone(),
      ),
      tasks: EntityCache::new(
        CacheConfig::new("tasks", "/tasks")
          .with_list_keys(&["tasks"])
          .with_stale_after(stale("tasks", 3)),
        deps.clone(),
      ),
      alerts: AlertStore::new(deps.clone(), stale("alerts", 2)),
      notifications: NotificationStore::new(deps.clone(), stale("notifications", 2)),
      chat: ChatStore::new(
        deps.clone(),
        user_id,
        stale("conversations", 2),
        stale("messages", 5),
      ),
      clock: deps.clock,
    }
  }

  /// Fetch every list (cache-first unless `force`). Failures are collected;
  /// the failed caches keep serving what they had.
  pub async fn fetch_all(&self, force: bool) -> Vec<SyncError> {
    let (users, ponds, fish, samplings, tasks, alerts, notifications, conversations) = tokio::join!(
      self.users.fetch(force),
      self.ponds.fetch(force),
      self.fish.fetch(force),
      self.samplings.fetch(force),
      self.tasks.fetch(force),
      self.alerts.fetch(force),
      self.notifications.fetch(force),
      self.chat.fetch_conversations(force),
    );

    let errors: Vec<SyncError> = [
      users.err(),
      ponds.err(),
      fish.err(),
      samplings.err(),
      tasks.err(),
      alerts.err(),
      notifications.err(),
      conversations.err(),
    ]
    .into_iter()
    .flatten()
    .collect();

    if errors.is_empty() {
      info!("all caches loaded");
    } else {
      warn!(failed = errors.len(), "some caches failed to load");
    }
    errors
  }

  /// Register every push route on `bridge`. Poll-only caches get none.
  pub fn attach(&self, bridge: &SyncBridge) -> Subscription {
    let mut routes = Vec::new();

    let alerts = self.alerts.cache();
    for topic in ["alert:created", "alert:updated", "alert:acknowledged"] {
      routes.push(bridge.route(topic, alerts, PushAction::Upsert));
    }
    for topic in ["alert:resolved", "alert:deleted"] {
      routes.push(bridge.route(topic, alerts, PushAction::Remove));
    }

    let notifications = self.notifications.cache();
    for topic in ["notification:new", "notification:updated"] {
      routes.push(bridge.route(topic, notifications, PushAction::Upsert));
    }
    routes.push(bridge.route("notification:deleted", notifications, PushAction::Remove));

    let target = Arc::new(self.chat.clone());
    let chat = self.chat.clone();
    routes.push(bridge.route_with("message:new", target.clone(), move |p| chat.handle_new_message(p)));
    let chat = self.chat.clone();
    routes.push(bridge.route_with("message:updated", target.clone(), move |p| {
      chat.handle_updated_message(p)
    }));
    let chat = self.chat.clone();
    routes.push(bridge.route_with("message:deleted", target.clone(), move |p| {
      chat.handle_deleted_message(p)
    }));
    let chat = self.chat.clone();
    routes.push(bridge.route_with("message:delivered", target.clone(), move |p| {
      chat.handle_receipt(p, Receipt::Delivered)
    }));
    let chat = self.chat.clone();
    routes.push(bridge.route_with("message:read", target.clone(), move |p| {
      chat.handle_receipt(p, Receipt::Read)
    }));
    let conversations = self.chat.conversations().clone();
    routes.push(bridge.route_with("conversation:updated", target.clone(), move |p| {
      conversations.merge_one(p);
    }));
    let conversations = self.chat.conversations().clone();
    routes.push(bridge.route_with("conversation:deleted", target, move |p| {
      let id = Fields::new(unwrap_envelope(p))
        .string(&["id", "conversation_id", "conversationId", "_id"])
        .or_else(|| p.as_str().map(str::to_string));
      if let Some(id) = id {
        conversations.remove_one(&id);
      }
    }));

    info!(routes = routes.len(), "push routes attached");
    Subscription::join(routes)
  }

  /// Empty every cache (logout).
  pub fn clear_all(&self) {
    self.users.clear();
    self.ponds.clear();
    self.fish.clear();
    self.samplings.clear();
    self.tasks.clear();
    self.alerts.cache().clear();
    self.notifications.cache().clear();
    self.chat.clear();
  }

  pub fn summary(&self) -> FarmSummary {
    let now = self.clock.now();
    FarmSummary {
      users: self.users.len(),
      ponds: self.ponds.len(),
      active_ponds: self.ponds.active().len(),
      fish_stocked: self.fish.with_items(|items| items.iter().map(|f| f.count).sum()),
      tasks: self.tasks.len(),
      overdue_tasks: self.tasks.overdue(now).len(),
      active_alerts: self.alerts.unresolved_count(),
      critical_alerts: self.alerts.critical_unacknowledged().len(),
      unread_notifications: self.notifications.unread_count(),
      conversations: self.chat.conversations().len(),
      unread_messages: self.chat.total_unread(),
    }
  }
}

/// Headline counts across every cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FarmSummary {
  pub users: usize,
  pub ponds: usize,
  pub active_ponds: usize,
  pub fish_stocked: i64,
  pub tasks: usize,
  pub overdue_tasks: usize,
  pub active_alerts: usize,
  pub critical_alerts: usize,
  pub unread_notifications: usize,
  pub conversations: usize,
  pub unread_messages: u32,
}

impl fmt::Display for FarmSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "ponds          {} ({} active)", self.ponds, self.active_ponds)?;
    writeln!(f, "fish stocked   {}", self.fish_stocked)?;
    writeln!(f, "tasks          {} ({} overdue)", self.tasks, self.overdue_tasks)?;
    writeln!(f, "alerts         {} open ({} critical)", self.active_alerts, self.critical_alerts)?;
    writeln!(f, "notifications  {} unread", self.unread_notifications)?;
    writeln!(f, "conversations  {} ({} unread)", self.conversations, self.unread_messages)?;
    write!(f, "users          {}", self.users)
  }
}
