//! Alert store: optimistic acknowledge/resolve/delete and active-view queries.

use chrono::Duration;
use std::sync::Arc;

use super::types::{Alert, AlertStatus, Severity};
use super::{spawn_remote, RemoteCall};
use crate::cache::{CacheConfig, CacheDeps, EntityCache};
use crate::clock::Clock;
use crate::error::SyncError;
use crate::transport::{FetchOptions, Transport};

#[derive(Clone)]
pub struct AlertStore {
  cache: EntityCache<Alert>,
  transport: Arc<dyn Transport>,
  clock: Arc<dyn Clock>,
}

impl AlertStore {
  pub fn new(deps: CacheDeps, stale_after: Duration) -> Self {
    let config = CacheConfig::new("alerts", "/alerts")
      .with_list_keys(&["alerts"])
      .with_stale_after(stale_after);
    Self {
      transport: Arc::clone(&deps.transport),
      clock: Arc::clone(&deps.clock),
      cache: EntityCache::new(config, deps),
    }
  }

  pub fn cache(&self) -> &EntityCache<Alert> {
    &self.cache
  }

  pub async fn fetch(&self, force: bool) -> Result<Vec<Alert>, SyncError> {
    self.cache.fetch(force).await
  }

  pub fn get_all(&self) -> Vec<Alert> {
    self.cache.get_sync()
  }

  /// Active and acknowledged alerts; resolved and deleted ones drop out.
  pub fn get_active(&self) -> Vec<Alert> {
    self.cache.filtered(|a| a.status.is_open())
  }

  pub fn unresolved_count(&self) -> usize {
    self.cache.with_items(|items| items.iter().filter(|a| a.status.is_open()).count())
  }

  pub fn critical_unacknowledged(&self) -> Vec<Alert> {
    self
      .cache
      .filtered(|a| a.severity == Severity::Critical && a.status == AlertStatus::Active)
  }

  /// Open alerts of one severity.
  pub fn by_severity(&self, severity: Severity) -> Vec<Alert> {
    self
      .cache
      .filtered(|a| a.severity == severity && a.status.is_open())
  }

  pub fn acknowledge(&self, id: &str) -> RemoteCall {
    let now = self.clock.now();
    self.cache.update_one(id, |alert| {
      if alert.status == AlertStatus::Active {
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_at = Some(now);
      }
    });

    spawn_remote(
      Arc::clone(&self.transport),
      "acknowledge alert",
      format!("/alerts/{}/acknowledge", id),
      FetchOptions::patch(serde_json::json!({ "status": "acknowledged" })),
    )
  }

  pub fn resolve(&self, id: &str) -> RemoteCall {
    let now = self.clock.now();
    self.cache.update_one(id, |alert| {
      if alert.status.is_open() {
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
      }
    });

    spawn_remote(
      Arc::clone(&self.transport),
      "resolve alert",
      format!("/alerts/{}/resolve", id),
      FetchOptions::patch(serde_json::json!({ "status": "resolved" })),
    )
  }

  pub fn delete(&self, id: &str) -> RemoteCall {
    self.cache.remove_one(id);

    spawn_remote(
      Arc::clone(&self.transport),
      "delete alert",
      format!("/alerts/{}", id),
      FetchOptions::delete(),
    )
  }
}
