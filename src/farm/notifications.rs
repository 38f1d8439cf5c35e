//! Notification store: local-first read state with fire-and-forget sync.

use chrono::Duration;
use serde_json::json;
use std::sync::Arc;

use super::types::Notification;
use super::{spawn_remote, RemoteCall};
use crate::cache::{CacheConfig, CacheDeps, EntityCache};
use crate::clock::Clock;
use crate::error::SyncError;
use crate::transport::{FetchOptions, Transport};

#[derive(Clone)]
pub struct NotificationStore {
  cache: EntityCache<Notification>,
  transport: Arc<dyn Transport>,
  clock: Arc<dyn Clock>,
}

impl NotificationStore {
  pub fn new(deps: CacheDeps, stale_after: Duration) -> Self {
    let config = CacheConfig::new("notifications", "/notifications")
      .with_list_keys(&["notifications"])
      .with_stale_after(stale_after)
      .prepend();
    Self {
      transport: Arc::clone(&deps.transport),
      clock: Arc::clone(&deps.clock),
      cache: EntityCache::new(config, deps),
    }
  }

  pub fn cache(&self) -> &EntityCache<Notification> {
    &self.cache
  }

  pub async fn fetch(&self, force: bool) -> Result<Vec<Notification>, SyncError> {
    self.cache.fetch(force).await
  }

  pub fn unread(&self) -> Vec<Notification> {
    self.cache.filtered(|n| !n.read)
  }

  pub fn unread_count(&self) -> usize {
    self.cache.with_items(|items| items.iter().filter(|n| !n.read).count())
  }

  pub fn mark_read(&self, id: &str) -> RemoteCall {
    let now = self.clock.now();
    self.cache.update_one(id, |n| {
      if !n.read {
        n.read = true;
        n.read_at = Some(now);
      }
    });

    spawn_remote(
      Arc::clone(&self.transport),
      "mark notification read",
      format!("/notifications/{}/read", id),
      FetchOptions::patch(json!({ "read": true })),
    )
  }

  pub fn mark_all_read(&self) -> RemoteCall {
    let now = self.clock.now();
    self.cache.update_all(|n| {
      if n.read {
        return false;
      }
      n.read = true;
      n.read_at = Some(now);
      true
    });

    spawn_remote(
      Arc::clone(&self.transport),
      "mark all notifications read",
      "/notifications/read-all".to_string(),
      FetchOptions::post(json!({})),
    )
  }

  pub fn delete(&self, id: &str) -> RemoteCall {
    self.cache.remove_one(id);

    spawn_remote(
      Arc::clone(&self.transport),
      "delete notification",
      format!("/notifications/{}", id),
      FetchOptions::delete(),
    )
  }
}
