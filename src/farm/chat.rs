//! Chat store: one conversation list plus a message cache per conversation.
//!
//! Unread accounting lives here rather than in the caches: a conversation's
//! `unread_count` goes up by one for each inbound message that is *newly
//! inserted* while the conversation is not the active one, and only an
//! explicit mark-read resets it. Redelivered pushes, edits and reactions
//! update messages in place and never touch the counter.

use chrono::Duration;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{Conversation, Message, MessageStatus};
use super::{spawn_remote, RemoteCall};
use crate::cache::payload::{extract_list, unwrap_envelope, Fields};
use crate::cache::{normalize, CacheConfig, CacheDeps, EntityCache, MergeOutcome};
use crate::error::SyncError;
use crate::realtime::Resync;
use crate::transport::FetchOptions;

/// Which receipt a push carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
  Delivered,
  Read,
}

struct ChatInner {
  deps: CacheDeps,
  user_id: Option<String>,
  message_stale: Duration,
  conversations: EntityCache<Conversation>,
  messages: Mutex<HashMap<String, EntityCache<Message>>>,
  active: Mutex<Option<String>>,
}

#[derive(Clone)]
pub struct ChatStore {
  inner: Arc<ChatInner>,
}

fn by_created(a: &Message, b: &Message) -> Ordering {
  a.created_at.cmp(&b.created_at)
}

impl ChatStore {
  pub fn new(
    deps: CacheDeps,
    user_id: Option<String>,
    conversation_stale: Duration,
    message_stale: Duration,
  ) -> Self {
    let config = CacheConfig::new("conversations", "/conversations")
      .with_list_keys(&["conversations"])
      .with_stale_after(conversation_stale)
      .prepend();
    Self {
      inner: Arc::new(ChatInner {
        conversations: EntityCache::new(config, deps.clone()),
        deps,
        user_id,
        message_stale,
        messages: Mutex::new(HashMap::new()),
        active: Mutex::new(None),
      }),
    }
  }

  pub fn conversations(&self) -> &EntityCache<Conversation> {
    &self.inner.conversations
  }

  pub async fn fetch_conversations(&self, force: bool) -> Result<Vec<Conversation>, SyncError> {
    self.inner.conversations.fetch(force).await
  }

  /// The message cache of one conversation, created on first use.
  pub fn message_cache(&self, conversation_id: &str) -> EntityCache<Message> {
    let mut caches = self.inner.message_caches();
    caches
      .entry(conversation_id.to_string())
      .or_insert_with(|| {
        let config = CacheConfig::new(
          format!("messages:{}", conversation_id),
          format!("/conversations/{}/messages", conversation_id),
        )
        .with_list_keys(&["messages"])
        .with_stale_after(self.inner.message_stale)
        .sorted_by(by_created);
        EntityCache::new(config, self.inner.deps.clone())
      })
      .clone()
  }

  pub async fn fetch_messages(&self, conversation_id: &str, force: bool) -> Result<Vec<Message>, SyncError> {
    self.message_cache(conversation_id).fetch(force).await
  }

  /// Messages of a conversation in chronological order. Empty if never loaded.
  pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
    let cache = self.inner.message_caches().get(conversation_id).cloned();
    cache.map(|c| c.get_sync()).unwrap_or_default()
  }

  /// Fetch the page before the oldest cached message. New messages from an
  /// older page are history, so they are neither announced nor counted
  /// unread. Returns how many were new.
  pub async fn load_older(&self, conversation_id: &str) -> Result<usize, SyncError> {
    let cache = self.message_cache(conversation_id);
    let oldest = cache.with_items(|items| items.iter().find_map(|m| m.created_at));

    let mut options = FetchOptions::get();
    if let Some(before) = oldest {
      options = options.with_query("before", before.to_rfc3339());
    }

    let endpoint = format!("/conversations/{}/messages", conversation_id);
    let page = self
      .inner
      .deps
      .transport
      .fetch_json(&endpoint, options)
      .await
      .map_err(|e| SyncError::fetch("message", &e))?;

    let added = cache.merge_many(extract_list(&page, &["messages"]), false);
    debug!(conversation = %conversation_id, added, "loaded older messages");
    Ok(added)
  }

  pub fn active(&self) -> Option<String> {
    self.inner.active_slot().clone()
  }

  /// Set the open conversation. Inbound messages for it don't count unread.
  pub fn set_active(&self, conversation_id: Option<&str>) {
    *self.inner.active_slot() = conversation_id.map(str::to_string);
  }

  /// Activate a conversation and mark it read.
  pub fn open(&self, conversation_id: &str) -> RemoteCall {
    self.set_active(Some(conversation_id));
    self.mark_read(conversation_id)
  }

  pub fn mark_read(&self, conversation_id: &str) -> RemoteCall {
    self.inner.conversations.update_one(conversation_id, |c| c.unread_count = 0);

    spawn_remote(
      Arc::clone(&self.inner.deps.transport),
      "mark conversation read",
      format!("/conversations/{}/read", conversation_id),
      FetchOptions::post(json!({})),
    )
  }

  pub fn total_unread(&self) -> u32 {
    self
      .inner
      .conversations
      .with_items(|items| items.iter().map(|c| c.unread_count).sum())
  }

  /// Send a message optimistically.
  ///
  /// A `sending` record under a provisional `local-` id is visible at once.
  /// On success it is re-keyed to the server record (at least `sent`); on
  /// failure it stays in place as `failed`.
  pub async fn send_message(&self, conversation_id: &str, body: &str) -> Result<Message, SyncError> {
    let cache = self.message_cache(conversation_id);
    let local_id = format!("{}{}", Message::LOCAL_PREFIX, Uuid::new_v4());
    let now = self.inner.deps.clock.now();

    let provisional = Message {
      id: local_id.clone(),
      conversation_id: conversation_id.to_string(),
      sender_id: self.inner.user_id.clone().unwrap_or_default(),
      body: body.to_string(),
      status: MessageStatus::Sending,
      client_id: Some(local_id.clone()),
      created_at: Some(now),
      ..Message::default()
    };
    cache.upsert(provisional.clone());
    self.inner.touch_conversation(&provisional, false);

    let endpoint = format!("/conversations/{}/messages", conversation_id);
    let options = FetchOptions::post(json!({ "body": body, "client_id": local_id }));
    let response = self.inner.deps.transport.fetch_json(&endpoint, options).await;

    match response {
      Ok(payload) => {
        let mut confirmed: Message = normalize(unwrap_envelope(&payload));
        if confirmed.id.is_empty() {
          // Accepted without echoing the record back.
          cache.update_one(&local_id, |m| m.status = m.status.advance(MessageStatus::Sent));
          return Ok(cache.get(&local_id).unwrap_or(provisional));
        }

        confirmed.status = MessageStatus::Sent.advance(confirmed.status);
        confirmed.client_id = Some(local_id.clone());
        if confirmed.conversation_id.is_empty() {
          confirmed.conversation_id = conversation_id.to_string();
        }
        if confirmed.created_at.is_none() {
          confirmed.created_at = provisional.created_at;
        }

        let key = confirmed.id.clone();
        cache.rekey(&local_id, confirmed.clone());
        debug!(conversation = %conversation_id, local = %local_id, key = %key, "message confirmed");
        Ok(cache.get(&key).unwrap_or(confirmed))
      }
      Err(e) => {
        let err = SyncError::mutation("send message", &e);
        warn!(conversation = %conversation_id, local = %local_id, error = %err, "message send failed");
        cache.update_one(&local_id, |m| m.status = m.status.advance(MessageStatus::Failed));
        Err(err)
      }
    }
  }

  /// Handle a `message:new` push.
  pub fn handle_new_message(&self, payload: &Value) {
    let payload = unwrap_envelope(payload);
    let message: Message = normalize(payload);
    if message.conversation_id.is_empty() || message.id.is_empty() {
      debug!("message push without conversation or id");
      return;
    }

    let cache = self.message_cache(&message.conversation_id);

    // Echo of our own optimistic send: replace the provisional record.
    if let Some(client_id) = message.client_id.as_deref() {
      if client_id != message.id && cache.get(client_id).is_some() {
        let mut confirmed = message.clone();
        confirmed.status = MessageStatus::Sent.advance(confirmed.status);
        cache.rekey(client_id, confirmed);
        return;
      }
    }

    if cache.merge_one(payload) == MergeOutcome::Inserted {
      let inbound = message.is_inbound(self.inner.user_id.as_deref());
      self.inner.touch_conversation(&message, inbound);
    }
  }

  /// Handle a `message:updated` push (edits, reactions). Never counts unread.
  pub fn handle_updated_message(&self, payload: &Value) {
    let payload = unwrap_envelope(payload);
    let message: Message = normalize(payload);
    if message.conversation_id.is_empty() {
      debug!("message update without conversation");
      return;
    }
    self.message_cache(&message.conversation_id).merge_one(payload);
  }

  /// Handle a `message:deleted` push.
  pub fn handle_deleted_message(&self, payload: &Value) {
    let f = Fields::new(unwrap_envelope(payload));
    let Some(id) = f.string(&["message_id", "messageId", "id", "_id"]) else {
      debug!("message delete without id");
      return;
    };

    match f.string(&["conversation_id", "conversationId", "chat_id"]) {
      Some(conversation_id) => {
        self.message_cache(&conversation_id).remove_one(&id);
      }
      None => {
        let caches: Vec<EntityCache<Message>> = self.inner.message_caches().values().cloned().collect();
        for cache in caches {
          if cache.remove_one(&id) {
            break;
          }
        }
      }
    }
  }

  /// Apply a delivery or read receipt and recompute the rollup status.
  ///
  /// A receipt names its messages (`message_id` or `message_ids`) and the
  /// recipient (`user_id`). Without a recipient it covers every intended
  /// recipient.
  pub fn handle_receipt(&self, payload: &Value, kind: Receipt) {
    let f = Fields::new(unwrap_envelope(payload));
    let Some(conversation_id) = f.string(&["conversation_id", "conversationId", "chat_id"]) else {
      debug!(?kind, "receipt without conversation");
      return;
    };
    let ids = f
      .strings(&["message_ids", "messageIds"])
      .or_else(|| f.string(&["message_id", "messageId", "id"]).map(|id| vec![id]))
      .unwrap_or_default();
    let reader = f.string(&["user_id", "userId", "reader_id", "recipient_id"]);

    let participants = self
      .inner
      .conversations
      .get(&conversation_id)
      .map(|c| c.participants)
      .unwrap_or_default();
    let cache = self.message_cache(&conversation_id);

    for id in ids {
      cache.update_one(&id, |m| {
        let intended = m.intended_recipients(&participants);
        let readers = match &reader {
          Some(reader) => vec![reader.clone()],
          None => intended.clone(),
        };
        for user in &readers {
          match kind {
            Receipt::Delivered => m.mark_delivered(user),
            Receipt::Read => m.mark_read(user),
          }
        }
        m.apply_rollup(&intended);
      });
    }
  }

  /// Drop every conversation and message cache (logout).
  pub fn clear(&self) {
    self.inner.conversations.clear();
    let caches: Vec<EntityCache<Message>> = self.inner.message_caches().drain().map(|(_, c)| c).collect();
    for cache in caches {
      cache.clear();
    }
    self.set_active(None);
  }
}

impl ChatInner {
  fn message_caches(&self) -> MutexGuard<'_, HashMap<String, EntityCache<Message>>> {
    self.messages.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn active_slot(&self) -> MutexGuard<'_, Option<String>> {
    self.active.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Move a conversation to the front for a new message, counting it unread
  /// when it is inbound and the conversation is not open.
  fn touch_conversation(&self, message: &Message, inbound: bool) {
    let conversation_id = &message.conversation_id;
    let counts_unread = inbound && self.active_slot().as_deref() != Some(conversation_id.as_str());

    if self.conversations.get(conversation_id).is_none() {
      info!(conversation = %conversation_id, "message for unknown conversation");
      self.conversations.upsert(Conversation {
        id: conversation_id.clone(),
        ..Conversation::default()
      });
    }

    self.conversations.update_one(conversation_id, |c| {
      c.touch(message.created_at, &message.body);
      if counts_unread {
        c.unread_count += 1;
      }
    });
    self.conversations.promote(conversation_id);
  }
}

impl Resync for ChatStore {
  fn resync_name(&self) -> String {
    "chat".to_string()
  }

  /// Refetch the conversation list and every loaded message cache.
  fn resync(&self) -> BoxFuture<'static, ()> {
    let conversations = self.inner.conversations.clone();
    let caches: Vec<EntityCache<Message>> = self.inner.message_caches().values().cloned().collect();
    async move {
      if let Err(e) = conversations.fetch(true).await {
        warn!(error = %e, "conversation resync failed");
      }
      for result in join_all(caches.iter().map(|c| c.fetch(true))).await {
        if let Err(e) = result {
          warn!(error = %e, "message resync failed");
        }
      }
    }
    .boxed()
  }
}
