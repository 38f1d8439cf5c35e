//! Domain types for the farm entities.
//!
//! Field names here are the canonical spellings: they are what the raw
//! payload readers in `api_types` accept first, so a serialized record can be
//! read back as a payload during a merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::api_types::{
  RawAlert, RawConversation, RawFish, RawMessage, RawNotification, RawPond, RawSampling, RawTask,
  RawUser,
};
use crate::cache::Entity;

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  #[default]
  Info,
  Warning,
  Critical,
}

impl Severity {
  pub fn parse(raw: &str) -> Option<Self> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "info" | "low" | "notice" => Some(Severity::Info),
      "warning" | "warn" | "medium" => Some(Severity::Warning),
      "critical" | "high" | "urgent" | "error" => Some(Severity::Critical),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Severity::Info => "info",
      Severity::Warning => "warning",
      Severity::Critical => "critical",
    }
  }
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Alert lifecycle: `active → acknowledged → resolved`, or `active → deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
  #[default]
  Active,
  Acknowledged,
  Resolved,
  Deleted,
}

impl AlertStatus {
  pub fn parse(raw: &str) -> Option<Self> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "active" | "open" | "new" | "triggered" => Some(AlertStatus::Active),
      "acknowledged" | "ack" | "acked" => Some(AlertStatus::Acknowledged),
      "resolved" | "closed" => Some(AlertStatus::Resolved),
      "deleted" | "dismissed" => Some(AlertStatus::Deleted),
      _ => None,
    }
  }

  /// Still shown in the active view.
  pub fn is_open(self) -> bool {
    matches!(self, AlertStatus::Active | AlertStatus::Acknowledged)
  }

  pub fn is_terminal(self) -> bool {
    !self.is_open()
  }

  fn rank(self) -> u8 {
    match self {
      AlertStatus::Active => 0,
      AlertStatus::Acknowledged => 1,
      AlertStatus::Resolved | AlertStatus::Deleted => 2,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  #[default]
  Pending,
  InProgress,
  Completed,
  Cancelled,
}

impl TaskStatus {
  pub fn parse(raw: &str) -> Option<Self> {
    match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
      "pending" | "todo" | "open" | "new" => Some(TaskStatus::Pending),
      "in_progress" | "inprogress" | "doing" | "started" => Some(TaskStatus::InProgress),
      "completed" | "complete" | "done" => Some(TaskStatus::Completed),
      "cancelled" | "canceled" => Some(TaskStatus::Cancelled),
      _ => None,
    }
  }

  pub fn is_closed(self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
  }
}

/// Chat message delivery status.
///
/// `sending → sent → delivered → read` only moves forward. `failed` is
/// reachable only from `sending` and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
  Sending,
  #[default]
  Sent,
  Delivered,
  Read,
  Failed,
}

impl MessageStatus {
  pub fn parse(raw: &str) -> Option<Self> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "sending" | "pending" => Some(MessageStatus::Sending),
      "sent" => Some(MessageStatus::Sent),
      "delivered" => Some(MessageStatus::Delivered),
      "read" | "seen" => Some(MessageStatus::Read),
      "failed" | "error" => Some(MessageStatus::Failed),
      _ => None,
    }
  }

  fn rank(self) -> u8 {
    match self {
      MessageStatus::Sending => 0,
      MessageStatus::Sent => 1,
      MessageStatus::Delivered => 2,
      MessageStatus::Read => 3,
      MessageStatus::Failed => 0,
    }
  }

  /// The status after observing `next`; never moves backward.
  pub fn advance(self, next: MessageStatus) -> MessageStatus {
    match (self, next) {
      (MessageStatus::Failed, _) => MessageStatus::Failed,
      (MessageStatus::Sending, MessageStatus::Failed) => MessageStatus::Failed,
      (current, MessageStatus::Failed) => current,
      (current, next) if next.rank() > current.rank() => next,
      (current, _) => current,
    }
  }
}

// ============================================================================
// Alerts and notifications
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Alert {
  pub id: String,
  pub title: String,
  pub message: String,
  pub severity: Severity,
  pub status: AlertStatus,
  pub pond_id: Option<String>,
  pub created_at: Option<DateTime<Utc>>,
  pub acknowledged_at: Option<DateTime<Utc>>,
  pub resolved_at: Option<DateTime<Utc>>,
}

impl Entity for Alert {
  type Raw = RawAlert;

  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "alert"
  }

  /// Lifecycle only moves forward through merges.
  fn reconcile(previous: &Self, mut merged: Self) -> Self {
    if previous.status.rank() > merged.status.rank() {
      merged.status = previous.status;
    }
    merged.acknowledged_at = merged.acknowledged_at.or(previous.acknowledged_at);
    merged.resolved_at = merged.resolved_at.or(previous.resolved_at);
    merged
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notification {
  pub id: String,
  pub title: String,
  pub message: String,
  pub kind: String,
  pub severity: Severity,
  pub read: bool,
  pub link: Option<String>,
  pub created_at: Option<DateTime<Utc>>,
  pub read_at: Option<DateTime<Utc>>,
}

impl Entity for Notification {
  type Raw = RawNotification;

  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "notification"
  }

  fn reconcile(previous: &Self, mut merged: Self) -> Self {
    if previous.read {
      merged.read = true;
      merged.read_at = merged.read_at.or(previous.read_at);
    }
    merged
  }
}

// ============================================================================
// Chat
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conversation {
  pub id: String,
  pub title: String,
  pub participants: Vec<String>,
  pub is_group: bool,
  pub unread_count: u32,
  pub last_activity: Option<DateTime<Utc>>,
  pub last_message: Option<String>,
}

impl Conversation {
  /// Record a message's activity unless it is older than what is shown.
  pub fn touch(&mut self, at: Option<DateTime<Utc>>, preview: &str) {
    if at.is_some() && at < self.last_activity {
      return;
    }
    self.last_activity = at.or(self.last_activity);
    self.last_message = Some(preview.to_string());
  }
}

impl Entity for Conversation {
  type Raw = RawConversation;

  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "conversation"
  }

  /// The unread counter is local state: merges never move it. Only message
  /// accounting, mark-read and a full fetch do.
  fn reconcile(previous: &Self, mut merged: Self) -> Self {
    if previous.last_activity > merged.last_activity {
      merged.last_activity = previous.last_activity;
      merged.last_message = previous.last_message.clone();
    }
    merged.unread_count = previous.unread_count;
    merged
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
  pub id: String,
  pub conversation_id: String,
  pub sender_id: String,
  pub body: String,
  pub status: MessageStatus,
  /// Provisional id a locally sent message was posted with.
  pub client_id: Option<String>,
  /// Explicit intended recipients; empty means everyone else in the conversation.
  pub recipients: Vec<String>,
  pub delivered_to: Vec<String>,
  pub read_by: Vec<String>,
  pub reactions: Value,
  pub created_at: Option<DateTime<Utc>>,
  pub edited_at: Option<DateTime<Utc>>,
}

impl Message {
  /// Prefix of ids assigned to messages not yet confirmed by the server.
  pub const LOCAL_PREFIX: &'static str = "local-";

  pub fn is_provisional(&self) -> bool {
    self.id.starts_with(Self::LOCAL_PREFIX)
  }

  /// Sent by someone other than `user_id`. Everything is inbound when the
  /// current user is unknown.
  pub fn is_inbound(&self, user_id: Option<&str>) -> bool {
    user_id.map_or(true, |me| self.sender_id != me)
  }

  /// Who has to receive the message for it to count as delivered or read.
  pub fn intended_recipients(&self, participants: &[String]) -> Vec<String> {
    if !self.recipients.is_empty() {
      return self.recipients.clone();
    }
    participants
      .iter()
      .filter(|p| **p != self.sender_id)
      .cloned()
      .collect()
  }

  pub fn mark_delivered(&mut self, user_id: &str) {
    add_unique(&mut self.delivered_to, user_id);
  }

  /// A read implies delivery.
  pub fn mark_read(&mut self, user_id: &str) {
    add_unique(&mut self.read_by, user_id);
    add_unique(&mut self.delivered_to, user_id);
  }

  /// Recompute the status from the receipt sets.
  ///
  /// With no known recipients any receipt counts for the whole message.
  pub fn apply_rollup(&mut self, intended: &[String]) {
    for reader in self.read_by.clone() {
      add_unique(&mut self.delivered_to, &reader);
    }

    let covers = |set: &[String]| {
      if intended.is_empty() {
        !set.is_empty()
      } else {
        intended.iter().all(|r| set.contains(r))
      }
    };

    let derived = if covers(&self.read_by) {
      MessageStatus::Read
    } else if covers(&self.delivered_to) {
      MessageStatus::Delivered
    } else {
      MessageStatus::Sent
    };
    self.status = self.status.advance(derived);
  }
}

impl Entity for Message {
  type Raw = RawMessage;

  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "message"
  }

  /// Receipts accumulate and status never regresses.
  fn reconcile(previous: &Self, mut merged: Self) -> Self {
    merged.status = previous.status.advance(merged.status);
    for user in &previous.delivered_to {
      add_unique(&mut merged.delivered_to, user);
    }
    for user in &previous.read_by {
      add_unique(&mut merged.read_by, user);
    }
    if merged.client_id.is_none() {
      merged.client_id = previous.client_id.clone();
    }
    merged
  }
}

fn add_unique(set: &mut Vec<String>, value: &str) {
  if !value.is_empty() && !set.iter().any(|v| v == value) {
    set.push(value.to_string());
  }
}

// ============================================================================
// Poll-only records
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
  pub id: String,
  pub title: String,
  pub description: Option<String>,
  pub status: TaskStatus,
  pub priority: Option<String>,
  pub assignee_id: Option<String>,
  pub pond_id: Option<String>,
  pub due_date: Option<DateTime<Utc>>,
  pub created_at: Option<DateTime<Utc>>,
}

impl Task {
  pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
    !self.status.is_closed() && self.due_date.is_some_and(|due| due < now)
  }
}

impl Entity for Task {
  type Raw = RawTask;

  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "task"
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pond {
  pub id: String,
  pub name: String,
  pub status: String,
  pub species: Option<String>,
  pub area_m2: Option<f64>,
  pub depth_m: Option<f64>,
  pub capacity: Option<i64>,
}

impl Pond {
  pub fn is_active(&self) -> bool {
    self.status.eq_ignore_ascii_case("active")
  }
}

impl Entity for Pond {
  type Raw = RawPond;

  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "pond"
  }
}

/// A stocked batch of fish in one pond.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fish {
  pub id: String,
  pub pond_id: Option<String>,
  pub species: String,
  pub count: i64,
  pub average_weight_g: Option<f64>,
  pub stocked_at: Option<DateTime<Utc>>,
}

impl Entity for Fish {
  type Raw = RawFish;

  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "fish"
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
  pub id: String,
  pub name: String,
  pub email: Option<String>,
  pub role: String,
  pub active: bool,
}

impl Entity for User {
  type Raw = RawUser;

  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "user"
  }
}

/// A growth measurement taken from one pond.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sampling {
  pub id: String,
  pub pond_id: Option<String>,
  pub sampled_at: Option<DateTime<Utc>>,
  pub sample_size: Option<u32>,
  pub average_weight_g: Option<f64>,
  pub average_length_cm: Option<f64>,
  pub notes: Option<String>,
}

impl Entity for Sampling {
  type Raw = RawSampling;

  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "sampling"
  }
}
