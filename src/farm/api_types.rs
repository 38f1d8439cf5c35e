//! Raw payload records for the farm backend.
//!
//! Every field is optional and skipped when absent, so a record serializes to
//! exactly the fields its payload carried. Each reader lists the canonical
//! field name first, then the historical spellings the backend has used.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::types::{
  Alert, AlertStatus, Conversation, Fish, Message, MessageStatus, Notification, Pond, Sampling,
  Severity, Task, TaskStatus, User,
};
use crate::cache::payload::Fields;
use crate::cache::RawRecord;

/// Id of a nested object (`{"pond": {"id": 4}}`) or a flat alias.
fn related_id(f: &Fields<'_>, flat: &[&str], nested: &[&str]) -> Option<String> {
  f.string(flat).or_else(|| {
    f.object(nested)
      .and_then(|o| o.string(&["id", "_id", "user_id", "pond_id"]))
  })
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Default, Serialize)]
pub struct RawAlert {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub severity: Option<Severity>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<AlertStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pond_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub acknowledged_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolved_at: Option<DateTime<Utc>>,
}

impl RawRecord<Alert> for RawAlert {
  fn from_payload(payload: &Value) -> Self {
    let f = Fields::new(payload);

    // Older payloads carry booleans instead of a status string.
    let status = f
      .string(&["status", "state"])
      .and_then(|s| AlertStatus::parse(&s))
      .or_else(|| {
        if f.bool(&["resolved", "is_resolved", "isResolved"]) == Some(true) {
          Some(AlertStatus::Resolved)
        } else if f.bool(&["acknowledged", "is_acknowledged", "isAcknowledged"]) == Some(true) {
          Some(AlertStatus::Acknowledged)
        } else {
          None
        }
      });

    Self {
      id: f.string(&["id", "alert_id", "alertId", "_id"]),
      title: f.string(&["title", "name", "alert_type", "type"]),
      message: f.string(&["message", "description", "details", "body"]),
      severity: f
        .string(&["severity", "level", "priority"])
        .and_then(|s| Severity::parse(&s)),
      status,
      pond_id: related_id(&f, &["pond_id", "pondId"], &["pond"]),
      created_at: f.timestamp(&["created_at", "createdAt", "timestamp", "triggered_at"]),
      acknowledged_at: f.timestamp(&["acknowledged_at", "acknowledgedAt"]),
      resolved_at: f.timestamp(&["resolved_at", "resolvedAt"]),
    }
  }

  fn into_entity(self) -> Alert {
    Alert {
      id: self.id.unwrap_or_default(),
      title: self.title.unwrap_or_default(),
      message: self.message.unwrap_or_default(),
      severity: self.severity.unwrap_or_default(),
      status: self.status.unwrap_or_default(),
      pond_id: self.pond_id,
      created_at: self.created_at,
      acknowledged_at: self.acknowledged_at,
      resolved_at: self.resolved_at,
    }
  }
}

#[derive(Debug, Default, Serialize)]
pub struct RawNotification {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub kind: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub severity: Option<Severity>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub read: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub link: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub read_at: Option<DateTime<Utc>>,
}

impl RawRecord<Notification> for RawNotification {
  fn from_payload(payload: &Value) -> Self {
    let f = Fields::new(payload);
    let read_at = f.timestamp(&["read_at", "readAt"]);

    Self {
      id: f.string(&["id", "notification_id", "notificationId", "_id"]),
      title: f.string(&["title", "subject"]),
      message: f.string(&["message", "body", "content", "text"]),
      kind: f.string(&["kind", "type", "category"]),
      severity: f
        .string(&["severity", "priority", "level"])
        .and_then(|s| Severity::parse(&s)),
      read: f
        .bool(&["read", "is_read", "isRead", "seen"])
        .or(read_at.map(|_| true)),
      link: f.string(&["link", "url", "action_url"]),
      created_at: f.timestamp(&["created_at", "createdAt", "timestamp"]),
      read_at,
    }
  }

  fn into_entity(self) -> Notification {
    Notification {
      id: self.id.unwrap_or_default(),
      title: self.title.unwrap_or_default(),
      message: self.message.unwrap_or_default(),
      kind: self.kind.unwrap_or_else(|| "general".to_string()),
      severity: self.severity.unwrap_or_default(),
      read: self.read.unwrap_or(false),
      link: self.link,
      created_at: self.created_at,
      read_at: self.read_at,
    }
  }
}

// ============================================================================
// Chat
// ============================================================================

#[derive(Debug, Default, Serialize)]
pub struct RawConversation {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub participants: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub is_group: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub unread_count: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_activity: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_message: Option<String>,
}

impl RawRecord<Conversation> for RawConversation {
  fn from_payload(payload: &Value) -> Self {
    let f = Fields::new(payload);

    // `last_message` is either a preview string or a whole message object.
    let last = f.object(&["last_message", "lastMessage"]);
    let last_message = match last {
      Some(msg) => msg.string(&["body", "content", "text", "message"]),
      None => f.string(&["last_message", "lastMessage", "preview"]),
    };
    let last_activity = f
      .timestamp(&["last_activity", "lastActivity", "updated_at", "updatedAt", "last_message_at"])
      .or_else(|| last.and_then(|m| m.timestamp(&["created_at", "createdAt", "timestamp"])));

    Self {
      id: f.string(&["id", "conversation_id", "conversationId", "_id"]),
      title: f.string(&["title", "name", "subject"]),
      participants: f.strings(&["participants", "participant_ids", "participantIds", "members"]),
      is_group: f.bool(&["is_group", "isGroup", "group"]),
      unread_count: f.u32(&["unread_count", "unreadCount", "unread"]),
      last_activity,
      last_message,
    }
  }

  fn into_entity(self) -> Conversation {
    let participants = self.participants.unwrap_or_default();
    Conversation {
      id: self.id.unwrap_or_default(),
      title: self.title.unwrap_or_default(),
      is_group: self.is_group.unwrap_or(participants.len() > 2),
      participants,
      unread_count: self.unread_count.unwrap_or(0),
      last_activity: self.last_activity,
      last_message: self.last_message,
    }
  }
}

#[derive(Debug, Default, Serialize)]
pub struct RawMessage {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub conversation_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sender_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub body: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<MessageStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub client_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub recipients: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub delivered_to: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub read_by: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reactions: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub edited_at: Option<DateTime<Utc>>,
}

impl RawRecord<Message> for RawMessage {
  fn from_payload(payload: &Value) -> Self {
    let f = Fields::new(payload);

    Self {
      id: f.string(&["id", "message_id", "messageId", "_id"]),
      conversation_id: related_id(
        &f,
        &["conversation_id", "conversationId", "chat_id", "room_id"],
        &["conversation"],
      ),
      sender_id: related_id(&f, &["sender_id", "senderId", "from", "user_id", "author_id"], &["sender", "author"]),
      body: f.string(&["body", "content", "text", "message"]),
      status: f.string(&["status"]).and_then(|s| MessageStatus::parse(&s)),
      client_id: f.string(&["client_id", "clientId", "temp_id", "tempId"]),
      recipients: f.strings(&["recipients", "recipient_ids", "recipientIds"]),
      delivered_to: f.strings(&["delivered_to", "deliveredTo"]),
      read_by: f.strings(&["read_by", "readBy", "seen_by"]),
      reactions: f.value(&["reactions"]).cloned(),
      created_at: f.timestamp(&["created_at", "createdAt", "sent_at", "timestamp"]),
      edited_at: f.timestamp(&["edited_at", "editedAt", "updated_at"]),
    }
  }

  fn into_entity(self) -> Message {
    Message {
      id: self.id.unwrap_or_default(),
      conversation_id: self.conversation_id.unwrap_or_default(),
      sender_id: self.sender_id.unwrap_or_default(),
      body: self.body.unwrap_or_default(),
      status: self.status.unwrap_or_default(),
      client_id: self.client_id,
      recipients: self.recipients.unwrap_or_default(),
      delivered_to: self.delivered_to.unwrap_or_default(),
      read_by: self.read_by.unwrap_or_default(),
      reactions: self.reactions.unwrap_or(Value::Null),
      created_at: self.created_at,
      edited_at: self.edited_at,
    }
  }
}

// ============================================================================
// Tasks, ponds, stock, users, samplings
// ============================================================================

#[derive(Debug, Default, Serialize)]
pub struct RawTask {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<TaskStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub priority: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub assignee_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pond_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub due_date: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub created_at: Option<DateTime<Utc>>,
}

impl RawRecord<Task> for RawTask {
  fn from_payload(payload: &Value) -> Self {
    let f = Fields::new(payload);

    Self {
      id: f.string(&["id", "task_id", "taskId", "_id"]),
      title: f.string(&["title", "name"]),
      description: f.string(&["description", "details"]),
      status: f.string(&["status", "state"]).and_then(|s| TaskStatus::parse(&s)),
      priority: f.string(&["priority"]),
      assignee_id: related_id(
        &f,
        &["assignee_id", "assigneeId", "assigned_to", "assignedTo"],
        &["assignee", "assigned_to"],
      ),
      pond_id: related_id(&f, &["pond_id", "pondId"], &["pond"]),
      due_date: f.timestamp(&["due_date", "dueDate", "due_at", "deadline"]),
      created_at: f.timestamp(&["created_at", "createdAt"]),
    }
  }

  fn into_entity(self) -> Task {
    Task {
      id: self.id.unwrap_or_default(),
      title: self.title.unwrap_or_default(),
      description: self.description,
      status: self.status.unwrap_or_default(),
      priority: self.priority,
      assignee_id: self.assignee_id,
      pond_id: self.pond_id,
      due_date: self.due_date,
      created_at: self.created_at,
    }
  }
}

#[derive(Debug, Default, Serialize)]
pub struct RawPond {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub species: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub area_m2: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub depth_m: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub capacity: Option<i64>,
}

impl RawRecord<Pond> for RawPond {
  fn from_payload(payload: &Value) -> Self {
    let f = Fields::new(payload);
    let status = f.string(&["status", "state"]).or_else(|| {
      f.bool(&["is_active", "isActive", "active"])
        .map(|active| if active { "active" } else { "inactive" }.to_string())
    });

    Self {
      id: f.string(&["id", "pond_id", "pondId", "_id"]),
      name: f.string(&["name", "pond_name", "pondName", "label"]),
      status,
      species: f.string(&["species", "fish_type"]),
      area_m2: f.f64(&["area_m2", "area", "size"]),
      depth_m: f.f64(&["depth_m", "depth"]),
      capacity: f.i64(&["capacity", "max_capacity"]),
    }
  }

  fn into_entity(self) -> Pond {
    Pond {
      id: self.id.unwrap_or_default(),
      name: self.name.unwrap_or_default(),
      status: self.status.unwrap_or_else(|| "active".to_string()),
      species: self.species,
      area_m2: self.area_m2,
      depth_m: self.depth_m,
      capacity: self.capacity,
    }
  }
}

#[derive(Debug, Default, Serialize)]
pub struct RawFish {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pond_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub species: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub count: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub average_weight_g: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stocked_at: Option<DateTime<Utc>>,
}

impl RawRecord<Fish> for RawFish {
  fn from_payload(payload: &Value) -> Self {
    let f = Fields::new(payload);

    Self {
      id: f.string(&["id", "fish_id", "fishId", "batch_id", "_id"]),
      pond_id: related_id(&f, &["pond_id", "pondId"], &["pond"]),
      species: f.string(&["species", "name", "fish_type"]),
      count: f.i64(&["count", "quantity", "stock_count"]),
      average_weight_g: f.f64(&["average_weight_g", "avg_weight", "average_weight"]),
      stocked_at: f.timestamp(&["stocked_at", "stockedAt", "created_at"]),
    }
  }

  fn into_entity(self) -> Fish {
    Fish {
      id: self.id.unwrap_or_default(),
      pond_id: self.pond_id,
      species: self.species.unwrap_or_default(),
      count: self.count.unwrap_or(0).max(0),
      average_weight_g: self.average_weight_g,
      stocked_at: self.stocked_at,
    }
  }
}

#[derive(Debug, Default, Serialize)]
pub struct RawUser {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub role: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub active: Option<bool>,
}

impl RawRecord<User> for RawUser {
  fn from_payload(payload: &Value) -> Self {
    let f = Fields::new(payload);
    let name = f.string(&["name", "full_name", "fullName", "display_name"]).or_else(|| {
      let first = f.string(&["first_name", "firstName"])?;
      Some(match f.string(&["last_name", "lastName"]) {
        Some(last) => format!("{} {}", first, last),
        None => first,
      })
    });

    Self {
      id: f.string(&["id", "user_id", "userId", "_id"]),
      name: name.or_else(|| f.string(&["username"])),
      email: f.string(&["email", "mail"]),
      role: f.string(&["role", "user_role", "userRole"]),
      active: f.bool(&["active", "is_active", "isActive"]),
    }
  }

  fn into_entity(self) -> User {
    User {
      id: self.id.unwrap_or_default(),
      name: self.name.unwrap_or_default(),
      email: self.email,
      role: self.role.unwrap_or_else(|| "worker".to_string()),
      active: self.active.unwrap_or(true),
    }
  }
}

#[derive(Debug, Default, Serialize)]
pub struct RawSampling {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pond_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sampled_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sample_size: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub average_weight_g: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub average_length_cm: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

impl RawRecord<Sampling> for RawSampling {
  fn from_payload(payload: &Value) -> Self {
    let f = Fields::new(payload);

    Self {
      id: f.string(&["id", "sampling_id", "samplingId", "_id"]),
      pond_id: related_id(&f, &["pond_id", "pondId"], &["pond"]),
      sampled_at: f.timestamp(&["sampled_at", "sampledAt", "sampling_date", "date", "created_at"]),
      sample_size: f.u32(&["sample_size", "sampleSize", "count"]),
      average_weight_g: f.f64(&["average_weight_g", "avg_weight", "average_weight"]),
      average_length_cm: f.f64(&["average_length_cm", "avg_length", "average_length"]),
      notes: f.string(&["notes", "remarks"]),
    }
  }

  fn into_entity(self) -> Sampling {
    Sampling {
      id: self.id.unwrap_or_default(),
      pond_id: self.pond_id,
      sampled_at: self.sampled_at,
      sample_size: self.sample_size,
      average_weight_g: self.average_weight_g,
      average_length_cm: self.average_length_cm,
      notes: self.notes,
    }
  }
}
