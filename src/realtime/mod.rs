//! Push channel: the transport trait, its WebSocket implementation, and the
//! bridge that routes push payloads into entity caches.

mod bridge;
mod websocket;

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::Value;
use std::fmt;

use crate::cache::Subscription;
use crate::error::SyncError;

pub use bridge::{PushAction, Resync, SyncBridge};
pub use websocket::WsRealtime;

/// State of the single logical push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
  #[default]
  Disconnected,
  Connecting,
  /// First successful connection of the session.
  Connected,
  /// A later successful connection after a drop.
  Reconnected,
}

impl ConnectionState {
  /// Whether the channel is up.
  pub fn is_up(self) -> bool {
    matches!(self, ConnectionState::Connected | ConnectionState::Reconnected)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ConnectionState::Disconnected => "disconnected",
      ConnectionState::Connecting => "connecting",
      ConnectionState::Connected => "connected",
      ConnectionState::Reconnected => "reconnected",
    }
  }
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

pub type PushHandler = Box<dyn Fn(&Value) + Send + Sync>;
pub type ConnectionHandler = Box<dyn Fn(&ConnectionState) + Send + Sync>;

/// Real-time transport collaborator.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
  /// Start connecting. Idempotent; state changes arrive via `on_connection`.
  async fn connect(&self) -> Result<()>;

  /// Subscribe to a named push topic.
  fn on(&self, topic: &str, handler: PushHandler) -> Subscription;

  /// Subscribe to connection state changes.
  fn on_connection(&self, handler: ConnectionHandler) -> Subscription;

  /// Send a payload on a topic. Fails with `ConnectionLost` while down.
  fn send(&self, topic: &str, payload: Value) -> std::result::Result<(), SyncError>;

  fn is_connected(&self) -> bool;
}
