//! WebSocket push transport.
//!
//! Frames are JSON objects naming a topic and carrying a payload:
//! `{"event": "alert:created", "data": {...}}`. Older servers send `topic`
//! and `payload` instead; both spellings are accepted.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::{ConnectionHandler, ConnectionState, PushHandler, RealtimeTransport};
use crate::cache::{EventBus, Subscription};
use crate::error::SyncError;

const MAX_BACKOFF_SECS: u64 = 30;

struct WsInner {
  url: String,
  token: Option<String>,
  topics: EventBus<String, Value>,
  connection: EventBus<(), ConnectionState>,
  connected: AtomicBool,
  started: AtomicBool,
  outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
  shutdown: watch::Sender<bool>,
}

/// WebSocket client with a reconnection loop.
#[derive(Clone)]
pub struct WsRealtime {
  inner: Arc<WsInner>,
}

impl WsRealtime {
  pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
    let (shutdown, _) = watch::channel(false);
    Self {
      inner: Arc::new(WsInner {
        url: url.into(),
        token,
        topics: EventBus::new(),
        connection: EventBus::new(),
        connected: AtomicBool::new(false),
        started: AtomicBool::new(false),
        outbound: Mutex::new(None),
        shutdown,
      }),
    }
  }

  /// Stop the reconnection loop and close the socket.
  pub fn shutdown(&self) {
    let _ = self.inner.shutdown.send(true);
  }
}

#[async_trait]
impl RealtimeTransport for WsRealtime {
  async fn connect(&self) -> Result<()> {
    if self.inner.started.swap(true, Ordering::SeqCst) {
      return Ok(());
    }

    let url = connect_url(&self.inner.url, self.inner.token.as_deref())?;
    let inner = Arc::clone(&self.inner);
    tokio::spawn(async move { inner.run(url).await });
    Ok(())
  }

  fn on(&self, topic: &str, handler: PushHandler) -> Subscription {
    self.inner.topics.subscribe(topic.to_string(), handler)
  }

  fn on_connection(&self, handler: ConnectionHandler) -> Subscription {
    self.inner.connection.subscribe((), handler)
  }

  fn send(&self, topic: &str, payload: Value) -> std::result::Result<(), SyncError> {
    if !self.is_connected() {
      return Err(SyncError::ConnectionLost("not connected".into()));
    }

    let outbound = self
      .inner
      .outbound
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    let tx = outbound
      .as_ref()
      .ok_or_else(|| SyncError::ConnectionLost("no open socket".into()))?;

    let frame = json!({ "event": topic, "data": payload }).to_string();
    tx.send(Message::Text(frame))
      .map_err(|_| SyncError::ConnectionLost("socket writer closed".into()))
  }

  fn is_connected(&self) -> bool {
    self.inner.connected.load(Ordering::SeqCst)
  }
}

impl WsInner {
  fn set_state(&self, state: ConnectionState) {
    self.connected.store(state.is_up(), Ordering::SeqCst);
    self.connection.emit(&(), &state);
  }

  /// Runs in a reconnection loop with exponential backoff.
  async fn run(self: Arc<Self>, url: Url) {
    let mut shutdown_rx = self.shutdown.subscribe();
    let mut backoff_secs = 1u64;
    let mut ever_connected = false;

    loop {
      if *shutdown_rx.borrow() {
        info!("push connection shutting down");
        break;
      }

      self.set_state(ConnectionState::Connecting);
      info!(url = %redacted(&url), "connecting push channel");

      match self
        .connect_and_process(&url, &mut shutdown_rx, &mut ever_connected, &mut backoff_secs)
        .await
      {
        Ok(()) => break,
        Err(e) => {
          error!(error = %e, "push connection error, reconnecting");
          self.drop_socket();
          self.set_state(ConnectionState::Disconnected);

          let wait = Duration::from_secs(backoff_secs);
          tokio::select! {
            _ = shutdown_rx.changed() => {
              if *shutdown_rx.borrow() {
                break;
              }
            }
            _ = tokio::time::sleep(wait) => {}
          }

          backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
      }
    }

    self.drop_socket();
    self.set_state(ConnectionState::Disconnected);
  }

  /// Connect and process frames until error or shutdown.
  async fn connect_and_process(
    &self,
    url: &Url,
    shutdown_rx: &mut watch::Receiver<bool>,
    ever_connected: &mut bool,
    backoff_secs: &mut u64,
  ) -> Result<()> {
    let (ws_stream, _) = connect_async(url.as_str())
      .await
      .map_err(|e| eyre!("connection failed: {}", e))?;
    let (mut write, mut read) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

    *backoff_secs = 1;
    let state = if *ever_connected {
      ConnectionState::Reconnected
    } else {
      ConnectionState::Connected
    };
    *ever_connected = true;
    info!(%state, "push channel up");
    self.set_state(state);

    loop {
      tokio::select! {
        _ = shutdown_rx.changed() => {
          if *shutdown_rx.borrow() {
            let _ = write.send(Message::Close(None)).await;
            return Ok(());
          }
        }
        Some(outgoing) = rx.recv() => {
          write
            .send(outgoing)
            .await
            .map_err(|e| eyre!("send failed: {}", e))?;
        }
        incoming = read.next() => {
          match incoming {
            Some(Ok(Message::Text(text))) => self.dispatch(&text),
            Some(Ok(Message::Ping(data))) => {
              write
                .send(Message::Pong(data))
                .await
                .map_err(|e| eyre!("pong failed: {}", e))?;
            }
            Some(Ok(Message::Close(frame))) => {
              return Err(eyre!("closed by server: {:?}", frame));
            }
            Some(Ok(other)) => trace!(?other, "ignoring non-text frame"),
            Some(Err(e)) => return Err(eyre!("read failed: {}", e)),
            None => return Err(eyre!("stream ended")),
          }
        }
      }
    }
  }

  fn dispatch(&self, text: &str) {
    match parse_frame(text) {
      Some((topic, payload)) => {
        let delivered = self.topics.emit(&topic, &payload);
        trace!(%topic, delivered, "push frame");
      }
      None => warn!(frame = %truncate(text, 200), "unparseable push frame"),
    }
  }

  fn drop_socket(&self) {
    *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = None;
  }
}

/// Split a frame into topic and payload. A frame without a payload field is
/// its own payload.
fn parse_frame(text: &str) -> Option<(String, Value)> {
  let mut frame: Value = serde_json::from_str(text).ok()?;
  let map = frame.as_object_mut()?;

  let topic = ["event", "topic", "type"]
    .iter()
    .find_map(|k| map.get(*k).and_then(Value::as_str))?
    .to_string();

  let payload = ["data", "payload"]
    .iter()
    .find_map(|k| map.remove(*k))
    .unwrap_or(frame);

  Some((topic, payload))
}

fn connect_url(raw: &str, token: Option<&str>) -> Result<Url> {
  let mut url = Url::parse(raw).map_err(|e| eyre!("Invalid realtime URL {}: {}", raw, e))?;
  if let Some(token) = token {
    url.query_pairs_mut().append_pair("token", token);
  }
  debug!(url = %redacted(&url), "push endpoint");
  Ok(url)
}

/// The URL without its query string, for logs.
fn redacted(url: &Url) -> String {
  let mut url = url.clone();
  url.set_query(None);
  url.to_string()
}

fn truncate(s: &str, max: usize) -> &str {
  match s.char_indices().nth(max) {
    Some((idx, _)) => &s[..idx],
    None => s,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_frame_spellings() {
    let (topic, payload) = parse_frame(r#"{"event":"alert:created","data":{"id":1}}"#).unwrap();
    assert_eq!(topic, "alert:created");
    assert_eq!(payload, json!({"id": 1}));

    let (topic, payload) = parse_frame(r#"{"topic":"message:read","payload":[1,2]}"#).unwrap();
    assert_eq!(topic, "message:read");
    assert_eq!(payload, json!([1, 2]));
  }

  #[test]
  fn test_frame_without_payload_is_its_own_payload() {
    let (topic, payload) = parse_frame(r#"{"type":"notification:new","notification_id":4}"#).unwrap();
    assert_eq!(topic, "notification:new");
    assert_eq!(payload["notification_id"], json!(4));
  }

  #[test]
  fn test_unparseable_frames() {
    assert!(parse_frame("not json").is_none());
    assert!(parse_frame("[1,2,3]").is_none());
    assert!(parse_frame(r#"{"data":{}}"#).is_none());
  }

  #[test]
  fn test_connect_url_appends_token_and_redacts() {
    let url = connect_url("wss://farm.example.com/ws", Some("s3cret")).unwrap();
    assert_eq!(url.query(), Some("token=s3cret"));
    assert_eq!(redacted(&url), "wss://farm.example.com/ws");
  }

  #[test]
  fn test_send_while_disconnected_is_connection_lost() {
    let ws = WsRealtime::new("wss://farm.example.com/ws", None);
    assert!(matches!(
      ws.send("typing", json!({})),
      Err(SyncError::ConnectionLost(_))
    ));
  }

  #[test]
  fn test_topic_handlers_receive_dispatched_frames() {
    let ws = WsRealtime::new("wss://farm.example.com/ws", None);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = ws.on("alert:created", Box::new(move |v| s.lock().unwrap().push(v.clone())));

    ws.inner.dispatch(r#"{"event":"alert:created","data":{"id":7}}"#);
    ws.inner.dispatch(r#"{"event":"alert:deleted","data":{"id":7}}"#);

    assert_eq!(*seen.lock().unwrap(), vec![json!({"id": 7})]);
  }
}
