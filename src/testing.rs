//! Fakes for the collaborator traits, shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{CacheDeps, EventBus, MemoryStorage, Subscription};
use crate::clock::Clock;
use crate::error::SyncError;
use crate::farm::Severity;
use crate::realtime::{ConnectionHandler, ConnectionState, PushHandler, RealtimeTransport};
use crate::sound::AlertSound;
use crate::transport::{FetchOptions, Transport};

/// A recorded transport call.
#[derive(Debug, Clone)]
pub struct Call {
  pub method: Method,
  pub endpoint: String,
  pub body: Option<Value>,
  pub query: Vec<(String, String)>,
}

/// Scripted REST transport. Unknown endpoints answer `null`.
#[derive(Default)]
pub struct MockTransport {
  responses: Mutex<HashMap<String, std::result::Result<Value, String>>>,
  calls: Mutex<Vec<Call>>,
  delay: Mutex<Option<std::time::Duration>>,
}

impl MockTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn respond(&self, endpoint: &str, value: Value) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(endpoint.to_string(), Ok(value));
  }

  pub fn fail(&self, endpoint: &str, message: &str) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(endpoint.to_string(), Err(message.to_string()));
  }

  pub fn set_delay(&self, delay: std::time::Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_to(&self, endpoint: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|c| c.endpoint == endpoint)
      .count()
  }

  pub fn last_call_to(&self, endpoint: &str) -> Option<Call> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .rev()
      .find(|c| c.endpoint == endpoint)
      .cloned()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn fetch_json(&self, endpoint: &str, options: FetchOptions) -> Result<Value> {
    self.calls.lock().unwrap().push(Call {
      method: options.method.clone(),
      endpoint: endpoint.to_string(),
      body: options.body.clone(),
      query: options.query.clone(),
    });

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    let response = self.responses.lock().unwrap().get(endpoint).cloned();
    match response {
      Some(Ok(value)) => Ok(value),
      Some(Err(message)) => Err(eyre!("{}", message)),
      None => Ok(Value::Null),
    }
  }
}

/// Clock that only moves when told to.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new() -> Arc<Self> {
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
    Arc::new(Self {
      now: Mutex::new(start),
    })
  }

  pub fn advance(&self, by: Duration) {
    *self.now.lock().unwrap() += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *self.now.lock().unwrap() = to;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}

/// In-process push channel. `connect` comes up synchronously.
#[derive(Default)]
pub struct MockRealtime {
  topics: EventBus<String, Value>,
  connection: EventBus<(), ConnectionState>,
  connected: AtomicBool,
  sent: Mutex<Vec<(String, Value)>>,
}

impl MockRealtime {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Deliver a server push.
  pub fn push(&self, topic: &str, payload: Value) -> usize {
    self.topics.emit(&topic.to_string(), &payload)
  }

  pub fn set_connection(&self, state: ConnectionState) {
    self.connected.store(state.is_up(), Ordering::SeqCst);
    self.connection.emit(&(), &state);
  }

  pub fn sent(&self) -> Vec<(String, Value)> {
    self.sent.lock().unwrap().clone()
  }
}

#[async_trait]
impl RealtimeTransport for MockRealtime {
  async fn connect(&self) -> Result<()> {
    self.set_connection(ConnectionState::Connected);
    Ok(())
  }

  fn on(&self, topic: &str, handler: PushHandler) -> Subscription {
    self.topics.subscribe(topic.to_string(), handler)
  }

  fn on_connection(&self, handler: ConnectionHandler) -> Subscription {
    self.connection.subscribe((), handler)
  }

  fn send(&self, topic: &str, payload: Value) -> std::result::Result<(), SyncError> {
    if !self.is_connected() {
      return Err(SyncError::ConnectionLost("mock offline".into()));
    }
    self.sent.lock().unwrap().push((topic.to_string(), payload));
    Ok(())
  }

  fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }
}

/// Sound player that records what it was asked to play.
#[derive(Default)]
pub struct RecordingSound {
  played: Mutex<Vec<Severity>>,
  broken: AtomicBool,
}

impl RecordingSound {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Make every `play` fail.
  pub fn break_player(&self) {
    self.broken.store(true, Ordering::SeqCst);
  }

  pub fn played(&self) -> Vec<Severity> {
    self.played.lock().unwrap().clone()
  }
}

impl AlertSound for RecordingSound {
  fn play(&self, severity: Severity) -> Result<()> {
    if self.broken.load(Ordering::SeqCst) {
      return Err(eyre!("audio device unavailable"));
    }
    self.played.lock().unwrap().push(severity);
    Ok(())
  }
}

/// Cache collaborators backed by fakes and a fresh in-memory store.
pub fn deps(transport: &Arc<MockTransport>) -> CacheDeps {
  deps_with_clock(transport, &ManualClock::new())
}

pub fn deps_with_clock(transport: &Arc<MockTransport>, clock: &Arc<ManualClock>) -> CacheDeps {
  CacheDeps {
    transport: transport.clone(),
    storage: Arc::new(MemoryStorage::new()),
    clock: clock.clone(),
    namespace: "test".into(),
  }
}
