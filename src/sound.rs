//! Audible cue for genuinely new alerts and notifications.
//!
//! The hook only listens to `NewItem` events, which fetches never raise, so a
//! refresh that replaces the list stays silent.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::cache::{CacheEvent, CacheTopic, Subscription};
use crate::clock::Clock;
use crate::farm::{FarmCache, Severity};

/// Audio side-effect provider.
pub trait AlertSound: Send + Sync {
  fn play(&self, severity: Severity) -> Result<()>;
}

/// Rings the terminal bell on stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl AlertSound for TerminalBell {
  fn play(&self, _severity: Severity) -> Result<()> {
    let mut stderr = std::io::stderr();
    stderr
      .write_all(b"\x07")
      .and_then(|_| stderr.flush())
      .map_err(|e| eyre!("Failed to ring bell: {}", e))
  }
}

struct HookInner {
  player: Arc<dyn AlertSound>,
  clock: Arc<dyn Clock>,
  min_interval: Duration,
  last_played: Mutex<Option<DateTime<Utc>>>,
}

/// Debounced observer that plays a cue per new item.
#[derive(Clone)]
pub struct SoundHook {
  inner: Arc<HookInner>,
}

impl SoundHook {
  pub fn new(player: Arc<dyn AlertSound>, clock: Arc<dyn Clock>, min_interval: Duration) -> Self {
    Self {
      inner: Arc::new(HookInner {
        player,
        clock,
        min_interval,
        last_played: Mutex::new(None),
      }),
    }
  }

  /// Play the cue for `severity` unless one played within `min_interval`.
  /// Critical plays twice. Returns whether anything was played.
  pub fn trigger(&self, severity: Severity) -> bool {
    let now = self.inner.clock.now();
    {
      let mut last = self
        .inner
        .last_played
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      if last.is_some_and(|at| now - at < self.inner.min_interval) {
        debug!(%severity, "sound suppressed");
        return false;
      }
      *last = Some(now);
    }

    let repeats = if severity == Severity::Critical { 2 } else { 1 };
    for _ in 0..repeats {
      if let Err(e) = self.inner.player.play(severity) {
        debug!(error = %e, "sound playback failed");
        break;
      }
    }
    true
  }

  /// Subscribe to new alerts and notifications.
  pub fn attach(&self, farm: &FarmCache) -> Subscription {
    let hook = self.clone();
    let alerts = farm.alerts.cache().on_change(CacheTopic::NewItem, move |event| {
      if let CacheEvent::NewItem(alert) = event {
        hook.trigger(alert.severity);
      }
    });

    let hook = self.clone();
    let notifications = farm.notifications.cache().on_change(CacheTopic::NewItem, move |event| {
      if let CacheEvent::NewItem(notification) = event {
        hook.trigger(notification.severity);
      }
    });

    Subscription::join([alerts, notifications])
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::CacheSettings;
  use crate::testing::{deps_with_clock, ManualClock, MockTransport, RecordingSound};
  use serde_json::json;

  fn setup() -> (SoundHook, FarmCache, Arc<RecordingSound>, Arc<ManualClock>, Arc<MockTransport>) {
    let transport = MockTransport::new();
    let clock = ManualClock::new();
    let farm = FarmCache::new(deps_with_clock(&transport, &clock), &CacheSettings::default(), None);
    let sound = RecordingSound::new();
    let hook = SoundHook::new(sound.clone(), clock.clone(), Duration::seconds(2));
    (hook, farm, sound, clock, transport)
  }

  #[tokio::test]
  async fn test_critical_plays_twice_and_bursts_are_debounced() {
    let (hook, farm, sound, clock, _transport) = setup();
    let _sub = hook.attach(&farm);

    farm.alerts.cache().merge_one(&json!({"id": 1, "severity": "critical"}));
    farm.alerts.cache().merge_one(&json!({"id": 2, "severity": "warning"}));
    assert_eq!(sound.played(), vec![Severity::Critical, Severity::Critical]);

    clock.advance(Duration::seconds(3));
    farm.notifications.cache().merge_one(&json!({"id": 9}));
    assert_eq!(sound.played().len(), 3);
    assert_eq!(sound.played()[2], Severity::Info);
  }

  #[tokio::test]
  async fn test_updates_and_fetches_stay_silent() {
    let (hook, farm, sound, clock, transport) = setup();
    let _sub = hook.attach(&farm);

    farm.alerts.cache().merge_one(&json!({"id": 1}));
    clock.advance(Duration::seconds(10));
    farm.alerts.cache().merge_one(&json!({"id": 1, "title": "edited"}));
    transport.respond("/alerts", json!([{"id": 5}, {"id": 6}]));
    farm.alerts.fetch(true).await.unwrap();

    assert_eq!(sound.played().len(), 1);
  }

  #[tokio::test]
  async fn test_player_errors_are_swallowed() {
    let (hook, farm, sound, _clock, _transport) = setup();
    sound.break_player();
    let _sub = hook.attach(&farm);

    farm.alerts.cache().merge_one(&json!({"id": 1, "severity": "critical"}));

    assert!(sound.played().is_empty());
    assert_eq!(farm.alerts.get_all().len(), 1);
  }
}
