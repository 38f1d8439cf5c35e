//! Synchronous in-process publish/subscribe.
//!
//! One bus is composed into every entity cache (and into the sync bridge and
//! the WebSocket transport). Handlers run on the emitting task, in
//! subscription order, after the registry lock has been released, so a
//! handler may freely read the cache or (un)subscribe.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// A subscriber callback.
pub type Handler<P> = Arc<dyn Fn(&P) + Send + Sync>;

struct Registry<K, P> {
  next_id: u64,
  handlers: HashMap<K, Vec<(u64, Handler<P>)>>,
}

/// Topic-keyed event bus.
pub struct EventBus<K, P> {
  registry: Arc<Mutex<Registry<K, P>>>,
}

impl<K, P> EventBus<K, P>
where
  K: Eq + Hash + Clone + Send + 'static,
  P: 'static,
{
  pub fn new() -> Self {
    Self {
      registry: Arc::new(Mutex::new(Registry {
        next_id: 0,
        handlers: HashMap::new(),
      })),
    }
  }

  /// Register `handler` for `topic`. The returned subscription removes only
  /// this handler when disposed.
  pub fn subscribe<F>(&self, topic: K, handler: F) -> Subscription
  where
    F: Fn(&P) + Send + Sync + 'static,
  {
    let id = {
      let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
      let id = registry.next_id;
      registry.next_id += 1;
      registry
        .handlers
        .entry(topic.clone())
        .or_default()
        .push((id, Arc::new(handler)));
      id
    };

    let weak: Weak<Mutex<Registry<K, P>>> = Arc::downgrade(&self.registry);
    Subscription::new(move || {
      let Some(registry) = weak.upgrade() else {
        return;
      };
      let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
      if let Some(list) = registry.handlers.get_mut(&topic) {
        list.retain(|(handler_id, _)| *handler_id != id);
        if list.is_empty() {
          registry.handlers.remove(&topic);
        }
      }
    })
  }

  /// Deliver `payload` to every handler of `topic`. Returns how many ran.
  pub fn emit(&self, topic: &K, payload: &P) -> usize {
    let handlers: Vec<Handler<P>> = {
      let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
      match registry.handlers.get(topic) {
        Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
        None => return 0,
      }
    };

    for handler in &handlers {
      handler(payload);
    }
    handlers.len()
  }

  pub fn subscriber_count(&self, topic: &K) -> usize {
    let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
    registry.handlers.get(topic).map(Vec::len).unwrap_or(0)
  }

  pub fn has_subscribers(&self) -> bool {
    let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
    !registry.handlers.is_empty()
  }
}

impl<K, P> Default for EventBus<K, P>
where
  K: Eq + Hash + Clone + Send + 'static,
  P: 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K, P> Clone for EventBus<K, P> {
  fn clone(&self) -> Self {
    Self {
      registry: Arc::clone(&self.registry),
    }
  }
}

type Disposer = Box<dyn FnOnce() + Send>;

/// Handle returned by every `subscribe`-style call.
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
#[must_use = "keep the subscription to be able to unsubscribe later"]
pub struct Subscription {
  disposers: Mutex<Vec<Disposer>>,
}

impl Subscription {
  pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
    Self {
      disposers: Mutex::new(vec![Box::new(dispose)]),
    }
  }

  /// A subscription with nothing to dispose.
  pub fn noop() -> Self {
    Self {
      disposers: Mutex::new(Vec::new()),
    }
  }

  /// Combine several subscriptions into one handle.
  pub fn join(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
    let disposers = subscriptions
      .into_iter()
      .flat_map(|s| s.disposers.into_inner().unwrap_or_else(PoisonError::into_inner))
      .collect();
    Self {
      disposers: Mutex::new(disposers),
    }
  }

  /// Remove the handler(s). Idempotent.
  pub fn unsubscribe(&self) {
    let disposers: Vec<Disposer> = {
      let mut guard = self.disposers.lock().unwrap_or_else(PoisonError::into_inner);
      std::mem::take(&mut *guard)
    };
    for dispose in disposers {
      dispose();
    }
  }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let pending = self
      .disposers
      .lock()
      .map(|d| d.len())
      .unwrap_or_default();
    f.debug_struct("Subscription")
      .field("pending", &pending)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn test_emit_reaches_topic_subscribers_only() {
    let bus: EventBus<&'static str, u32> = EventBus::new();
    let seen = Arc::new(AtomicUsize::new(0));

    let s = Arc::clone(&seen);
    let _sub = bus.subscribe("changed", move |v| {
      s.fetch_add(*v as usize, Ordering::SeqCst);
    });

    assert_eq!(bus.emit(&"changed", &3), 1);
    assert_eq!(bus.emit(&"other", &100), 0);
    assert_eq!(seen.load(Ordering::SeqCst), 3);
  }

  #[test]
  fn test_unsubscribe_removes_only_that_handler() {
    let bus: EventBus<&'static str, ()> = EventBus::new();
    let a = Arc::new(AtomicUsize::new(0));
    let b = Arc::new(AtomicUsize::new(0));

    let a2 = Arc::clone(&a);
    let sub_a = bus.subscribe("t", move |_| {
      a2.fetch_add(1, Ordering::SeqCst);
    });
    let b2 = Arc::clone(&b);
    let _sub_b = bus.subscribe("t", move |_| {
      b2.fetch_add(1, Ordering::SeqCst);
    });

    bus.emit(&"t", &());
    sub_a.unsubscribe();
    sub_a.unsubscribe();
    bus.emit(&"t", &());

    assert_eq!(a.load(Ordering::SeqCst), 1);
    assert_eq!(b.load(Ordering::SeqCst), 2);
    assert_eq!(bus.subscriber_count(&"t"), 1);
  }

  #[test]
  fn test_handler_may_subscribe_during_emit() {
    let bus: EventBus<&'static str, ()> = EventBus::new();
    let inner_bus = bus.clone();
    let _sub = bus.subscribe("t", move |_| {
      let _nested = inner_bus.subscribe("nested", |_| {});
    });

    bus.emit(&"t", &());
    assert_eq!(bus.subscriber_count(&"nested"), 1);
  }

  #[test]
  fn test_joined_subscription_disposes_all() {
    let bus: EventBus<u8, ()> = EventBus::new();
    let joined = Subscription::join(vec![
      bus.subscribe(1, |_| {}),
      bus.subscribe(2, |_| {}),
    ]);
    assert!(bus.has_subscribers());

    joined.unsubscribe();
    assert!(!bus.has_subscribers());
  }
}
