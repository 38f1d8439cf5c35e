//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Trait for entities that can be cached.
///
/// The serialized form of an entity must use the canonical field names its
/// [`RawRecord`] accepts, so a cached record can be re-read as a payload when
/// merging.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// The alias-tolerant payload record this entity is normalized from.
  type Raw: RawRecord<Self>;

  /// Unique identifier for this entity within its cache.
  fn cache_key(&self) -> String;

  /// Entity type name, used for logging and storage keys (e.g. "alert").
  fn entity_type() -> &'static str;

  /// Post-merge fixup applied after a shallow merge of a push/fetch payload
  /// onto an existing record. Lets an entity refuse to regress monotonic
  /// fields.
  fn reconcile(_previous: &Self, merged: Self) -> Self {
    merged
  }
}

/// A raw payload record with `Option` fields: only fields present in the
/// payload serialize, which is what makes the shallow merge possible.
pub trait RawRecord<T>: Serialize + Default {
  /// Read a payload, accepting every historical field spelling. Never fails.
  fn from_payload(payload: &Value) -> Self;

  /// Fill in defaults for anything missing.
  fn into_entity(self) -> T;
}

/// Normalize a raw payload into an entity.
pub fn normalize<T: Entity>(payload: &Value) -> T {
  T::Raw::from_payload(payload).into_entity()
}

/// Overlay the fields present in `payload` onto `previous` (new fields win,
/// absent ones are kept), then let the entity reconcile.
pub fn shallow_merge<T: Entity>(previous: &T, payload: &Value) -> T {
  let patch = serde_json::to_value(T::Raw::from_payload(payload));
  let base = serde_json::to_value(previous);

  let merged = match (base, patch) {
    (Ok(Value::Object(mut base)), Ok(Value::Object(patch))) => {
      base.extend(patch);
      normalize::<T>(&Value::Object(base))
    }
    _ => normalize::<T>(payload),
  };

  T::reconcile(previous, merged)
}

/// What a keyed upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
  /// The key was unknown; the item was added.
  Inserted,
  /// An existing entry was replaced in place.
  Updated,
  /// The payload carried no usable identity key.
  Skipped,
}

impl MergeOutcome {
  pub fn is_new(self) -> bool {
    matches!(self, MergeOutcome::Inserted)
  }
}

/// Where newly inserted items go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertOrder {
  /// Append at the end.
  #[default]
  Append,
  /// Prepend (reverse-chronological lists).
  Prepend,
  /// Keep the list sorted with [`CacheConfig::sort_by`](super::CacheConfig).
  Sorted,
}
