//! Lenient field extraction for raw JSON payloads.
//!
//! The backend has renamed fields over time (`id`, `_id`, `alert_id`, camelCase
//! variants, numbers vs. strings). Readers here look a field up under every
//! known spelling and coerce the value, returning `None` instead of failing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Alias-aware view over a JSON object. Non-objects read as empty.
#[derive(Debug, Clone, Copy)]
pub struct Fields<'a> {
  map: Option<&'a Map<String, Value>>,
}

impl<'a> Fields<'a> {
  pub fn new(value: &'a Value) -> Self {
    Self {
      map: value.as_object(),
    }
  }

  /// First non-null value among `names`.
  pub fn value(&self, names: &[&str]) -> Option<&'a Value> {
    let map = self.map?;
    names
      .iter()
      .filter_map(|name| map.get(*name))
      .find(|v| !v.is_null())
  }

  pub fn string(&self, names: &[&str]) -> Option<String> {
    self.value(names).and_then(coerce_string)
  }

  pub fn i64(&self, names: &[&str]) -> Option<i64> {
    match self.value(names)? {
      Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
      Value::String(s) => s.trim().parse().ok(),
      _ => None,
    }
  }

  pub fn u32(&self, names: &[&str]) -> Option<u32> {
    self.i64(names).map(|n| n.clamp(0, u32::MAX as i64) as u32)
  }

  pub fn f64(&self, names: &[&str]) -> Option<f64> {
    match self.value(names)? {
      Value::Number(n) => n.as_f64(),
      Value::String(s) => s.trim().parse().ok(),
      _ => None,
    }
  }

  pub fn bool(&self, names: &[&str]) -> Option<bool> {
    match self.value(names)? {
      Value::Bool(b) => Some(*b),
      Value::Number(n) => n.as_i64().map(|n| n != 0),
      Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
      },
      _ => None,
    }
  }

  pub fn timestamp(&self, names: &[&str]) -> Option<DateTime<Utc>> {
    self.value(names).and_then(parse_timestamp)
  }

  /// A list of identifiers. Accepts plain strings/numbers or objects carrying
  /// an id field (`[{"user_id": 3}]`).
  pub fn strings(&self, names: &[&str]) -> Option<Vec<String>> {
    let items = self.value(names)?.as_array()?;
    Some(
      items
        .iter()
        .filter_map(|item| match item {
          Value::Object(_) => Fields::new(item).string(&["user_id", "userId", "id", "_id"]),
          other => coerce_string(other),
        })
        .collect(),
    )
  }

  /// A nested object, e.g. `{"pond": {"id": 4}}`.
  pub fn object(&self, names: &[&str]) -> Option<Fields<'a>> {
    self
      .value(names)
      .filter(|v| v.is_object())
      .map(Fields::new)
  }
}

fn coerce_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

/// Parse RFC 3339, SQL-style `YYYY-MM-DD HH:MM:SS`, plain dates, or epoch
/// seconds/milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
  match value {
    Value::String(s) => {
      let s = s.trim();
      if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
      }
      if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
      }
      if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc());
      }
      if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
      }
      s.parse::<i64>().ok().and_then(from_epoch)
    }
    Value::Number(n) => n.as_i64().and_then(from_epoch),
    _ => None,
  }
}

fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
  // Anything past ~5138 AD in seconds is really milliseconds.
  if n.abs() >= 100_000_000_000 {
    Utc.timestamp_millis_opt(n).single()
  } else {
    Utc.timestamp_opt(n, 0).single()
  }
}

/// Keys a push or response envelope carries next to `data`.
const ENVELOPE_KEYS: &[&str] = &[
  "data", "event", "topic", "type", "status", "success", "message", "timestamp", "meta",
];

/// Strip a `{"data": {...}}` envelope if present.
///
/// A record that merely carries `data` metadata is left alone: the outer
/// object only counts as an envelope when it holds nothing but envelope keys,
/// or when it has no identifier of its own while `data` does.
pub fn unwrap_envelope(value: &Value) -> &Value {
  let Some(outer) = value.as_object() else {
    return value;
  };
  let Some((inner, fields)) = outer.get("data").and_then(|d| d.as_object().map(|m| (d, m))) else {
    return value;
  };

  let only_envelope = outer.keys().all(|k| ENVELOPE_KEYS.contains(&k.as_str()));
  if only_envelope || (!has_identifier(outer) && has_identifier(fields)) {
    inner
  } else {
    value
  }
}

/// Whether an object carries a non-null `id`, `_id`, `*_id` or `*Id` field.
fn has_identifier(map: &Map<String, Value>) -> bool {
  map.iter().any(|(key, value)| {
    !value.is_null() && (key == "id" || key.ends_with("_id") || key.ends_with("Id"))
  })
}

/// Pull the record list out of a list response. Accepts a bare array or an
/// object wrapping it under `data`, `items`, `results` or one of `keys`.
pub fn extract_list<'a>(value: &'a Value, keys: &[&str]) -> Vec<&'a Value> {
  if let Some(items) = value.as_array() {
    return items.iter().collect();
  }

  let Some(map) = value.as_object() else {
    return Vec::new();
  };

  for key in keys.iter().copied().chain(["data", "items", "results"]) {
    match map.get(key) {
      Some(Value::Array(items)) => return items.iter().collect(),
      Some(nested @ Value::Object(_)) => {
        let inner = extract_list(nested, keys);
        if !inner.is_empty() {
          return inner;
        }
      }
      _ => {}
    }
  }

  Vec::new()
}
