//! Domain event records exchanged between tabs.

use chrono::Utc;
use color_eyre::{eyre::eyre, Report};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Events older than this when read from the shared channel are dropped.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_millis(5000);

/// Domain mutations announced on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
  StudentUpdated,
  PaymentUpdated,
  ApplicationUpdated,
  SettingsUpdated,
  RoomUpdated,
}

impl EventType {
  pub const ALL: &'static [EventType] = &[
    EventType::StudentUpdated,
    EventType::PaymentUpdated,
    EventType::ApplicationUpdated,
    EventType::SettingsUpdated,
    EventType::RoomUpdated,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      EventType::StudentUpdated => "student-updated",
      EventType::PaymentUpdated => "payment-updated",
      EventType::ApplicationUpdated => "application-updated",
      EventType::SettingsUpdated => "settings-updated",
      EventType::RoomUpdated => "room-updated",
    }
  }
}

impl fmt::Display for EventType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EventType {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim().to_lowercase();
    EventType::ALL
      .iter()
      .copied()
      .find(|t| t.as_str() == s)
      .ok_or_else(|| eyre!("Unknown event type: {}", s))
  }
}

/// A "mutation of kind X happened" record.
///
/// Serialized as `{"type", "data", "timestamp", "origin"}` into the shared
/// channel slot. `timestamp` is epoch milliseconds. `origin` identifies the
/// emitting bus and may be missing on records written by other producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalEvent {
  #[serde(rename = "type")]
  event_type: EventType,
  #[serde(default)]
  data: Option<Value>,
  timestamp: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  origin: Option<Uuid>,
}

impl GlobalEvent {
  /// Create an event stamped with the current time.
  pub fn new(event_type: EventType, data: Option<Value>, origin: Option<Uuid>) -> Self {
    Self::at(event_type, data, Utc::now().timestamp_millis(), origin)
  }

  /// Create an event with an explicit timestamp (epoch milliseconds).
  pub fn at(
    event_type: EventType,
    data: Option<Value>,
    timestamp: i64,
    origin: Option<Uuid>,
  ) -> Self {
    Self {
      event_type,
      data,
      timestamp,
      origin,
    }
  }

  pub fn event_type(&self) -> EventType {
    self.event_type
  }

  pub fn data(&self) -> Option<&Value> {
    self.data.as_ref()
  }

  pub fn timestamp(&self) -> i64 {
    self.timestamp
  }

  pub fn origin(&self) -> Option<Uuid> {
    self.origin
  }

  /// Whether the event is younger than `window` at `now_ms`.
  pub fn is_fresh_at(&self, now_ms: i64, window: Duration) -> bool {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_sub(self.timestamp) < window_ms
  }

  pub fn is_fresh(&self, window: Duration) -> bool {
    self.is_fresh_at(Utc::now().timestamp_millis(), window)
  }

  pub fn to_json(&self) -> color_eyre::Result<String> {
    serde_json::to_string(self).map_err(|e| eyre!("Failed to serialize event: {}", e))
  }

  pub fn from_json(raw: &str) -> color_eyre::Result<Self> {
    serde_json::from_str(raw).map_err(|e| eyre!("Failed to parse event: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_wire_format() {
    let event = GlobalEvent::at(EventType::PaymentUpdated, Some(json!({"id": 7})), 1_000, None);
    let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
    assert_eq!(
      value,
      json!({"type": "payment-updated", "data": {"id": 7}, "timestamp": 1000})
    );
  }

  #[test]
  fn test_parse_without_origin_or_data() {
    let event = GlobalEvent::from_json(r#"{"type":"room-updated","timestamp":42}"#).unwrap();
    assert_eq!(event.event_type(), EventType::RoomUpdated);
    assert!(event.data().is_none());
    assert!(event.origin().is_none());
  }

  #[test]
  fn test_unknown_type_rejected() {
    assert!(GlobalEvent::from_json(r#"{"type":"floor-updated","timestamp":42}"#).is_err());
    assert!("floor-updated".parse::<EventType>().is_err());
  }

  #[test]
  fn test_freshness_window() {
    let now = 1_000_000;
    let old = GlobalEvent::at(EventType::StudentUpdated, None, now - 6000, None);
    let recent = GlobalEvent::at(EventType::StudentUpdated, None, now - 100, None);
    let boundary = GlobalEvent::at(EventType::StudentUpdated, None, now - 5000, None);

    assert!(!old.is_fresh_at(now, DEFAULT_FRESHNESS));
    assert!(recent.is_fresh_at(now, DEFAULT_FRESHNESS));
    assert!(!boundary.is_fresh_at(now, DEFAULT_FRESHNESS));
  }
}
