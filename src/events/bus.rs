//! Event bus delivering domain events within a tab and across tabs.

use color_eyre::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::channel::SharedChannel;
use super::event::{EventType, GlobalEvent, DEFAULT_FRESHNESS};

type Callback = Arc<dyn Fn(&GlobalEvent) -> Result<()> + Send + Sync>;

struct Listener {
  id: u64,
  callback: Callback,
}

struct BusInner {
  /// Stamped on outgoing events so this bus can recognise its own echoes
  id: Uuid,
  listeners: Mutex<HashMap<EventType, Vec<Listener>>>,
  next_listener: AtomicU64,
  channel: Arc<dyn SharedChannel>,
  freshness: Duration,
  watcher: Mutex<Option<JoinHandle<()>>>,
  disposed: AtomicBool,
}

impl BusInner {
  fn remove(&self, event_type: EventType, id: u64) {
    if let Ok(mut listeners) = self.listeners.lock() {
      if let Some(list) = listeners.get_mut(&event_type) {
        list.retain(|l| l.id != id);
      }
    }
  }

  fn stop_watching(&self) {
    if let Ok(mut watcher) = self.watcher.lock() {
      if let Some(handle) = watcher.take() {
        handle.abort();
      }
    }
  }
}

impl Drop for BusInner {
  fn drop(&mut self) {
    self.stop_watching();
  }
}

/// Publishes "a mutation of kind X happened" to local subscribers and to
/// every other bus sharing the same channel.
///
/// Local subscribers run synchronously inside [`EventBus::emit`], before the
/// event is written to the channel. Events read back from the channel that
/// carry this bus's own id are ignored, so each event is handled once per tab.
/// Events older than the freshness window are dropped.
///
/// Cloning is cheap; clones are the same bus.
#[derive(Clone)]
pub struct EventBus {
  inner: Arc<BusInner>,
}

impl EventBus {
  pub fn new(channel: Arc<dyn SharedChannel>) -> Self {
    Self::with_freshness(channel, DEFAULT_FRESHNESS)
  }

  /// Create a bus that drops cross-tab events older than `freshness`.
  pub fn with_freshness(channel: Arc<dyn SharedChannel>, freshness: Duration) -> Self {
    let bus = Self {
      inner: Arc::new(BusInner {
        id: Uuid::new_v4(),
        listeners: Mutex::new(HashMap::new()),
        next_listener: AtomicU64::new(0),
        channel,
        freshness,
        watcher: Mutex::new(None),
        disposed: AtomicBool::new(false),
      }),
    };
    bus.start_watching();
    bus
  }

  fn start_watching(&self) {
    let Some(mut rx) = self.inner.channel.watch() else {
      debug!("shared channel unavailable, delivering events in this tab only");
      return;
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      debug!("no async runtime, delivering events in this tab only");
      return;
    };

    let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
    let handle = runtime.spawn(async move {
      loop {
        match rx.recv().await {
          Ok(payload) => match weak.upgrade() {
            Some(inner) => {
              EventBus { inner }.receive(&payload);
            }
            None => break,
          },
          Err(RecvError::Lagged(skipped)) => debug!(skipped, "cross-tab listener lagged"),
          Err(RecvError::Closed) => break,
        }
      }
    });

    if let Ok(mut watcher) = self.inner.watcher.lock() {
      *watcher = Some(handle);
    }
  }

  /// Identifier stamped on events emitted by this bus.
  pub fn id(&self) -> Uuid {
    self.inner.id
  }

  /// Register `callback` for `event_type`.
  ///
  /// Callbacks for one type run in registration order. A callback that
  /// returns an error or panics is logged and skipped.
  pub fn subscribe<F>(&self, event_type: EventType, callback: F) -> Subscription
  where
    F: Fn(&GlobalEvent) -> Result<()> + Send + Sync + 'static,
  {
    let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
    match self.inner.listeners.lock() {
      Ok(mut listeners) => listeners.entry(event_type).or_default().push(Listener {
        id,
        callback: Arc::new(callback),
      }),
      Err(e) => warn!("listener registry poisoned, {} not subscribed: {}", event_type, e),
    }

    Subscription {
      bus: Arc::downgrade(&self.inner),
      event_type,
      id,
      active: AtomicBool::new(true),
    }
  }

  /// Number of callbacks registered for `event_type`.
  pub fn listener_count(&self, event_type: EventType) -> usize {
    self
      .inner
      .listeners
      .lock()
      .map(|l| l.get(&event_type).map(Vec::len).unwrap_or(0))
      .unwrap_or(0)
  }

  /// Announce a mutation: notify local subscribers, then other tabs.
  ///
  /// Never fails. If the shared channel cannot be written the event is
  /// delivered in this tab only.
  pub fn emit(&self, event_type: EventType, data: Option<Value>) -> GlobalEvent {
    let event = GlobalEvent::new(event_type, data, Some(self.inner.id));
    debug!(event_type = %event_type, "emit");

    self.dispatch(&event);

    if let Err(e) = event
      .to_json()
      .and_then(|raw| self.inner.channel.publish(&raw))
    {
      debug!("cross-tab publish skipped: {:#}", e);
    }

    event
  }

  /// Handle a raw payload read from the shared channel.
  ///
  /// Returns whether the event was dispatched. Unparseable payloads, this
  /// bus's own events and events outside the freshness window are dropped.
  pub fn receive(&self, raw: &str) -> bool {
    if self.inner.disposed.load(Ordering::Acquire) {
      return false;
    }

    let event = match GlobalEvent::from_json(raw) {
      Ok(event) => event,
      Err(e) => {
        debug!("ignoring channel payload: {:#}", e);
        return false;
      }
    };

    if event.origin() == Some(self.inner.id) {
      return false;
    }

    if !event.is_fresh(self.inner.freshness) {
      debug!(event_type = %event.event_type(), "dropping stale cross-tab event");
      return false;
    }

    self.dispatch(&event);
    true
  }

  fn dispatch(&self, event: &GlobalEvent) {
    // Snapshot so callbacks may subscribe, unsubscribe or emit without deadlocking
    let callbacks: Vec<Callback> = match self.inner.listeners.lock() {
      Ok(listeners) => listeners
        .get(&event.event_type())
        .map(|list| list.iter().map(|l| Arc::clone(&l.callback)).collect())
        .unwrap_or_default(),
      Err(e) => {
        warn!("listener registry poisoned: {}", e);
        return;
      }
    };

    for callback in callbacks {
      match catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(event_type = %event.event_type(), "listener failed: {:#}", e),
        Err(_) => warn!(event_type = %event.event_type(), "listener panicked"),
      }
    }
  }

  pub fn student_updated(&self, data: Option<Value>) -> GlobalEvent {
    self.emit(EventType::StudentUpdated, data)
  }

  pub fn payment_updated(&self, data: Option<Value>) -> GlobalEvent {
    self.emit(EventType::PaymentUpdated, data)
  }

  pub fn application_updated(&self, data: Option<Value>) -> GlobalEvent {
    self.emit(EventType::ApplicationUpdated, data)
  }

  pub fn settings_updated(&self, data: Option<Value>) -> GlobalEvent {
    self.emit(EventType::SettingsUpdated, data)
  }

  pub fn room_updated(&self, data: Option<Value>) -> GlobalEvent {
    self.emit(EventType::RoomUpdated, data)
  }

  /// Stop listening to the shared channel. Local delivery keeps working.
  pub fn dispose(&self) {
    self.inner.disposed.store(true, Ordering::Release);
    self.inner.stop_watching();
  }
}

/// Handle for one subscription. Dropping it does not unsubscribe.
#[must_use = "keep the subscription to unsubscribe later"]
pub struct Subscription {
  bus: Weak<BusInner>,
  event_type: EventType,
  id: u64,
  active: AtomicBool,
}

impl Subscription {
  /// Remove the callback. Calling this more than once is a no-op.
  pub fn unsubscribe(&self) {
    if !self.active.swap(false, Ordering::AcqRel) {
      return;
    }
    if let Some(inner) = self.bus.upgrade() {
      inner.remove(self.event_type, self.id);
    }
  }

  pub fn is_active(&self) -> bool {
    self.active.load(Ordering::Acquire)
  }

  pub fn event_type(&self) -> EventType {
    self.event_type
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::events::{DisabledChannel, MemoryChannel, SqliteChannel};
  use chrono::Utc;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use tokio::sync::mpsc;

  fn local_bus() -> EventBus {
    EventBus::new(Arc::new(DisabledChannel))
  }

  fn recorder() -> (
    Arc<Mutex<Vec<Option<Value>>>>,
    impl Fn(&GlobalEvent) -> Result<()> + Send + Sync + 'static,
  ) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let calls_clone = calls.clone();
    let callback = move |event: &GlobalEvent| {
      calls_clone.lock().unwrap().push(event.data().cloned());
      Ok(())
    };
    (calls, callback)
  }

  async fn next(rx: &mut mpsc::UnboundedReceiver<GlobalEvent>) -> GlobalEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
      .await
      .expect("timed out waiting for cross-tab event")
      .expect("sender dropped")
  }

  #[test]
  fn test_failing_listener_does_not_block_others() {
    let bus = local_bus();
    let (a_calls, a) = recorder();
    let (c_calls, c) = recorder();

    let _a = bus.subscribe(EventType::StudentUpdated, a);
    let _b = bus.subscribe(EventType::StudentUpdated, |_| Err(eyre!("listener B failed")));
    let _c = bus.subscribe(EventType::StudentUpdated, c);

    bus.emit(EventType::StudentUpdated, Some(json!({"x": 1})));

    assert_eq!(*a_calls.lock().unwrap(), vec![Some(json!({"x": 1}))]);
    assert_eq!(*c_calls.lock().unwrap(), vec![Some(json!({"x": 1}))]);
  }

  #[test]
  fn test_panicking_listener_does_not_escape_emit() {
    let bus = local_bus();
    let (a_calls, a) = recorder();
    let (c_calls, c) = recorder();

    let _a = bus.subscribe(EventType::StudentUpdated, a);
    let _b = bus.subscribe(EventType::StudentUpdated, |_| panic!("listener B exploded"));
    let _c = bus.subscribe(EventType::StudentUpdated, c);

    bus.student_updated(Some(json!({"x": 1})));

    assert_eq!(a_calls.lock().unwrap().len(), 1);
    assert_eq!(c_calls.lock().unwrap().len(), 1);
  }

  #[test]
  fn test_listeners_run_in_registration_order() {
    let bus = local_bus();
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut subs = Vec::new();
    for n in 0..3 {
      let order = order.clone();
      subs.push(bus.subscribe(EventType::RoomUpdated, move |_| {
        order.lock().unwrap().push(n);
        Ok(())
      }));
    }

    bus.room_updated(None);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
  }

  #[test]
  fn test_only_matching_type_is_notified() {
    let bus = local_bus();
    let (calls, callback) = recorder();
    let _sub = bus.subscribe(EventType::PaymentUpdated, callback);

    bus.settings_updated(None);
    assert!(calls.lock().unwrap().is_empty());

    bus.payment_updated(None);
    assert_eq!(calls.lock().unwrap().len(), 1);
  }

  #[test]
  fn test_unsubscribe_is_idempotent() {
    let bus = local_bus();
    let (kept_calls, kept) = recorder();
    let (gone_calls, gone) = recorder();
    let keep = bus.subscribe(EventType::StudentUpdated, kept);
    let sub = bus.subscribe(EventType::StudentUpdated, gone);

    sub.unsubscribe();
    sub.unsubscribe();

    assert!(!sub.is_active());
    assert!(keep.is_active());
    assert_eq!(bus.listener_count(EventType::StudentUpdated), 1);

    bus.student_updated(None);
    assert_eq!(kept_calls.lock().unwrap().len(), 1);
    assert!(gone_calls.lock().unwrap().is_empty());
  }

  #[test]
  fn test_unsubscribe_after_bus_dropped() {
    let bus = local_bus();
    let sub = bus.subscribe(EventType::StudentUpdated, |_| Ok(()));
    drop(bus);
    sub.unsubscribe();
    sub.unsubscribe();
  }

  #[test]
  fn test_stale_cross_tab_event_is_dropped() {
    let bus = local_bus();
    let (calls, callback) = recorder();
    let _sub = bus.subscribe(EventType::StudentUpdated, callback);
    let now = Utc::now().timestamp_millis();

    let old = GlobalEvent::at(EventType::StudentUpdated, Some(json!("old")), now - 6000, None);
    assert!(!bus.receive(&old.to_json().unwrap()));
    assert!(calls.lock().unwrap().is_empty());

    let recent = GlobalEvent::at(EventType::StudentUpdated, Some(json!("recent")), now - 100, None);
    assert!(bus.receive(&recent.to_json().unwrap()));
    assert_eq!(*calls.lock().unwrap(), vec![Some(json!("recent"))]);
  }

  #[test]
  fn test_own_echo_is_ignored() {
    let bus = local_bus();
    let (calls, callback) = recorder();
    let _sub = bus.subscribe(EventType::StudentUpdated, callback);

    let event = bus.student_updated(None);
    assert!(!bus.receive(&event.to_json().unwrap()));
    assert_eq!(calls.lock().unwrap().len(), 1);
  }

  #[test]
  fn test_garbage_payload_is_ignored() {
    let bus = local_bus();
    assert!(!bus.receive("not json"));
    assert!(!bus.receive(r#"{"type":"floor-updated","timestamp":1}"#));
  }

  #[test]
  fn test_disabled_channel_still_delivers_locally() {
    let bus = local_bus();
    let (calls, callback) = recorder();
    let _sub = bus.subscribe(EventType::SettingsUpdated, callback);

    let event = bus.settings_updated(Some(json!({"rules": true})));
    assert_eq!(event.origin(), Some(bus.id()));
    assert_eq!(calls.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_emit_writes_latest_event_to_channel() {
    let channel = MemoryChannel::new();
    let bus = EventBus::new(Arc::new(channel.clone()));

    bus.payment_updated(Some(json!({"id": 1})));
    bus.room_updated(Some(json!({"id": 2})));

    let latest = GlobalEvent::from_json(&channel.latest().unwrap().unwrap()).unwrap();
    assert_eq!(latest.event_type(), EventType::RoomUpdated);
    assert_eq!(latest.data(), Some(&json!({"id": 2})));
  }

  #[tokio::test]
  async fn test_cross_tab_delivery_over_memory_channel() {
    let channel = MemoryChannel::new();
    let tab_a = EventBus::new(Arc::new(channel.clone()));
    let tab_b = EventBus::new(Arc::new(channel.clone()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _remote = tab_b.subscribe(EventType::ApplicationUpdated, move |event| {
      let _ = tx.send(event.clone());
      Ok(())
    });
    let (local_calls, local) = recorder();
    let _local = tab_a.subscribe(EventType::ApplicationUpdated, local);

    tab_a.application_updated(Some(json!({"approved": 3})));

    let received = next(&mut rx).await;
    assert_eq!(received.data(), Some(&json!({"approved": 3})));
    assert_eq!(received.origin(), Some(tab_a.id()));

    // The emitting tab handles its own event exactly once
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(local_calls.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_cross_tab_delivery_over_sqlite_channel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel.db");
    let poll = Duration::from_millis(10);
    let tab_a = EventBus::new(Arc::new(SqliteChannel::open(&path, "events", poll).unwrap()));
    let tab_b = EventBus::new(Arc::new(SqliteChannel::open(&path, "events", poll).unwrap()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = tab_b.subscribe(EventType::PaymentUpdated, move |event| {
      let _ = tx.send(event.clone());
      Ok(())
    });

    tab_a.payment_updated(Some(json!({"amount": 500})));

    let received = next(&mut rx).await;
    assert_eq!(received.event_type(), EventType::PaymentUpdated);
    assert_eq!(received.data(), Some(&json!({"amount": 500})));
  }

  #[tokio::test]
  async fn test_quick_succession_over_sqlite_channel_delivers_each_event() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel.db");
    let poll = Duration::from_millis(50);
    let tab_a = EventBus::new(Arc::new(SqliteChannel::open(&path, "events", poll).unwrap()));
    let tab_b = EventBus::new(Arc::new(SqliteChannel::open(&path, "events", poll).unwrap()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subs: Vec<_> = EventType::ALL
      .iter()
      .map(|event_type| {
        let tx = tx.clone();
        tab_b.subscribe(*event_type, move |event| {
          let _ = tx.send(event.clone());
          Ok(())
        })
      })
      .collect();

    tab_a.payment_updated(None);
    tab_a.settings_updated(None);

    assert_eq!(next(&mut rx).await.event_type(), EventType::PaymentUpdated);
    assert_eq!(next(&mut rx).await.event_type(), EventType::SettingsUpdated);
    assert_eq!(subs.len(), EventType::ALL.len());
  }

  #[tokio::test]
  async fn test_disposed_bus_ignores_other_tabs() {
    let channel = MemoryChannel::new();
    let tab_a = EventBus::new(Arc::new(channel.clone()));
    let tab_b = EventBus::new(Arc::new(channel.clone()));
    let (calls, callback) = recorder();
    let _sub = tab_b.subscribe(EventType::RoomUpdated, callback);

    tab_b.dispose();
    tab_a.room_updated(None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(calls.lock().unwrap().is_empty());

    tab_b.room_updated(None);
    assert_eq!(calls.lock().unwrap().len(), 1);
  }
}
