//! Shared single-slot broadcast channels between tabs.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Broadcast channel capacity.
/// Lagging receivers skip old payloads; only the latest one matters.
pub const CHANNEL_CAPACITY: usize = 64;

/// A single shared slot every tab can overwrite and observe.
///
/// Only the most recent payload is retained. Delivery is best effort.
pub trait SharedChannel: Send + Sync {
  /// Overwrite the slot with `payload` and notify watchers.
  fn publish(&self, payload: &str) -> Result<()>;

  /// Current content of the slot.
  fn latest(&self) -> Result<Option<String>>;

  /// Stream of payloads written after this call, or `None` if the channel
  /// cannot be observed.
  fn watch(&self) -> Option<broadcast::Receiver<String>>;
}

/// In-process channel. Clones share the slot, so buses built on clones
/// see each other like separate tabs of one browser.
#[derive(Clone)]
pub struct MemoryChannel {
  slot: Arc<Mutex<Option<String>>>,
  tx: broadcast::Sender<String>,
}

impl MemoryChannel {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    Self {
      slot: Arc::new(Mutex::new(None)),
      tx,
    }
  }
}

impl Default for MemoryChannel {
  fn default() -> Self {
    Self::new()
  }
}

impl SharedChannel for MemoryChannel {
  fn publish(&self, payload: &str) -> Result<()> {
    *self
      .slot
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))? = Some(payload.to_string());
    // No watchers is fine
    let _ = self.tx.send(payload.to_string());
    Ok(())
  }

  fn latest(&self) -> Result<Option<String>> {
    Ok(
      self
        .slot
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?
        .clone(),
    )
  }

  fn watch(&self) -> Option<broadcast::Receiver<String>> {
    Some(self.tx.subscribe())
  }
}

/// Channel used when shared storage is unavailable. Events stay in their tab.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledChannel;

impl SharedChannel for DisabledChannel {
  fn publish(&self, _payload: &str) -> Result<()> {
    Err(eyre!("Shared channel is disabled"))
  }

  fn latest(&self) -> Result<Option<String>> {
    Ok(None)
  }

  fn watch(&self) -> Option<broadcast::Receiver<String>> {
    None
  }
}
