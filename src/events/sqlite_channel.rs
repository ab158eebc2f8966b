//! Shared channel stored in a SQLite file, visible to every process that opens it.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use super::channel::{SharedChannel, CHANNEL_CAPACITY};

/// Schema for the channel tables.
const CHANNEL_SCHEMA: &str = r#"
-- One row per named slot; version increases on every write
CREATE TABLE IF NOT EXISTS channel_slot (
    name TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    version INTEGER NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Recent writes per slot, so watchers see every one of them
CREATE TABLE IF NOT EXISTS channel_log (
    name TEXT NOT NULL,
    version INTEGER NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (name, version)
);
"#;

/// SQLite-based shared channel.
///
/// Writers overwrite a single named row and append the write to a short log.
/// Watchers are fed by a polling task that forwards every logged write newer
/// than the last version it saw, in order, so writes by other processes are
/// observed as well as our own. The log keeps the last [`CHANNEL_CAPACITY`]
/// writes; a watcher that falls further behind skips the oldest.
pub struct SqliteChannel {
  conn: Arc<Mutex<Connection>>,
  slot: String,
  poll_interval: Duration,
  tx: broadcast::Sender<String>,
  poller: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteChannel {
  /// Open (or create) the channel database at `path`.
  pub fn open(path: &Path, slot: &str, poll_interval: Duration) -> Result<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create channel directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open channel database at {}: {}", path.display(), e))?;
    conn
      .busy_timeout(Duration::from_secs(2))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    conn
      .execute_batch(CHANNEL_SCHEMA)
      .map_err(|e| eyre!("Failed to run channel migrations: {}", e))?;

    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
      slot: slot.to_string(),
      poll_interval,
      tx,
      poller: Mutex::new(None),
    })
  }

  fn read_slot(conn: &Mutex<Connection>, slot: &str) -> Result<Option<(String, i64)>> {
    let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .query_row(
        "SELECT payload, version FROM channel_slot WHERE name = ?",
        params![slot],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read channel slot {}: {}", slot, e))
  }

  fn read_since(conn: &Mutex<Connection>, slot: &str, after: i64) -> Result<Vec<(i64, String)>> {
    let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut stmt = conn
      .prepare_cached(
        "SELECT version, payload FROM channel_log
         WHERE name = ?1 AND version > ?2
         ORDER BY version",
      )
      .map_err(|e| eyre!("Failed to prepare channel log query: {}", e))?;
    let rows = stmt
      .query_map(params![slot, after], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to read channel log {}: {}", slot, e))?;
    rows
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read channel log {}: {}", slot, e))
  }

  /// Start the polling task once. Needs a tokio runtime.
  fn ensure_poller(&self) -> Result<()> {
    let mut poller = self
      .poller
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if poller.is_some() {
      return Ok(());
    }

    let handle = tokio::runtime::Handle::try_current()
      .map_err(|e| eyre!("No async runtime to watch channel: {}", e))?;

    let conn = Arc::clone(&self.conn);
    let slot = self.slot.clone();
    let tx = self.tx.clone();
    let poll_interval = self.poll_interval;
    let mut last_version = Self::read_slot(&conn, &slot)?.map(|(_, v)| v).unwrap_or(0);

    *poller = Some(handle.spawn(async move {
      let mut ticker = tokio::time::interval(poll_interval);
      loop {
        ticker.tick().await;
        match Self::read_since(&conn, &slot, last_version) {
          Ok(writes) => {
            for (version, payload) in writes {
              last_version = version;
              let _ = tx.send(payload);
            }
          }
          Err(e) => debug!("channel poll failed: {:#}", e),
        }
      }
    }));

    Ok(())
  }
}

impl SharedChannel for SqliteChannel {
  fn publish(&self, payload: &str) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to start channel transaction: {}", e))?;

    let version: i64 = tx
      .query_row(
        "INSERT INTO channel_slot (name, payload, version, written_at)
         VALUES (?1, ?2, 1, datetime('now'))
         ON CONFLICT(name) DO UPDATE SET
           payload = excluded.payload,
           version = channel_slot.version + 1,
           written_at = excluded.written_at
         RETURNING version",
        params![self.slot, payload],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to write channel slot {}: {}", self.slot, e))?;

    tx.execute(
      "INSERT INTO channel_log (name, version, payload) VALUES (?1, ?2, ?3)",
      params![self.slot, version, payload],
    )
    .map_err(|e| eyre!("Failed to append channel log {}: {}", self.slot, e))?;
    tx.execute(
      "DELETE FROM channel_log WHERE name = ?1 AND version <= ?2",
      params![self.slot, version - CHANNEL_CAPACITY as i64],
    )
    .map_err(|e| eyre!("Failed to trim channel log {}: {}", self.slot, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit channel write {}: {}", self.slot, e))?;
    Ok(())
  }

  fn latest(&self) -> Result<Option<String>> {
    Ok(Self::read_slot(&self.conn, &self.slot)?.map(|(payload, _)| payload))
  }

  fn watch(&self) -> Option<broadcast::Receiver<String>> {
    // Subscribe before the poller's first read so no write slips between them
    let rx = self.tx.subscribe();
    match self.ensure_poller() {
      Ok(()) => Some(rx),
      Err(e) => {
        debug!("channel not watchable: {:#}", e);
        None
      }
    }
  }
}

impl Drop for SqliteChannel {
  fn drop(&mut self) {
    if let Ok(mut poller) = self.poller.lock() {
      if let Some(handle) = poller.take() {
        handle.abort();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const POLL: Duration = Duration::from_millis(10);

  #[test]
  fn test_publish_overwrites_single_slot() {
    let dir = tempfile::tempdir().unwrap();
    let channel = SqliteChannel::open(&dir.path().join("channel.db"), "events", POLL).unwrap();

    assert!(channel.latest().unwrap().is_none());
    channel.publish("one").unwrap();
    channel.publish("two").unwrap();
    assert_eq!(channel.latest().unwrap().as_deref(), Some("two"));

    let conn = channel.conn.lock().unwrap();
    let rows: i64 = conn
      .query_row("SELECT COUNT(*) FROM channel_slot", [], |row| row.get(0))
      .unwrap();
    assert_eq!(rows, 1);
  }

  #[tokio::test]
  async fn test_watch_sees_other_connection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("channel.db");
    let watcher = SqliteChannel::open(&path, "events", POLL).unwrap();
    let writer = SqliteChannel::open(&path, "events", POLL).unwrap();

    let mut rx = watcher.watch().unwrap();
    writer.publish("hello").unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(payload, "hello");
  }

  #[tokio::test]
  async fn test_existing_payload_is_not_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel.db");
    let writer = SqliteChannel::open(&path, "events", POLL).unwrap();
    writer.publish("before").unwrap();

    let watcher = SqliteChannel::open(&path, "events", POLL).unwrap();
    let mut rx = watcher.watch().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    writer.publish("after").unwrap();
    let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(payload, "after");
  }

  #[tokio::test]
  async fn test_back_to_back_writes_all_reach_watcher() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel.db");
    let watcher = SqliteChannel::open(&path, "events", Duration::from_millis(50)).unwrap();
    let writer = SqliteChannel::open(&path, "events", Duration::from_millis(50)).unwrap();

    let mut rx = watcher.watch().unwrap();
    writer.publish("payment-updated").unwrap();
    writer.publish("settings-updated").unwrap();
    writer.publish("room-updated").unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
      let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
      seen.push(payload);
    }
    assert_eq!(seen, vec!["payment-updated", "settings-updated", "room-updated"]);
  }

  #[test]
  fn test_log_is_trimmed_to_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let channel = SqliteChannel::open(&dir.path().join("channel.db"), "events", POLL).unwrap();

    for i in 0..CHANNEL_CAPACITY + 10 {
      channel.publish(&format!("event-{}", i)).unwrap();
    }

    let conn = channel.conn.lock().unwrap();
    let (rows, oldest): (i64, i64) = conn
      .query_row(
        "SELECT COUNT(*), MIN(version) FROM channel_log WHERE name = 'events'",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .unwrap();
    assert_eq!(rows, CHANNEL_CAPACITY as i64);
    assert_eq!(oldest, 11);
  }

  #[test]
  fn test_slots_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel.db");
    let a = SqliteChannel::open(&path, "a", POLL).unwrap();
    let b = SqliteChannel::open(&path, "b", POLL).unwrap();

    a.publish("for-a").unwrap();
    assert!(b.latest().unwrap().is_none());
  }
}
