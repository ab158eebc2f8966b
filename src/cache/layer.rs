//! In-memory query cache that orchestrates entries with network fetching.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tracing::debug;

use super::fetcher::{FnFetcher, Fetcher};
use super::traits::{CacheResult, CacheStore, FetchCancelled, FetchStatus};

#[derive(Default)]
struct Entry {
  data: Option<Value>,
  updated_at: Option<DateTime<Utc>>,
  /// Explicitly marked stale by an invalidation
  invalidated: bool,
  status: FetchStatus,
  /// Bumped whenever a fetch is started or cancelled; results from older generations are dropped
  generation: u64,
  in_flight: Option<AbortHandle>,
}

impl Entry {
  fn abort_in_flight(&mut self) {
    if let Some(handle) = self.in_flight.take() {
      handle.abort();
    }
    self.generation += 1;
  }
}

/// Cache of JSON payloads keyed by resource name.
///
/// Fetches run as spawned tasks so that `cancel`, `reset` and `remove` can
/// abort them rather than merely ignore their results.
pub struct QueryCache {
  entries: Arc<Mutex<HashMap<String, Entry>>>,
  fetcher: Arc<dyn Fetcher>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl QueryCache {
  pub fn new(fetcher: impl Fetcher) -> Self {
    Self {
      entries: Arc::new(Mutex::new(HashMap::new())),
      fetcher: Arc::new(fetcher),
      stale_time: Duration::minutes(5),
    }
  }

  /// Create a cache whose fetches are served by a closure.
  pub fn from_fn<F, Fut>(f: F) -> Self
  where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    Self::new(FnFetcher::new(f))
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn entry_is_stale(&self, entry: &Entry) -> bool {
    if entry.invalidated || entry.data.is_none() {
      return true;
    }
    entry
      .updated_at
      .map(|t| Utc::now() - t > self.stale_time)
      .unwrap_or(true)
  }

  /// Read `key` with a cache-first strategy.
  ///
  /// 1. Fresh cached data is returned as is
  /// 2. Stale data triggers a refetch; if that fails the stale data is served
  /// 3. Missing data must come from the network
  pub async fn fetch(&self, key: &str) -> Result<CacheResult<Value>> {
    let cached = {
      let entries = self.lock()?;
      entries.get(key).and_then(|entry| {
        let stale = self.entry_is_stale(entry);
        entry
          .data
          .clone()
          .map(|data| (data, entry.updated_at.unwrap_or_else(Utc::now), stale))
      })
    };

    match cached {
      Some((data, cached_at, false)) => Ok(CacheResult::from_cache(data, cached_at)),
      Some((data, cached_at, true)) => match self.refetch(key).await {
        Ok(fresh) => Ok(CacheResult::from_network(fresh)),
        Err(e) => {
          debug!(key, error = %e, "serving stale data after failed refetch");
          Ok(CacheResult::offline(data, cached_at))
        }
      },
      None => Ok(CacheResult::from_network(self.refetch(key).await?)),
    }
  }

  /// Fetch status of `key`. Unknown keys are idle.
  pub fn status(&self, key: &str) -> Result<FetchStatus> {
    Ok(
      self
        .lock()?
        .get(key)
        .map(|e| e.status.clone())
        .unwrap_or_default(),
    )
  }

  /// Keys that currently have an entry, sorted.
  pub fn keys(&self) -> Result<Vec<String>> {
    let mut keys: Vec<String> = self.lock()?.keys().cloned().collect();
    keys.sort();
    Ok(keys)
  }
}

impl Clone for QueryCache {
  fn clone(&self) -> Self {
    Self {
      entries: Arc::clone(&self.entries),
      fetcher: Arc::clone(&self.fetcher),
      stale_time: self.stale_time,
    }
  }
}

#[async_trait]
impl CacheStore for QueryCache {
  async fn set_data(&self, key: &str, data: Value) -> Result<()> {
    let mut entries = self.lock()?;
    let entry = entries.entry(key.to_string()).or_default();
    entry.data = Some(data);
    entry.updated_at = Some(Utc::now());
    entry.invalidated = false;
    if !entry.status.is_fetching() {
      entry.status = FetchStatus::Success;
    }
    Ok(())
  }

  async fn get_data(&self, key: &str) -> Result<Option<Value>> {
    Ok(self.lock()?.get(key).and_then(|e| e.data.clone()))
  }

  async fn invalidate(&self, key: &str) -> Result<()> {
    if let Some(entry) = self.lock()?.get_mut(key) {
      entry.invalidated = true;
    }
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<()> {
    if let Some(mut entry) = self.lock()?.remove(key) {
      entry.abort_in_flight();
    }
    debug!(key, "evicted");
    Ok(())
  }

  async fn reset(&self, key: &str) -> Result<()> {
    if let Some(entry) = self.lock()?.get_mut(key) {
      entry.abort_in_flight();
      entry.data = None;
      entry.updated_at = None;
      entry.invalidated = false;
      entry.status = FetchStatus::Idle;
    }
    Ok(())
  }

  async fn cancel(&self, key: &str) -> Result<()> {
    if let Some(entry) = self.lock()?.get_mut(key) {
      if entry.in_flight.is_some() {
        debug!(key, "cancelling in-flight fetch");
        entry.abort_in_flight();
        entry.status = if entry.data.is_some() {
          FetchStatus::Success
        } else {
          FetchStatus::Idle
        };
      }
    }
    Ok(())
  }

  async fn refetch(&self, key: &str) -> Result<Value> {
    let (task, generation) = {
      let mut entries = self.lock()?;
      let entry = entries.entry(key.to_string()).or_default();
      entry.abort_in_flight();
      entry.status = FetchStatus::Fetching;
      let generation = entry.generation;

      // The task writes its own result back, so it lands even if this caller is dropped
      let fetcher = Arc::clone(&self.fetcher);
      let shared = Arc::clone(&self.entries);
      let owned_key = key.to_string();
      let task = tokio::spawn(async move {
        let outcome = fetcher.fetch(&owned_key).await;
        store_result(&shared, &owned_key, generation, outcome)
      });
      entry.in_flight = Some(task.abort_handle());
      (task, generation)
    };

    match task.await {
      Ok(result) => result,
      Err(join_err) if join_err.is_cancelled() => Err(FetchCancelled::new(key).into()),
      Err(join_err) => {
        if let Some(entry) = self.lock()?.get_mut(key) {
          if entry.generation == generation {
            entry.in_flight = None;
            entry.status = FetchStatus::Error(join_err.to_string());
          }
        }
        Err(eyre!("Fetch task for {} failed: {}", key, join_err))
      }
    }
  }

  async fn clear(&self) -> Result<()> {
    let mut entries = self.lock()?;
    for entry in entries.values_mut() {
      entry.abort_in_flight();
    }
    entries.clear();
    debug!("cache cleared");
    Ok(())
  }

  async fn is_stale(&self, key: &str) -> Result<bool> {
    Ok(
      self
        .lock()?
        .get(key)
        .map(|e| self.entry_is_stale(e))
        .unwrap_or(true),
    )
  }

  async fn keys(&self) -> Result<Vec<String>> {
    QueryCache::keys(self)
  }
}

/// Write a finished fetch into its entry, unless the entry has moved on to a
/// newer generation in the meantime.
fn store_result(
  entries: &Mutex<HashMap<String, Entry>>,
  key: &str,
  generation: u64,
  outcome: Result<Value>,
) -> Result<Value> {
  let mut entries = entries.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
  let entry = match entries.get_mut(key) {
    Some(entry) if entry.generation == generation => entry,
    _ => return Err(FetchCancelled::new(key).into()),
  };
  entry.in_flight = None;

  match outcome {
    Ok(data) => {
      entry.data = Some(data.clone());
      entry.updated_at = Some(Utc::now());
      entry.invalidated = false;
      entry.status = FetchStatus::Success;
      debug!(key, "refetched");
      Ok(data)
    }
    Err(e) => {
      entry.status = FetchStatus::Error(e.to_string());
      Err(e.wrap_err(format!("Failed to fetch {}", key)))
    }
  }
}
