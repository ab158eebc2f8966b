//! Core traits and types for the cache store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde_json::Value;
use std::fmt;

/// Per-key operations the consistency layer needs from a cache store.
///
/// Each call must be atomic for its key. No ordering is promised between
/// calls on different keys.
#[async_trait]
pub trait CacheStore: Send + Sync {
  /// Replace the payload for `key` and mark it fresh.
  async fn set_data(&self, key: &str, data: Value) -> Result<()>;

  /// Current payload for `key`, fresh or stale.
  async fn get_data(&self, key: &str) -> Result<Option<Value>>;

  /// Mark `key` stale so the next read refetches it. Keeps the payload.
  async fn invalidate(&self, key: &str) -> Result<()>;

  /// Drop the entry for `key` entirely.
  async fn remove(&self, key: &str) -> Result<()>;

  /// Cancel any in-flight fetch and return `key` to the never-fetched state.
  async fn reset(&self, key: &str) -> Result<()>;

  /// Abort an in-flight fetch for `key` without touching its payload.
  async fn cancel(&self, key: &str) -> Result<()>;

  /// Fetch `key` now, replacing any in-flight fetch.
  async fn refetch(&self, key: &str) -> Result<Value>;

  /// Drop every entry, modeled or not.
  async fn clear(&self) -> Result<()>;

  /// Whether a read of `key` would trigger a fetch.
  async fn is_stale(&self, key: &str) -> Result<bool>;

  /// Keys that currently have an entry.
  async fn keys(&self) -> Result<Vec<String>>;
}

/// Error returned by a fetch that was cancelled or replaced by a newer one
/// before its result landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCancelled {
  pub key: String,
}

impl FetchCancelled {
  pub fn new(key: impl Into<String>) -> Self {
    Self { key: key.into() }
  }

  /// Whether `err` is (or wraps) a cancellation.
  pub fn is_cancellation(err: &color_eyre::Report) -> bool {
    err.downcast_ref::<FetchCancelled>().is_some()
  }
}

impl fmt::Display for FetchCancelled {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Fetch for {} was cancelled", self.key)
  }
}

impl std::error::Error for FetchCancelled {}

/// Fetch state of a single cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FetchStatus {
  /// Never fetched, or reset
  #[default]
  Idle,
  /// A fetch is in flight
  Fetching,
  /// Last fetch (or direct write) succeeded
  Success,
  /// Last fetch failed
  Error(String),
}

impl FetchStatus {
  pub fn is_fetching(&self) -> bool {
    matches!(self, FetchStatus::Fetching)
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      FetchStatus::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Stale data served because the refetch failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Stale cache served because the network fetch failed
  Offline,
}
