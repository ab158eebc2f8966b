//! Invalidation dispatcher, emergency clear and optimistic updates.

use color_eyre::Result;
use futures::future::join_all;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::category::OperationCategory;
use super::table::InvalidationTable;
use crate::cache::{CacheStore, FetchCancelled};
use crate::notify::{ErrorReporter, Notice, TracingReporter};
use crate::resource::{Resource, CRITICAL};

/// Stage of an invalidation at which a key failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  MarkStale,
  Evict,
  Reset,
  Clear,
  Refetch,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Stage::MarkStale => "mark stale",
      Stage::Evict => "evict",
      Stage::Reset => "reset",
      Stage::Clear => "clear",
      Stage::Refetch => "refetch",
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
  pub key: String,
  pub stage: Stage,
  pub error: String,
}

/// Outcome of an `invalidate` or `clear_all` call.
#[derive(Debug, Clone, Default)]
pub struct InvalidationReport {
  /// `None` for a full clear
  pub category: Option<OperationCategory>,
  /// Keys that were marked stale, evicted and reset
  pub keys: Vec<Resource>,
  /// Critical keys that were refetched successfully
  pub refetched: Vec<Resource>,
  pub failures: Vec<KeyFailure>,
}

impl InvalidationReport {
  pub fn is_clean(&self) -> bool {
    self.failures.is_empty()
  }

  fn fail(&mut self, key: impl Into<String>, stage: Stage, error: &color_eyre::Report) {
    self.failures.push(KeyFailure {
      key: key.into(),
      stage,
      error: format!("{:#}", error),
    });
  }
}

/// Keeps independently fetched views consistent after a mutation.
///
/// Cheap to clone; clones share the store and the reporter.
#[derive(Clone)]
pub struct Invalidator {
  store: Arc<dyn CacheStore>,
  table: InvalidationTable,
  reporter: Arc<dyn ErrorReporter>,
}

impl Invalidator {
  /// Create a dispatcher over `store`. Fails if the category table is inconsistent.
  pub fn new(store: Arc<dyn CacheStore>) -> Result<Self> {
    let table = InvalidationTable::new();
    table.validate()?;
    Ok(Self {
      store,
      table,
      reporter: Arc::new(TracingReporter),
    })
  }

  /// Route refetch failures to `reporter` instead of the log.
  pub fn with_reporter(mut self, reporter: impl ErrorReporter + 'static) -> Self {
    self.reporter = Arc::new(reporter);
    self
  }

  pub fn table(&self) -> &InvalidationTable {
    &self.table
  }

  pub fn store(&self) -> &Arc<dyn CacheStore> {
    &self.store
  }

  /// Invalidate every resource `category` may have made stale.
  ///
  /// Marks all keys stale, evicts them, and resets their fetch state, each
  /// step concurrently across keys. Once all three steps are done the
  /// critical keys among them are refetched concurrently. A failing key is
  /// recorded and reported without affecting the others.
  pub async fn invalidate(&self, category: OperationCategory) -> InvalidationReport {
    let keys = self.table.keys(category).to_vec();
    info!(category = %category, keys = keys.len(), "invalidating");

    let mut report = InvalidationReport {
      category: Some(category),
      keys: keys.clone(),
      ..Default::default()
    };

    for stage in [Stage::MarkStale, Stage::Evict, Stage::Reset] {
      let results = join_all(keys.iter().map(|r| self.apply_bulk(stage, r.as_str()))).await;
      for (resource, result) in keys.iter().zip(results) {
        if let Err(e) = result {
          warn!(key = %resource, stage = %stage, "cache step failed: {:#}", e);
          self.reporter.report(Notice::warning(
            format!("Could not {} {}", stage, resource),
            format!("{:#}", e),
          ));
          report.fail(resource.as_str(), stage, &e);
        }
      }
    }

    let critical = self.table.critical_keys(category);
    self.refetch_critical(&critical, &mut report).await;
    report
  }

  /// Like [`Invalidator::invalidate`], for a category given by name.
  ///
  /// Unknown names are a caller bug: nothing is invalidated and a warning is logged.
  pub async fn invalidate_named(&self, name: &str) -> Option<InvalidationReport> {
    match name.parse::<OperationCategory>() {
      Ok(category) => Some(self.invalidate(category).await),
      Err(e) => {
        warn!("{}; nothing invalidated", e);
        None
      }
    }
  }

  /// Drop every cached entry, then warm the critical views.
  pub async fn clear_all(&self) -> InvalidationReport {
    info!("clearing entire cache");
    let mut report = InvalidationReport::default();

    match self.store.keys().await {
      Ok(keys) => debug!(entries = keys.len(), "dropping cached entries"),
      Err(e) => debug!("could not list cached entries: {:#}", e),
    }
    if let Err(e) = self.store.clear().await {
      warn!("cache clear failed: {:#}", e);
      report.fail("*", Stage::Clear, &e);
    }

    self.refetch_critical(CRITICAL, &mut report).await;
    report
  }

  /// Apply `updater` to the cached value of `key` while `operation` runs.
  ///
  /// Any in-flight fetch for `key` is cancelled first. When `operation`
  /// succeeds the key is marked stale so the server's version replaces the
  /// speculative one. When it fails the previous value (or its absence) is
  /// restored and the operation's error is returned unchanged.
  pub async fn optimistic_update<U, F, Fut, T>(
    &self,
    key: &str,
    updater: U,
    operation: F,
  ) -> Result<T>
  where
    U: FnOnce(&Value) -> Value,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.store.cancel(key).await?;

    let snapshot = self.store.get_data(key).await?;
    if let Some(current) = &snapshot {
      self.store.set_data(key, updater(current)).await?;
    }

    match operation().await {
      Ok(value) => {
        if let Err(e) = self.store.invalidate(key).await {
          warn!(key, "failed to mark optimistic value stale: {:#}", e);
        }
        Ok(value)
      }
      Err(e) => {
        debug!(key, "rolling back optimistic update");
        let rollback = match snapshot {
          Some(previous) => self.store.set_data(key, previous).await,
          None => self.store.remove(key).await,
        };
        if let Err(rollback_err) = rollback {
          warn!(key, "rollback failed: {:#}", rollback_err);
        }
        Err(e)
      }
    }
  }

  async fn apply_bulk(&self, stage: Stage, key: &str) -> Result<()> {
    match stage {
      Stage::MarkStale => self.store.invalidate(key).await,
      Stage::Evict => self.store.remove(key).await,
      Stage::Reset => self.store.reset(key).await,
      Stage::Clear | Stage::Refetch => Ok(()),
    }
  }

  async fn refetch_critical(&self, keys: &[Resource], report: &mut InvalidationReport) {
    let results = join_all(keys.iter().map(|r| self.store.refetch(r.as_str()))).await;
    for (resource, result) in keys.iter().zip(results) {
      match result {
        Ok(_) => report.refetched.push(*resource),
        // A newer fetch for the same key replaced this one and is still running
        Err(e) if FetchCancelled::is_cancellation(&e) => {
          debug!(key = %resource, "refetch superseded");
        }
        Err(e) => {
          self.reporter.report(Notice::error(
            format!("Failed to refresh {}", resource),
            format!("{:#}", e),
          ));
          report.fail(resource.as_str(), Stage::Refetch, &e);
        }
      }
    }
  }
}
