//! Client-side cache of backend views.
//!
//! This module provides the store the consistency layer operates on:
//! - Caches JSON payloads by resource key
//! - Tracks staleness by explicit invalidation and by age
//! - Runs fetches as abortable tasks so cancelled requests never repopulate an entry
//! - Serves stale data when the network is unavailable

mod fetcher;
mod layer;
mod traits;

pub use fetcher::{Fetcher, FnFetcher, RestFetcher};
pub use layer::QueryCache;
pub use traits::{CacheResult, CacheSource, CacheStore, FetchCancelled, FetchStatus};
