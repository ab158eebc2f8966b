//! Category-driven cache invalidation.
//!
//! A mutation of some kind (a student was moved, a payment recorded) can make
//! several independently fetched views stale. This module maps each
//! operation category to the resource keys it touches and acts on them:
//! mark stale, evict, reset, then eagerly refetch the critical ones.

mod category;
mod dispatcher;
mod table;

pub use category::OperationCategory;
pub use dispatcher::{InvalidationReport, Invalidator, KeyFailure, Stage};
pub use table::InvalidationTable;
