//! Cross-view cache consistency for the JoyBor dormitory admin.
//!
//! After a mutation (a student moved to another room, a payment recorded, an
//! application approved) several independently fetched views can be stale at
//! once. [`invalidation::Invalidator`] knows which ones and refreshes them;
//! [`events::EventBus`] tells every other open instance to do the same.

pub mod app;
pub mod cache;
pub mod config;
pub mod events;
pub mod invalidation;
pub mod notify;
pub mod resource;
