//! Cross-tab domain event bus.
//!
//! Any part of the host can announce that a mutation happened. Subscribers in
//! the same tab are notified synchronously; other tabs sharing the channel
//! are notified through a single overwritten slot. Delivery across tabs is
//! best effort and at most once: late events are dropped, not replayed.

mod bus;
mod channel;
mod event;
mod sqlite_channel;

pub use bus::{EventBus, Subscription};
pub use channel::{DisabledChannel, MemoryChannel, SharedChannel, CHANNEL_CAPACITY};
pub use event::{EventType, GlobalEvent, DEFAULT_FRESHNESS};
pub use sqlite_channel::SqliteChannel;
