//! Queue subsystem: persistent inbox state, response polling, and the
//! per-channel inbox tracker.

pub mod inbox;
pub mod poller;
pub mod store;

pub use inbox::{InboxActivity, InboxChannel, InboxMessage, InboxTracker, format_for_tts};
pub use poller::ReadyNotice;
pub use store::{ItemStatus, QueueMode, QueueStore, QueuedItem};
