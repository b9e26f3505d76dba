//! Channel routing: active-channel context, per-channel history, ad-hoc
//! channels, and forum-post creation.

pub mod history;
pub mod router;

pub use history::{ChannelHistory, HistoryEntry, Role};
pub use router::{ChannelDef, ChannelRouter, SwitchOutcome};
