//! Persistent queue state.
//!
//! A single JSON file holds the voice mode, the asynchronous response inbox
//! items, and the per-channel inbox baseline snapshots. Every mutation saves
//! synchronously before returning; the in-memory state stays authoritative
//! when a write fails.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// Voice response mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Hold on the line with a waiting tone until the response arrives.
    Wait,
    /// Queue responses into the inbox and announce when idle.
    Queue,
    /// Ask per prompt: queue or wait, with a speculative dispatch in flight.
    Ask,
}

impl QueueMode {
    /// Spoken name for confirmations and status summaries.
    #[must_use]
    pub fn spoken(self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::Queue => "inbox",
            Self::Ask => "ask",
        }
    }
}

/// Lifecycle status of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Dispatched, no response observed yet.
    Pending,
    /// Response captured, not yet read to the user.
    Ready,
    /// Response delivered.
    Heard,
}

/// One inbox entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedItem {
    /// Unique item id.
    pub id: String,
    /// Channel name the prompt was dispatched on.
    pub channel: String,
    /// Spoken channel name.
    pub display_name: String,
    /// Gateway session key of the target channel.
    pub session_key: String,
    /// The user's prompt text.
    pub user_message: String,
    /// Short summary of the response (first 100 chars).
    pub summary: String,
    /// Full response text once captured.
    pub response_text: String,
    /// Dispatch time, epoch milliseconds.
    pub timestamp: i64,
    /// Lifecycle status.
    pub status: ItemStatus,
}

/// On-disk shape of the queue state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PersistedState {
    mode: Option<QueueMode>,
    items: Vec<QueuedItem>,
    channel_snapshots: HashMap<String, i64>,
}

/// The queue state store.
///
/// The store is the only writer of its file; callers mutate exclusively
/// through this interface.
pub struct QueueStore {
    path: PathBuf,
    mode: QueueMode,
    items: Vec<QueuedItem>,
    snapshots: HashMap<String, i64>,
}

impl QueueStore {
    /// Load the store from `path`.
    ///
    /// A missing or corrupt file initializes an empty store in mode `ask`.
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let persisted = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<PersistedState>(&raw) {
                Ok(state) => state,
                Err(e) => {
                    warn!("queue state corrupt, reinitializing: {e}");
                    PersistedState::default()
                }
            },
            Err(_) => PersistedState::default(),
        };

        let store = Self {
            path,
            mode: persisted.mode.unwrap_or(QueueMode::Ask),
            items: persisted.items,
            snapshots: persisted.channel_snapshots,
        };
        info!(
            "queue state loaded: mode={}, {} items, {} snapshots",
            store.mode.spoken(),
            store.items.len(),
            store.snapshots.len()
        );
        store
    }

    /// Synchronous save. Logged on failure; never propagated.
    fn save(&self) {
        if let Err(e) = self.try_save() {
            warn!("queue state save failed (state kept in memory): {e}");
        }
    }

    fn try_save(&self) -> Result<()> {
        let persisted = PersistedState {
            mode: Some(self.mode),
            items: self.items.clone(),
            channel_snapshots: self.snapshots.clone(),
        };
        let raw = serde_json::to_string_pretty(&persisted)
            .map_err(|e| crate::error::VoiceError::Queue(format!("serialize: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, raw)?;
        Ok(())
    }

    /// Current voice mode.
    #[must_use]
    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// Change the voice mode.
    pub fn set_mode(&mut self, mode: QueueMode) {
        self.mode = mode;
        self.save();
    }

    /// Append a new item. Insertion order follows non-decreasing timestamps.
    pub fn enqueue(&mut self, item: QueuedItem) {
        self.items.push(item);
        self.save();
    }

    /// Promote a pending item to ready with its captured response.
    ///
    /// Returns `false` when the id is unknown.
    pub fn mark_ready(&mut self, id: &str, summary: &str, response_text: &str) -> bool {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        item.summary = summary.to_owned();
        item.response_text = response_text.to_owned();
        item.status = ItemStatus::Ready;
        self.save();
        true
    }

    /// Mark an item heard.
    pub fn mark_heard(&mut self, id: &str) -> bool {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        item.status = ItemStatus::Heard;
        self.save();
        true
    }

    /// All items (read-only).
    #[must_use]
    pub fn items(&self) -> &[QueuedItem] {
        &self.items
    }

    /// A copy of the pending items.
    #[must_use]
    pub fn pending_items(&self) -> Vec<QueuedItem> {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Pending)
            .cloned()
            .collect()
    }

    /// Item lookup by id.
    #[must_use]
    pub fn item(&self, id: &str) -> Option<&QueuedItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Number of ready items for a session key.
    #[must_use]
    pub fn ready_count_for(&self, session_key: &str) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Ready && i.session_key == session_key)
            .count()
    }

    /// The inbox baseline snapshot for a session key.
    #[must_use]
    pub fn snapshot(&self, session_key: &str) -> Option<i64> {
        self.snapshots.get(session_key).copied()
    }

    /// A copy of all snapshots.
    #[must_use]
    pub fn snapshots(&self) -> HashMap<String, i64> {
        self.snapshots.clone()
    }

    /// Set one inbox baseline snapshot.
    pub fn set_snapshot(&mut self, session_key: &str, baseline_ms: i64) {
        self.snapshots.insert(session_key.to_owned(), baseline_ms);
        self.save();
    }

    /// Replace all inbox baseline snapshots.
    pub fn set_snapshots(&mut self, snapshots: HashMap<String, i64>) {
        self.snapshots = snapshots;
        self.save();
    }
}
