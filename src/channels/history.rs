//! Per-channel conversation history.
//!
//! Each channel keeps a bounded list of role-attributed turns used to build
//! completion context. Histories are seeded once from the gateway (or the
//! transport as a fallback) and then maintained locally as turns happen.

use std::collections::VecDeque;

/// Maximum turns retained per channel.
pub const HISTORY_CAP: usize = 50;

/// Role of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The voice user (or a mirrored chat user).
    User,
    /// The assistant.
    Assistant,
    /// System / topic prompt material.
    System,
}

impl Role {
    /// Completion-API role string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// One history turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Turn role.
    pub role: Role,
    /// Flattened text content.
    pub content: String,
}

/// Bounded per-channel history.
#[derive(Debug, Clone, Default)]
pub struct ChannelHistory {
    entries: VecDeque<HistoryEntry>,
}

impl ChannelHistory {
    /// An empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn, evicting the oldest past the cap.
    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        if self.entries.len() >= HISTORY_CAP {
            let _ = self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry { role, content: content.into() });
    }

    /// All turns, oldest first.
    #[must_use]
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// The most recent turn with the given role.
    #[must_use]
    pub fn last_with_role(&self, role: Role) -> Option<&HistoryEntry> {
        self.entries.iter().rev().find(|e| e.role == role)
    }

    /// The most recent non-system turn.
    #[must_use]
    pub fn last_message(&self) -> Option<&HistoryEntry> {
        self.entries.iter().rev().find(|e| e.role != Role::System)
    }

    /// Number of turns held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_order() {
        let mut h = ChannelHistory::new();
        h.push(Role::User, "q");
        h.push(Role::Assistant, "a");
        let got: Vec<&str> = h.entries().map(|e| e.content.as_str()).collect();
        assert_eq!(got, vec!["q", "a"]);
    }

    #[test]
    fn cap_evicts_oldest() {
        let mut h = ChannelHistory::new();
        for i in 0..(HISTORY_CAP + 5) {
            h.push(Role::User, format!("m{i}"));
        }
        assert_eq!(h.len(), HISTORY_CAP);
        assert_eq!(h.entries().next().map(|e| e.content.as_str()), Some("m5"));
    }

    #[test]
    fn last_with_role_scans_backwards() {
        let mut h = ChannelHistory::new();
        h.push(Role::User, "q1");
        h.push(Role::Assistant, "a1");
        h.push(Role::User, "q2");
        assert_eq!(h.last_with_role(Role::Assistant).map(|e| e.content.as_str()), Some("a1"));
        assert_eq!(h.last_with_role(Role::User).map(|e| e.content.as_str()), Some("q2"));
    }

    #[test]
    fn last_message_skips_system() {
        let mut h = ChannelHistory::new();
        h.push(Role::User, "q");
        h.push(Role::System, "topic");
        assert_eq!(h.last_message().map(|e| e.content.as_str()), Some("q"));
        assert!(ChannelHistory::new().last_message().is_none());
    }
}
