//! Inbox tracking: per-channel activity since a baseline snapshot.
//!
//! Each channel carries a baseline timestamp in the queue state; everything
//! at or before the baseline is considered already seen. New activity is
//! exclusively `discord-user` traffic newer than the baseline, so mirrored
//! voice turns never re-surface in the inbox.

use crate::error::Result;
use crate::gateway::ChatGateway;
use crate::queue::store::QueueStore;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Baselines below this are legacy second-resolution values and get migrated.
const LEGACY_BASELINE_CUTOFF: i64 = 1_000_000_000_000;

/// Messages fetched per channel when scanning.
const SCAN_LIMIT: usize = 80;

/// Speaker attribution for spoken read-outs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    /// The voice user themself (mirrored `voice-user` traffic).
    You,
    /// A chat-side user.
    User,
    /// The assistant.
    Assistant,
}

impl Speaker {
    /// Spoken label.
    #[must_use]
    pub fn spoken(self) -> &'static str {
        match self {
            Self::You => "You",
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

/// One message surfaced by an inbox scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxMessage {
    /// Speaker attribution.
    pub speaker: Speaker,
    /// Flattened text (first text block for structured content).
    pub text: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

/// New activity in one channel since its baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxActivity {
    /// Channel name.
    pub channel: String,
    /// Spoken channel name.
    pub display_name: String,
    /// Gateway session key.
    pub session_key: String,
    /// Count of new `discord-user` messages.
    pub new_count: usize,
    /// Count of queued items ready but unheard on this channel.
    pub ready_count: usize,
    /// The new messages, oldest first.
    pub new_messages: Vec<InboxMessage>,
    /// Earliest relevant timestamp; activities are visited oldest first.
    pub earliest_timestamp: i64,
}

/// A channel reference handed to the tracker by the orchestrator.
#[derive(Debug, Clone)]
pub struct InboxChannel {
    /// Channel name.
    pub name: String,
    /// Spoken channel name.
    pub display_name: String,
    /// Gateway session key.
    pub session_key: String,
}

/// Tracks inbox baselines and computes per-channel activity.
pub struct InboxTracker {
    gateway: Arc<dyn ChatGateway>,
    queue: Arc<Mutex<QueueStore>>,
}

impl InboxTracker {
    /// Create a tracker over the shared queue state.
    pub fn new(gateway: Arc<dyn ChatGateway>, queue: Arc<Mutex<QueueStore>>) -> Self {
        Self { gateway, queue }
    }

    /// Initialize baselines to "now" for every channel.
    ///
    /// A zero baseline is never written: anything already in the channel is
    /// considered seen at activation.
    pub fn activate(&self, channels: &[InboxChannel]) {
        let now = now_ms();
        let mut queue = lock(&self.queue);
        for ch in channels {
            queue.set_snapshot(&ch.session_key, now);
        }
        info!("inbox activated for {} channels", channels.len());
    }

    /// Scan all channels for new activity.
    ///
    /// The baseline is re-read after the history await and the maximum of the
    /// two reads wins, so a snapshot advanced mid-scan is never rolled back.
    ///
    /// # Errors
    ///
    /// Individual channel fetch failures are logged and skipped; the scan
    /// itself only fails on internal errors.
    pub async fn check_inbox(&self, channels: &[InboxChannel]) -> Result<Vec<InboxActivity>> {
        let mut activities = Vec::new();

        for ch in channels {
            let before = lock(&self.queue).snapshot(&ch.session_key);

            let messages = match self.gateway.history(&ch.session_key, SCAN_LIMIT).await {
                Ok(m) => m,
                Err(e) => {
                    debug!("inbox scan skipped {}: {e}", ch.name);
                    continue;
                }
            };

            let latest_ts = messages.iter().filter_map(|m| m.timestamp).max();

            // Freshness: the snapshot may have advanced while we awaited.
            let after = lock(&self.queue).snapshot(&ch.session_key);
            let mut baseline = match (before, after) {
                (Some(a), Some(b)) => a.max(b),
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => {
                    // Unactivated channel: baseline from now on.
                    let now = now_ms();
                    lock(&self.queue).set_snapshot(&ch.session_key, now);
                    now
                }
            };

            // Legacy second-resolution baselines migrate to the newest
            // message timestamp.
            if baseline < LEGACY_BASELINE_CUTOFF {
                baseline = latest_ts.unwrap_or_else(now_ms);
                lock(&self.queue).set_snapshot(&ch.session_key, baseline);
            }

            let new_messages: Vec<InboxMessage> = messages
                .iter()
                .filter(|m| {
                    m.label.as_deref() == Some("discord-user")
                        && m.timestamp.is_some_and(|ts| ts > baseline)
                })
                .map(|m| InboxMessage {
                    speaker: speaker_for(&m.role, m.label.as_deref()),
                    text: m
                        .content
                        .first_text()
                        .unwrap_or_default()
                        .to_owned(),
                    timestamp: m.timestamp.unwrap_or_default(),
                })
                .collect();

            let ready_count = lock(&self.queue).ready_count_for(&ch.session_key);

            if new_messages.is_empty() {
                // Auto-advance past internal voice traffic so the next scan
                // does not rescan it.
                if let Some(latest) = latest_ts
                    && latest > baseline
                {
                    lock(&self.queue).set_snapshot(&ch.session_key, latest);
                }
                if ready_count == 0 {
                    continue;
                }
            }

            let ready_earliest = lock(&self.queue)
                .items()
                .iter()
                .filter(|i| {
                    i.session_key == ch.session_key
                        && i.status == crate::queue::store::ItemStatus::Ready
                })
                .map(|i| i.timestamp)
                .min();

            let earliest = new_messages
                .iter()
                .map(|m| m.timestamp)
                .min()
                .or(ready_earliest)
                .unwrap_or_else(now_ms);

            activities.push(InboxActivity {
                channel: ch.name.clone(),
                display_name: ch.display_name.clone(),
                session_key: ch.session_key.clone(),
                new_count: new_messages.len(),
                ready_count,
                new_messages,
                earliest_timestamp: earliest,
            });
        }

        // Oldest activity is visited first.
        activities.sort_by_key(|a| a.earliest_timestamp);
        Ok(activities)
    }

    /// Mark a channel's activity seen: advance its baseline to now.
    pub fn mark_seen(&self, session_key: &str) {
        lock(&self.queue).set_snapshot(session_key, now_ms());
    }
}

fn lock(queue: &Arc<Mutex<QueueStore>>) -> std::sync::MutexGuard<'_, QueueStore> {
    queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn speaker_for(role: &str, label: Option<&str>) -> Speaker {
    match label {
        Some("voice-user") => Speaker::You,
        Some("discord-user") => Speaker::User,
        _ if role == "assistant" => Speaker::Assistant,
        _ => Speaker::User,
    }
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Format new messages for speech.
///
/// Three verbosity bands:
/// - up to 5: every message verbatim with a speaker label,
/// - 6 to 15: the first two, a count, then the last two,
/// - 16 or more: the count and only the most recent message.
#[must_use]
pub fn format_for_tts(messages: &[InboxMessage]) -> String {
    fn line(m: &InboxMessage) -> String {
        format!("{}: {}", m.speaker.spoken(), m.text)
    }

    match messages.len() {
        0 => "Nothing new.".to_owned(),
        1..=5 => messages.iter().map(line).collect::<Vec<_>>().join(" "),
        6..=15 => {
            let mut parts: Vec<String> = messages.iter().take(2).map(line).collect();
            parts.push(format!("{} more messages.", messages.len() - 4));
            parts.extend(messages.iter().skip(messages.len() - 2).map(line));
            parts.join(" ")
        }
        n => {
            let last = messages.last().map(line).unwrap_or_default();
            format!("{n} new messages. Most recent: {last}")
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::gateway::{ChatMessage, GatewayMessage, MessageContent};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StubGateway {
        histories: HashMap<String, Vec<GatewayMessage>>,
    }

    #[async_trait]
    impl ChatGateway for StubGateway {
        async fn history(&self, session_key: &str, _limit: usize) -> Result<Vec<GatewayMessage>> {
            Ok(self.histories.get(session_key).cloned().unwrap_or_default())
        }

        async fn inject(
            &self,
            _session_key: &str,
            _message: &str,
            _label: Option<&str>,
        ) -> Result<String> {
            Ok("m1".to_owned())
        }

        async fn complete(&self, _messages: &[ChatMessage], _user: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    fn msg(role: &str, label: Option<&str>, text: &str, ts: i64) -> GatewayMessage {
        GatewayMessage {
            role: role.to_owned(),
            content: MessageContent::Text(text.to_owned()),
            label: label.map(str::to_owned),
            timestamp: Some(ts),
        }
    }

    fn channel(name: &str, key: &str) -> InboxChannel {
        InboxChannel {
            name: name.to_owned(),
            display_name: name.to_owned(),
            session_key: key.to_owned(),
        }
    }

    fn store() -> Arc<Mutex<QueueStore>> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue-state.json");
        // Keep the tempdir alive for the test process lifetime.
        std::mem::forget(dir);
        Arc::new(Mutex::new(QueueStore::load(path)))
    }

    #[tokio::test]
    async fn only_discord_user_messages_after_baseline_are_new() {
        let key = "agent:main:discord:channel:1";
        let base: i64 = 1_800_000_000_000;
        let gateway = Arc::new(StubGateway {
            histories: HashMap::from([(
                key.to_owned(),
                vec![
                    msg("user", Some("discord-user"), "old", base - 10),
                    msg("user", Some("voice-user"), "mirrored", base + 5),
                    msg("assistant", None, "reply", base + 6),
                    msg("user", Some("discord-user"), "fresh", base + 7),
                ],
            )]),
        });
        let queue = store();
        queue.lock().unwrap().set_snapshot(key, base);

        let tracker = InboxTracker::new(gateway, queue);
        let activities = tracker.check_inbox(&[channel("general", key)]).await.unwrap();

        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].new_count, 1);
        assert_eq!(activities[0].new_messages[0].text, "fresh");
        assert_eq!(activities[0].new_messages[0].speaker, Speaker::User);
    }

    #[tokio::test]
    async fn internal_traffic_auto_advances_baseline() {
        let key = "agent:main:discord:channel:2";
        let base: i64 = 1_800_000_000_000;
        let gateway = Arc::new(StubGateway {
            histories: HashMap::from([(
                key.to_owned(),
                vec![
                    msg("user", Some("voice-user"), "mirrored", base + 100),
                    msg("assistant", Some("voice-assistant"), "reply", base + 200),
                ],
            )]),
        });
        let queue = store();
        queue.lock().unwrap().set_snapshot(key, base);

        let tracker = InboxTracker::new(gateway, Arc::clone(&queue));
        let activities = tracker.check_inbox(&[channel("general", key)]).await.unwrap();

        assert!(activities.is_empty());
        assert_eq!(queue.lock().unwrap().snapshot(key), Some(base + 200));
    }

    #[tokio::test]
    async fn legacy_second_baselines_migrate() {
        let key = "agent:main:discord:channel:3";
        let gateway = Arc::new(StubGateway {
            histories: HashMap::from([(
                key.to_owned(),
                vec![msg("user", Some("discord-user"), "hello", 1_800_000_000_123)],
            )]),
        });
        let queue = store();
        // Second-resolution legacy value.
        queue.lock().unwrap().set_snapshot(key, 1_700_000_000);

        let tracker = InboxTracker::new(gateway, Arc::clone(&queue));
        let activities = tracker.check_inbox(&[channel("general", key)]).await.unwrap();

        // Migration means the old message is treated as already seen.
        assert!(activities.is_empty());
        assert_eq!(queue.lock().unwrap().snapshot(key), Some(1_800_000_000_123));
    }

    #[tokio::test]
    async fn activities_sorted_oldest_first() {
        let base: i64 = 1_800_000_000_000;
        let gateway = Arc::new(StubGateway {
            histories: HashMap::from([
                ("k:a".to_owned(), vec![msg("user", Some("discord-user"), "a", base + 300)]),
                ("k:b".to_owned(), vec![msg("user", Some("discord-user"), "b", base + 100)]),
                ("k:c".to_owned(), vec![msg("user", Some("discord-user"), "c", base + 200)]),
            ]),
        });
        let queue = store();
        for key in ["k:a", "k:b", "k:c"] {
            queue.lock().unwrap().set_snapshot(key, base);
        }

        let tracker = InboxTracker::new(gateway, queue);
        let activities = tracker
            .check_inbox(&[channel("a", "k:a"), channel("b", "k:b"), channel("c", "k:c")])
            .await
            .unwrap();

        let order: Vec<&str> = activities.iter().map(|a| a.channel.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn activate_baselines_everything_from_now() {
        let queue = store();
        let gateway = Arc::new(StubGateway { histories: HashMap::new() });
        let tracker = InboxTracker::new(gateway, Arc::clone(&queue));

        tracker.activate(&[channel("a", "k:a"), channel("b", "k:b")]);

        let a = queue.lock().unwrap().snapshot("k:a").unwrap();
        let b = queue.lock().unwrap().snapshot("k:b").unwrap();
        assert!(a >= LEGACY_BASELINE_CUTOFF);
        assert!(b >= LEGACY_BASELINE_CUTOFF);
    }

    // -----------------------------------------------------------------------
    // format_for_tts bands
    // -----------------------------------------------------------------------

    fn inbox_msg(speaker: Speaker, text: &str) -> InboxMessage {
        InboxMessage { speaker, text: text.to_owned(), timestamp: 0 }
    }

    #[test]
    fn tts_small_band_is_verbatim() {
        let msgs: Vec<InboxMessage> =
            (0..4).map(|i| inbox_msg(Speaker::User, &format!("m{i}"))).collect();
        let out = format_for_tts(&msgs);
        for m in &msgs {
            assert!(out.contains(&m.text), "missing {} in {out}", m.text);
        }
        assert!(out.contains("User:"));
    }

    #[test]
    fn tts_small_band_contains_each_exactly_once() {
        let msgs: Vec<InboxMessage> =
            (0..5).map(|i| inbox_msg(Speaker::User, &format!("unique-{i}"))).collect();
        let out = format_for_tts(&msgs);
        for m in &msgs {
            assert_eq!(out.matches(&m.text).count(), 1);
        }
    }

    #[test]
    fn tts_middle_band_elides_the_middle() {
        let msgs: Vec<InboxMessage> =
            (0..9).map(|i| inbox_msg(Speaker::User, &format!("m{i}x"))).collect();
        let out = format_for_tts(&msgs);
        assert!(out.contains("m0x"));
        assert!(out.contains("m1x"));
        assert!(out.contains("5 more messages"));
        assert!(out.contains("m7x"));
        assert!(out.contains("m8x"));
        assert!(!out.contains("m4x"));
    }

    #[test]
    fn tts_large_band_counts_and_reads_latest() {
        let msgs: Vec<InboxMessage> =
            (0..20).map(|i| inbox_msg(Speaker::User, &format!("m{i}x"))).collect();
        let out = format_for_tts(&msgs);
        assert!(out.starts_with("20 new messages."));
        assert!(out.contains("m19x"));
        assert!(!out.contains("m0x"));
    }

    #[test]
    fn tts_speaker_labels() {
        let msgs = vec![
            inbox_msg(Speaker::You, "mine"),
            inbox_msg(Speaker::Assistant, "theirs"),
        ];
        let out = format_for_tts(&msgs);
        assert!(out.contains("You: mine"));
        assert!(out.contains("Assistant: theirs"));
    }
}
