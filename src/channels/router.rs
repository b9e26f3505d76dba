//! Channel router.
//!
//! Owns the active-channel name, the static channel table, ad-hoc channel
//! registration, per-channel history seeding, and forum-post creation. All
//! gateway session keys derive deterministically from the agent id and the
//! transport channel id.

use crate::channels::history::{ChannelHistory, HISTORY_CAP, Role};
use crate::config::{ChannelKind, ChannelsConfig};
use crate::error::{Result, VoiceError};
use crate::gateway::ChatGateway;
use crate::transport::VoiceTransport;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One routed channel.
#[derive(Debug, Clone)]
pub struct ChannelDef {
    /// Short name used in voice commands.
    pub name: String,
    /// Spoken display name.
    pub display_name: String,
    /// Backing transport channel id.
    pub channel_id: String,
    /// Channel kind.
    pub kind: ChannelKind,
    /// Optional per-channel system-prompt fragment.
    pub topic_prompt: Option<String>,
    /// Explicit session key override.
    pub session_key: Option<String>,
}

impl ChannelDef {
    /// The gateway session key for this channel.
    #[must_use]
    pub fn session_key(&self, agent_id: &str) -> String {
        self.session_key.clone().unwrap_or_else(|| {
            format!("agent:{agent_id}:discord:channel:{}", self.channel_id)
        })
    }
}

/// Result of a switch attempt.
#[derive(Debug, Clone)]
pub struct SwitchOutcome {
    /// Whether the switch happened.
    pub success: bool,
    /// Spoken name of the now-active channel.
    pub display_name: Option<String>,
    /// Turns held in the channel's history after seeding.
    pub history_count: usize,
    /// Failure description when `success` is false.
    pub error: Option<String>,
}

impl SwitchOutcome {
    fn failure(error: impl Into<String>) -> Self {
        Self { success: false, display_name: None, history_count: 0, error: Some(error.into()) }
    }
}

/// The channel router.
pub struct ChannelRouter {
    agent_id: String,
    default_name: String,
    defs: Vec<ChannelDef>,
    active: String,
    histories: HashMap<String, ChannelHistory>,
    last_accessed: HashMap<String, i64>,
    gateway: Arc<dyn ChatGateway>,
    transport: Arc<dyn VoiceTransport>,
}

impl ChannelRouter {
    /// Build the router from the static channel table.
    pub fn new(
        agent_id: String,
        config: &ChannelsConfig,
        gateway: Arc<dyn ChatGateway>,
        transport: Arc<dyn VoiceTransport>,
    ) -> Self {
        let defs: Vec<ChannelDef> = config
            .defs
            .iter()
            .map(|d| ChannelDef {
                name: d.name.clone(),
                display_name: d.display_name.clone(),
                channel_id: d.channel_id.clone(),
                kind: d.kind,
                topic_prompt: d.topic_prompt.clone(),
                session_key: d.session_key.clone(),
            })
            .collect();
        let active = config.default.clone();
        Self {
            agent_id,
            default_name: config.default.clone(),
            defs,
            active,
            histories: HashMap::new(),
            last_accessed: HashMap::new(),
            gateway,
            transport,
        }
    }

    /// Name of the active channel.
    #[must_use]
    pub fn active(&self) -> &str {
        &self.active
    }

    /// Definition of the active channel, when the table knows it.
    #[must_use]
    pub fn active_def(&self) -> Option<&ChannelDef> {
        self.def(&self.active)
    }

    /// Look up a definition by name (case-folded).
    #[must_use]
    pub fn def(&self, name: &str) -> Option<&ChannelDef> {
        let lowered = name.to_lowercase();
        self.defs.iter().find(|d| d.name.to_lowercase() == lowered)
    }

    /// All definitions, definition order.
    #[must_use]
    pub fn defs(&self) -> &[ChannelDef] {
        &self.defs
    }

    /// Forum channels, definition order.
    #[must_use]
    pub fn forums(&self) -> Vec<&ChannelDef> {
        self.defs.iter().filter(|d| d.kind == ChannelKind::Forum).collect()
    }

    /// Session key for a channel name, when known.
    #[must_use]
    pub fn session_key_for(&self, name: &str) -> Option<String> {
        self.def(name).map(|d| d.session_key(&self.agent_id))
    }

    /// Switch to a channel by name, or by raw channel id for ad-hoc use.
    pub async fn switch_to(&mut self, name: &str) -> SwitchOutcome {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return SwitchOutcome::failure("no channel named");
        }

        let resolved = if self.def(trimmed).is_some() {
            trimmed.to_owned()
        } else if trimmed.chars().all(|c| c.is_ascii_digit()) {
            self.register_ad_hoc(trimmed)
        } else {
            return SwitchOutcome::failure(format!("unknown channel {trimmed}"));
        };

        if let Err(e) = self.ensure_history(&resolved).await {
            debug!("history seed failed for {resolved}: {e}");
        }

        self.active = resolved.clone();
        self.last_accessed
            .insert(resolved.clone(), chrono::Utc::now().timestamp_millis());

        let def = self.def(&resolved).cloned();
        let history_count = self.histories.get(&resolved).map_or(0, ChannelHistory::len);
        info!("switched to channel {resolved} ({history_count} turns)");
        SwitchOutcome {
            success: true,
            display_name: def.map(|d| d.display_name),
            history_count,
            error: None,
        }
    }

    /// Switch to the default channel.
    pub async fn switch_to_default(&mut self) -> SwitchOutcome {
        let name = self.default_name.clone();
        self.switch_to(&name).await
    }

    /// Register an ad-hoc channel for a raw id; returns its table name.
    pub fn register_ad_hoc(&mut self, channel_id: &str) -> String {
        let name = format!("id:{channel_id}");
        if self.def(&name).is_none() {
            self.defs.push(ChannelDef {
                name: name.clone(),
                display_name: format!("channel {channel_id}"),
                channel_id: channel_id.to_owned(),
                kind: ChannelKind::Text,
                topic_prompt: None,
                session_key: None,
            });
        }
        name
    }

    /// Seed a channel's history on first use: gateway first, transport as
    /// fallback. Messages labelled `voice-user` are recorded as user turns;
    /// structured content is flattened.
    async fn ensure_history(&mut self, name: &str) -> Result<()> {
        if self.histories.contains_key(name) {
            return Ok(());
        }
        let Some(def) = self.def(name).cloned() else {
            return Err(VoiceError::Channel(format!("unknown channel {name}")));
        };

        let mut history = ChannelHistory::new();
        let key = def.session_key(&self.agent_id);
        match self.gateway.history(&key, HISTORY_CAP).await {
            Ok(messages) if !messages.is_empty() => {
                for m in messages {
                    let role = if m.label.as_deref() == Some(crate::gateway::VOICE_USER_LABEL) {
                        Role::User
                    } else if m.role == "assistant" {
                        Role::Assistant
                    } else if m.role == "system" {
                        Role::System
                    } else {
                        Role::User
                    };
                    let text = m.content.flatten();
                    if !text.trim().is_empty() {
                        history.push(role, text);
                    }
                }
            }
            _ => {
                // Fallback: the transport's view of the channel.
                if let Ok(messages) =
                    self.transport.recent_messages(&def.channel_id, HISTORY_CAP).await
                {
                    for m in messages {
                        let role = if m.from_bot { Role::Assistant } else { Role::User };
                        if !m.text.trim().is_empty() {
                            history.push(role, m.text);
                        }
                    }
                }
            }
        }

        self.histories.insert(name.to_owned(), history);
        Ok(())
    }

    /// The history of a channel (empty view when unseeded).
    #[must_use]
    pub fn history(&self, name: &str) -> Option<&ChannelHistory> {
        self.histories.get(name)
    }

    /// Record a user turn on a channel.
    pub fn record_user(&mut self, name: &str, content: &str) {
        self.histories.entry(name.to_owned()).or_default().push(Role::User, content);
    }

    /// Record an assistant turn on a channel.
    pub fn record_assistant(&mut self, name: &str, content: &str) {
        self.histories
            .entry(name.to_owned())
            .or_default()
            .push(Role::Assistant, content);
    }

    /// The most recent non-system message text on a channel.
    #[must_use]
    pub fn last_message_text(&self, name: &str) -> Option<String> {
        self.histories
            .get(name)
            .and_then(ChannelHistory::last_message)
            .map(|e| e.content.clone())
    }

    /// Fuzzy-match a forum by name: exact, substring, then contained-by.
    #[must_use]
    pub fn find_forum(&self, query: &str) -> Option<&ChannelDef> {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return None;
        }
        let forums = self.forums();

        if let Some(def) = forums
            .iter()
            .find(|d| d.name.to_lowercase() == q || d.display_name.to_lowercase() == q)
        {
            return Some(def);
        }
        if let Some(def) = forums.iter().find(|d| {
            d.name.to_lowercase().contains(&q) || d.display_name.to_lowercase().contains(&q)
        }) {
            return Some(def);
        }
        forums
            .into_iter()
            .find(|d| q.contains(&d.name.to_lowercase()) || q.contains(&d.display_name.to_lowercase()))
    }

    /// Create a forum post and scope subsequent dialog to the new thread.
    ///
    /// The title is split at its first terminal sentence mark: the leading
    /// sentence names the thread, the remainder (when present) becomes the
    /// opening body.
    ///
    /// # Errors
    ///
    /// Returns an error when the forum id is unknown or thread creation
    /// fails.
    pub async fn create_forum_post(&mut self, forum_id: &str, title: &str) -> Result<String> {
        let forum = self
            .defs
            .iter()
            .find(|d| d.channel_id == forum_id && d.kind == ChannelKind::Forum)
            .cloned()
            .ok_or_else(|| VoiceError::Channel(format!("unknown forum {forum_id}")))?;

        let (thread_name, body) = split_title(title);
        let thread_id = self
            .transport
            .create_thread(&forum.channel_id, &thread_name, &body)
            .await?;

        let name = self.register_ad_hoc(&thread_id);
        // Thread display carries the post name, not a raw id.
        if let Some(def) = self.defs.iter_mut().find(|d| d.name == name) {
            def.display_name = thread_name.clone();
        }
        let outcome = self.switch_to(&name).await;
        if !outcome.success {
            return Err(VoiceError::Channel(
                outcome.error.unwrap_or_else(|| "switch to thread failed".to_owned()),
            ));
        }
        info!("forum post '{thread_name}' created in {}", forum.display_name);
        Ok(thread_name)
    }

    /// Channels ordered by recency, unvisited ones trailing in definition
    /// order.
    #[must_use]
    pub fn recent_channels(&self, limit: usize) -> Vec<&ChannelDef> {
        let mut visited: Vec<&ChannelDef> = self
            .defs
            .iter()
            .filter(|d| self.last_accessed.contains_key(&d.name))
            .collect();
        visited.sort_by_key(|d| std::cmp::Reverse(self.last_accessed.get(&d.name).copied()));

        let unvisited = self
            .defs
            .iter()
            .filter(|d| !self.last_accessed.contains_key(&d.name));

        visited.into_iter().chain(unvisited).take(limit).collect()
    }
}

/// Split a dictated title at the first terminal sentence mark.
fn split_title(title: &str) -> (String, String) {
    let trimmed = title.trim();
    if let Some(idx) = trimmed.find(['.', '!', '?']) {
        let (name, rest) = trimmed.split_at(idx);
        let body = rest.trim_start_matches(['.', '!', '?']).trim();
        let name = name.trim();
        if !name.is_empty() {
            return (name.to_owned(), body.to_owned());
        }
    }
    (trimmed.to_owned(), String::new())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::ChannelDefConfig;
    use crate::error::Result;
    use crate::gateway::{ChatMessage, ContentBlock, GatewayMessage, MessageContent};
    use crate::transport::TransportMessage;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StubGateway {
        histories: HashMap<String, Vec<GatewayMessage>>,
    }

    #[async_trait]
    impl ChatGateway for StubGateway {
        async fn history(&self, session_key: &str, _limit: usize) -> Result<Vec<GatewayMessage>> {
            Ok(self.histories.get(session_key).cloned().unwrap_or_default())
        }

        async fn inject(&self, _s: &str, _m: &str, _l: Option<&str>) -> Result<String> {
            Ok("m".to_owned())
        }

        async fn complete(&self, _m: &[ChatMessage], _u: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    struct StubTransport {
        recents: Vec<TransportMessage>,
        created: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl VoiceTransport for StubTransport {
        async fn play(&self, _audio: bytes::Bytes) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        async fn recent_messages(
            &self,
            _channel_id: &str,
            _limit: usize,
        ) -> Result<Vec<TransportMessage>> {
            Ok(self.recents.clone())
        }

        async fn create_thread(&self, forum_id: &str, name: &str, body: &str) -> Result<String> {
            self.created.lock().unwrap().push((
                forum_id.to_owned(),
                name.to_owned(),
                body.to_owned(),
            ));
            Ok("777001".to_owned())
        }
    }

    fn config() -> ChannelsConfig {
        ChannelsConfig {
            default: "general".to_owned(),
            defs: vec![
                ChannelDefConfig {
                    name: "general".to_owned(),
                    display_name: "General".to_owned(),
                    channel_id: "1000".to_owned(),
                    kind: ChannelKind::Text,
                    topic_prompt: None,
                    session_key: None,
                },
                ChannelDefConfig {
                    name: "research".to_owned(),
                    display_name: "Research".to_owned(),
                    channel_id: "1001".to_owned(),
                    kind: ChannelKind::Text,
                    topic_prompt: Some("You are a research aide.".to_owned()),
                    session_key: None,
                },
                ChannelDefConfig {
                    name: "ideas".to_owned(),
                    display_name: "Idea Board".to_owned(),
                    channel_id: "2000".to_owned(),
                    kind: ChannelKind::Forum,
                    topic_prompt: None,
                    session_key: None,
                },
            ],
        }
    }

    fn router_with(
        histories: HashMap<String, Vec<GatewayMessage>>,
        recents: Vec<TransportMessage>,
    ) -> ChannelRouter {
        ChannelRouter::new(
            "main".to_owned(),
            &config(),
            Arc::new(StubGateway { histories }),
            Arc::new(StubTransport { recents, created: Mutex::new(Vec::new()) }),
        )
    }

    #[test]
    fn session_keys_derive_from_channel_id() {
        let router = router_with(HashMap::new(), Vec::new());
        assert_eq!(
            router.session_key_for("research").unwrap(),
            "agent:main:discord:channel:1001"
        );
    }

    #[tokio::test]
    async fn switch_to_known_channel_seeds_from_gateway() {
        let key = "agent:main:discord:channel:1001";
        let histories = HashMap::from([(
            key.to_owned(),
            vec![
                GatewayMessage {
                    role: "user".to_owned(),
                    content: MessageContent::Blocks(vec![ContentBlock {
                        kind: "text".to_owned(),
                        text: Some("block question".to_owned()),
                    }]),
                    label: Some("voice-user".to_owned()),
                    timestamp: Some(1),
                },
                GatewayMessage {
                    role: "assistant".to_owned(),
                    content: MessageContent::Text("answer".to_owned()),
                    label: None,
                    timestamp: Some(2),
                },
            ],
        )]);
        let mut router = router_with(histories, Vec::new());

        let outcome = router.switch_to("research").await;
        assert!(outcome.success);
        assert_eq!(outcome.display_name.as_deref(), Some("Research"));
        assert_eq!(outcome.history_count, 2);
        assert_eq!(router.active(), "research");

        let history = router.history("research").unwrap();
        assert_eq!(history.last_with_role(Role::User).unwrap().content, "block question");
        assert_eq!(history.last_with_role(Role::Assistant).unwrap().content, "answer");
    }

    #[tokio::test]
    async fn switch_falls_back_to_transport_history() {
        let recents = vec![
            TransportMessage {
                author: "alice".to_owned(),
                from_bot: false,
                text: "ping".to_owned(),
                timestamp: 1,
            },
            TransportMessage {
                author: "watson".to_owned(),
                from_bot: true,
                text: "pong".to_owned(),
                timestamp: 2,
            },
        ];
        let mut router = router_with(HashMap::new(), recents);

        let outcome = router.switch_to("general").await;
        assert!(outcome.success);
        assert_eq!(outcome.history_count, 2);
        let history = router.history("general").unwrap();
        assert_eq!(history.last_with_role(Role::Assistant).unwrap().content, "pong");
    }

    #[tokio::test]
    async fn digit_string_registers_ad_hoc_channel() {
        let mut router = router_with(HashMap::new(), Vec::new());
        let outcome = router.switch_to("994821004").await;
        assert!(outcome.success);
        assert_eq!(router.active(), "id:994821004");
        assert_eq!(
            router.session_key_for("id:994821004").unwrap(),
            "agent:main:discord:channel:994821004"
        );
    }

    #[tokio::test]
    async fn unknown_name_fails() {
        let mut router = router_with(HashMap::new(), Vec::new());
        let outcome = router.switch_to("the moon").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("unknown channel"));
        assert_eq!(router.active(), "general");
    }

    #[tokio::test]
    async fn switch_to_default_returns_home() {
        let mut router = router_with(HashMap::new(), Vec::new());
        router.switch_to("research").await;
        let outcome = router.switch_to_default().await;
        assert!(outcome.success);
        assert_eq!(router.active(), "general");
    }

    #[test]
    fn forum_fuzzy_match_tiers() {
        let router = router_with(HashMap::new(), Vec::new());
        // Exact.
        assert_eq!(router.find_forum("ideas").unwrap().name, "ideas");
        assert_eq!(router.find_forum("Idea Board").unwrap().name, "ideas");
        // Substring (query inside forum name).
        assert_eq!(router.find_forum("idea").unwrap().name, "ideas");
        // Contained-by (forum name inside query).
        assert_eq!(router.find_forum("the idea board please").unwrap().name, "ideas");
        // Not a forum.
        assert!(router.find_forum("research").is_none());
        assert!(router.find_forum("").is_none());
    }

    #[tokio::test]
    async fn create_forum_post_splits_title_and_switches() {
        let transport = Arc::new(StubTransport { recents: Vec::new(), created: Mutex::new(Vec::new()) });
        let mut router = ChannelRouter::new(
            "main".to_owned(),
            &config(),
            Arc::new(StubGateway { histories: HashMap::new() }),
            Arc::clone(&transport) as Arc<dyn VoiceTransport>,
        );

        let name = router
            .create_forum_post("2000", "Dark mode. We should add a proper theme toggle")
            .await
            .unwrap();
        assert_eq!(name, "Dark mode");

        let created = transport.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "2000");
        assert_eq!(created[0].1, "Dark mode");
        assert_eq!(created[0].2, "We should add a proper theme toggle");
        drop(created);

        // Dialog is scoped to the new thread.
        assert_eq!(router.active(), "id:777001");
    }

    #[tokio::test]
    async fn create_forum_post_unknown_forum_errors() {
        let mut router = router_with(HashMap::new(), Vec::new());
        let err = router.create_forum_post("9999", "Title").await.unwrap_err();
        assert!(matches!(err, VoiceError::Channel(_)));
    }

    #[test]
    fn split_title_variants() {
        assert_eq!(
            split_title("Dark mode. Add a toggle"),
            ("Dark mode".to_owned(), "Add a toggle".to_owned())
        );
        assert_eq!(split_title("Just a name"), ("Just a name".to_owned(), String::new()));
        assert_eq!(
            split_title("Really? Yes really"),
            ("Really".to_owned(), "Yes really".to_owned())
        );
    }

    #[tokio::test]
    async fn recent_channels_orders_by_access_then_definition() {
        let mut router = router_with(HashMap::new(), Vec::new());
        router.switch_to("research").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        router.switch_to("general").await;

        let recents: Vec<&str> = router.recent_channels(10).iter().map(|d| d.name.as_str()).collect();
        assert_eq!(recents, vec!["general", "research", "ideas"]);
    }

    #[test]
    fn record_turns_and_last_message() {
        let mut router = router_with(HashMap::new(), Vec::new());
        router.record_user("general", "question");
        router.record_assistant("general", "answer");
        assert_eq!(router.last_message_text("general").unwrap(), "answer");
        assert!(router.last_message_text("research").is_none());
    }
}
