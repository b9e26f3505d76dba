//! Chat gateway boundary.
//!
//! The gateway hosts the per-channel conversation sessions: history reads,
//! `voice-user` / `voice-assistant` mirror injections, and chat completions.
//! The pipeline only ever talks to the [`ChatGateway`] trait; the HTTP
//! implementation lives here, stubs live in the tests.

use crate::config::GatewayConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Label marking messages mirrored from the voice surface.
pub const VOICE_USER_LABEL: &str = "voice-user";
/// Label marking assistant replies mirrored from the voice surface.
pub const VOICE_ASSISTANT_LABEL: &str = "voice-assistant";

/// A message content payload: either a plain string or structured blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text.
    Text(String),
    /// Structured block list.
    Blocks(Vec<ContentBlock>),
}

/// One structured content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    /// Block type discriminator (only `"text"` carries speech-relevant data).
    #[serde(rename = "type")]
    pub kind: String,
    /// Text payload for `text` blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl MessageContent {
    /// Flatten to plain text: the string itself, or all text blocks joined.
    #[must_use]
    pub fn flatten(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.kind == "text")
                .filter_map(|b| b.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// The first text block (or the string itself).
    #[must_use]
    pub fn first_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            Self::Blocks(blocks) => blocks
                .iter()
                .find(|b| b.kind == "text")
                .and_then(|b| b.text.as_deref()),
        }
    }
}

/// A message as read from the gateway history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// Message role (`user`, `assistant`, `system`).
    pub role: String,
    /// Content (string or blocks).
    pub content: MessageContent,
    /// Origin label (`discord-user`, `voice-user`, `voice-assistant`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Epoch milliseconds, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// A chat completion request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role (`system`, `user`, `assistant`).
    pub role: String,
    /// Plain text content.
    pub content: String,
}

/// The chat gateway RPC surface used by the pipeline.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Fetch the most recent `limit` messages of a session, oldest first.
    async fn history(&self, session_key: &str, limit: usize) -> Result<Vec<GatewayMessage>>;

    /// Inject a message into a session. Returns the gateway message id.
    async fn inject(&self, session_key: &str, message: &str, label: Option<&str>)
    -> Result<String>;

    /// Run a chat completion and return the assistant text.
    async fn complete(&self, messages: &[ChatMessage], user: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HistoryRequest<'a> {
    session_key: &'a str,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<GatewayMessage>,
}

#[derive(Debug, Serialize)]
struct InjectRequest<'a> {
    session_key: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct InjectResponse {
    #[serde(rename = "messageId")]
    message_id: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    messages: &'a [ChatMessage],
    model: &'a str,
    user: &'a str,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

/// HTTP chat gateway client.
pub struct HttpChatGateway {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl HttpChatGateway {
    /// Build a client for the configured gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| VoiceError::Gateway(format!("client init: {e}")))?;
        Ok(Self { config, client })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));
        let mut builder = self.client.post(url);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl ChatGateway for HttpChatGateway {
    async fn history(&self, session_key: &str, limit: usize) -> Result<Vec<GatewayMessage>> {
        let response = self
            .request("/chat/history")
            .json(&HistoryRequest { session_key, limit })
            .send()
            .await
            .map_err(|e| VoiceError::Gateway(format!("chat.history: {e}")))?
            .error_for_status()
            .map_err(|e| VoiceError::Gateway(format!("chat.history: {e}")))?;
        let body: HistoryResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Gateway(format!("chat.history decode: {e}")))?;
        Ok(body.messages)
    }

    async fn inject(
        &self,
        session_key: &str,
        message: &str,
        label: Option<&str>,
    ) -> Result<String> {
        let response = self
            .request("/chat/inject")
            .json(&InjectRequest { session_key, message, label })
            .send()
            .await
            .map_err(|e| VoiceError::Gateway(format!("chat.inject: {e}")))?
            .error_for_status()
            .map_err(|e| VoiceError::Gateway(format!("chat.inject: {e}")))?;
        let body: InjectResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Gateway(format!("chat.inject decode: {e}")))?;
        Ok(body.message_id)
    }

    async fn complete(&self, messages: &[ChatMessage], user: &str) -> Result<String> {
        let request = CompletionRequest {
            messages,
            model: &self.config.model,
            user,
            max_tokens: self.config.max_tokens,
        };
        let response = self
            .request("/v1/chat/completions")
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceError::Gateway(format!("completion: {e}")))?
            .error_for_status()
            .map_err(|e| VoiceError::Gateway(format!("completion: {e}")))?;
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Gateway(format!("completion decode: {e}")))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| VoiceError::Gateway("completion returned no choices".to_owned()))
    }
}
