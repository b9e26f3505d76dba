//! Voice transport boundary.
//!
//! The transport owns the realtime voice connection: outgoing audio playback
//! and a few chat-side fallbacks the router needs (recent messages when the
//! gateway has no history, thread creation for forum posts). The pipeline
//! only sees this trait; the production implementation lives with the host.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// A message read from the transport side of a channel.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    /// Author display name.
    pub author: String,
    /// Whether the author is this bot.
    pub from_bot: bool,
    /// Plain text content.
    pub text: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

/// The voice transport surface used by the pipeline.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Play an opaque audio byte stream to the voice channel.
    ///
    /// Resolves when playback finishes or is stopped.
    async fn play(&self, audio: Bytes) -> Result<()>;

    /// Stop current playback immediately.
    async fn stop(&self) -> Result<()>;

    /// Most recent messages of a chat channel, oldest first.
    ///
    /// Used to seed router history when the gateway has none.
    async fn recent_messages(&self, channel_id: &str, limit: usize)
    -> Result<Vec<TransportMessage>>;

    /// Create a forum thread; returns the new thread's channel id.
    async fn create_thread(&self, forum_id: &str, name: &str, body: &str) -> Result<String>;
}
