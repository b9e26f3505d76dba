//! Text-to-speech client.
//!
//! Synthesis returns an opaque byte stream that the audio adapter hands
//! directly to the voice transport's player; the container/codec is never
//! inspected here.

use crate::config::TtsConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

/// The synthesis surface used by the pipeline.
#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Synthesize speech for `text`.
    async fn synthesize(&self, text: &str) -> Result<Bytes>;
}

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
}

/// HTTP TTS client.
pub struct HttpTts {
    config: TtsConfig,
    client: reqwest::Client,
}

impl HttpTts {
    /// Build a client for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| VoiceError::Tts(format!("client init: {e}")))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl TtsClient for HttpTts {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let response = self
            .client
            .post(&self.config.url)
            .json(&SynthesizeRequest { text })
            .send()
            .await
            .map_err(|e| VoiceError::Tts(format!("request: {e}")))?
            .error_for_status()
            .map_err(|e| VoiceError::Tts(format!("status: {e}")))?;
        response
            .bytes()
            .await
            .map_err(|e| VoiceError::Tts(format!("stream: {e}")))
    }
}
