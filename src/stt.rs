//! Speech-to-text client.
//!
//! The pipeline posts complete RIFF/WAVE utterances to an external STT
//! service and receives plain text back. Empty, whitespace-only, and
//! bracket-tag outputs are treated as non-lexical upstream (see
//! [`crate::commands::is_non_lexical`]).

use crate::config::SttConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use serde::Deserialize;

/// The transcription surface used by the pipeline.
#[async_trait]
pub trait SttClient: Send + Sync {
    /// Transcribe one utterance (RIFF/WAVE, mono 16-bit LE PCM @48 kHz).
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    text: String,
}

/// HTTP STT client.
pub struct HttpStt {
    config: SttConfig,
    client: reqwest::Client,
}

impl HttpStt {
    /// Build a client for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: SttConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| VoiceError::Stt(format!("client init: {e}")))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl SttClient for HttpStt {
    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        let response = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(wav.to_vec())
            .send()
            .await
            .map_err(|e| VoiceError::Stt(format!("request: {e}")))?
            .error_for_status()
            .map_err(|e| VoiceError::Stt(format!("status: {e}")))?;
        let body: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Stt(format!("decode: {e}")))?;
        Ok(body.text)
    }
}
