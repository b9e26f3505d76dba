//! Error types for the Watson voice pipeline.

/// Top-level error type for the voice interaction pipeline.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Audio playback or earcon error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Utterance segmentation error.
    #[error("segmenter error: {0}")]
    Segmenter(String),

    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Chat gateway RPC error.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Channel router error (unknown channel, forum lookup, thread creation).
    #[error("channel error: {0}")]
    Channel(String),

    /// Queue state persistence error.
    #[error("queue error: {0}")]
    Queue(String),

    /// Voice transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
