//! Message types passed between pipeline components.

/// One segmented user utterance, ready for transcription.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Speaker id as reported by the voice transport.
    pub user_id: String,
    /// RIFF/WAVE container, mono 16-bit LE PCM at 48 kHz.
    pub wav: Vec<u8>,
    /// Utterance duration in milliseconds.
    pub duration_ms: u64,
}
