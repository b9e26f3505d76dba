//! Configuration types for the voice interaction pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the Watson pipeline.
///
/// The orchestrator never reads environment variables; the host resolves its
/// environment into this record before construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatsonConfig {
    /// Wake name the assistant answers to (single token).
    pub bot_name: BotName,
    /// Agent identifier used when deriving gateway session keys.
    pub agent_id: AgentId,
    /// Runtime-adjustable voice settings (gated mode, noise gate, delay).
    pub voice: VoiceSettings,
    /// Utterance segmentation settings.
    pub segmenter: SegmenterConfig,
    /// Speech-to-text backend.
    pub stt: SttConfig,
    /// Text-to-speech backend.
    pub tts: TtsConfig,
    /// Chat gateway (history / inject / completions).
    pub gateway: GatewayConfig,
    /// Queue state persistence.
    pub queue: QueueConfig,
    /// Channel table.
    pub channels: ChannelsConfig,
    /// Stall watchdog and pipeline tick.
    pub watchdog: WatchdogConfig,
    /// Dependency liveness monitoring.
    pub depmon: DepMonConfig,
    /// Session transcript output.
    pub transcript: TranscriptConfig,
    /// Health snapshot monitor.
    pub health: HealthConfig,
}

/// Newtype default for the wake name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotName(pub String);

impl Default for BotName {
    fn default() -> Self {
        Self("Watson".to_owned())
    }
}

/// Newtype default for the agent id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl Default for AgentId {
    fn default() -> Self {
        Self("main".to_owned())
    }
}

/// Noise-gate sensitivity bands for the segmenter threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseLevel {
    /// Quiet room: pick up soft speech.
    Low,
    /// Normal sensitivity.
    Medium,
    /// Noisy room: only loud, close speech.
    High,
}

impl NoiseLevel {
    /// RMS threshold applied to the segmenter for this band.
    #[must_use]
    pub fn threshold(self) -> f32 {
        match self {
            Self::Low => 0.005,
            Self::Medium => 0.01,
            Self::High => 0.025,
        }
    }

    /// Spoken name for settings summaries.
    #[must_use]
    pub fn spoken(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Runtime-adjustable voice settings.
///
/// Mutated by the `Noise`, `Delay`, and `GatedMode` voice commands; the
/// orchestrator speaks a confirmation after each change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// When true, utterances must carry the wake word (outside grace windows
    /// and `Awaiting*` menus).
    pub gated: bool,
    /// Noise-gate sensitivity band.
    pub noise: NoiseLevel,
    /// End-of-utterance silence delay in milliseconds.
    pub delay_ms: u64,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            gated: false,
            noise: NoiseLevel::Medium,
            delay_ms: 1800,
        }
    }
}

/// Utterance segmentation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Input sample rate in Hz. The voice transport delivers 48 kHz mono PCM.
    pub sample_rate: u32,
    /// Minimum speech duration in ms to emit an utterance.
    pub min_speech_duration_ms: u32,
    /// Padding preserved before detected speech in ms.
    pub speech_pad_ms: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            min_speech_duration_ms: 350,
            speech_pad_ms: 120,
        }
    }
}

/// Speech-to-text backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Transcription endpoint (`POST` of a RIFF/WAVE body).
    pub url: String,
    /// Request timeout in ms.
    pub timeout_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8900/transcribe".to_owned(),
            timeout_ms: 20_000,
        }
    }
}

/// Text-to-speech backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Synthesis endpoint (`POST` JSON `{"text": …}`, opaque byte stream back).
    pub url: String,
    /// Request timeout in ms.
    pub timeout_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8901/synthesize".to_owned(),
            timeout_ms: 30_000,
        }
    }
}

/// Chat gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the gateway RPC surface.
    pub base_url: String,
    /// Optional bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Model passed to chat completions.
    pub model: String,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Request timeout in ms.
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_owned(),
            api_key: None,
            model: "gateway-default".to_owned(),
            max_tokens: 300,
            timeout_ms: 60_000,
        }
    }
}

/// Queue state persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Path of the JSON queue-state file.
    pub state_path: PathBuf,
    /// Response poller interval in ms.
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            state_path: default_data_dir().join("queue-state.json"),
            poll_interval_ms: 5_000,
        }
    }
}

/// Kind of a configured channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Plain text channel.
    Text,
    /// Forum channel that hosts posts/threads.
    Forum,
}

impl Default for ChannelKind {
    fn default() -> Self {
        Self::Text
    }
}

/// One configured channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelDefConfig {
    /// Short name used in voice commands ("research", "default").
    pub name: String,
    /// Spoken display name.
    pub display_name: String,
    /// Backing transport channel id.
    pub channel_id: String,
    /// Channel kind.
    pub kind: ChannelKind,
    /// Optional system-prompt fragment scoped to this channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_prompt: Option<String>,
    /// Explicit session key override (derived from the channel id otherwise).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

impl Default for ChannelDefConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            display_name: String::new(),
            channel_id: String::new(),
            kind: ChannelKind::Text,
            topic_prompt: None,
            session_key: None,
        }
    }
}

/// Channel table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Name of the default channel.
    pub default: String,
    /// Static channel definitions, in definition order.
    pub defs: Vec<ChannelDefConfig>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            default: "default".to_owned(),
            defs: Vec::new(),
        }
    }
}

/// Stall watchdog and pipeline tick configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Non-idle dwell before the watchdog resets the pipeline, in ms.
    pub stall_timeout_ms: u64,
    /// Timer tick interval in ms (drives contract warning/timeout deadlines).
    pub tick_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: 60_000,
            tick_interval_ms: 250,
        }
    }
}

/// Dependency liveness monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepMonConfig {
    /// Whether the monitor runs.
    pub enabled: bool,
    /// Probe interval in ms.
    pub interval_ms: u64,
    /// TCP connect timeout in ms.
    pub connect_timeout_ms: u64,
    /// Minimum gap between restart attempts per dependency, in ms.
    pub restart_cooldown_ms: u64,
    /// Optional shell command to restart the STT backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt_restart_cmd: Option<String>,
    /// Optional shell command to restart the TTS backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_restart_cmd: Option<String>,
}

impl Default for DepMonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 15_000,
            connect_timeout_ms: 1_200,
            restart_cooldown_ms: 60_000,
            stt_restart_cmd: None,
            tts_restart_cmd: None,
        }
    }
}

/// Session transcript configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Directory for per-invocation JSONL transcripts.
    pub dir: PathBuf,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir().join("transcripts"),
        }
    }
}

/// Health snapshot monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Snapshot interval in ms.
    pub interval_ms: u64,
    /// Non-idle state age that triggers an alert, in ms.
    pub state_age_alert_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            state_age_alert_ms: 45_000,
        }
    }
}

/// Platform data directory for Watson state.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("watson")
}

impl WatsonConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| crate::error::VoiceError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| crate::error::VoiceError::Config(format!("serialize config: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = WatsonConfig::default();
        assert_eq!(cfg.bot_name.0, "Watson");
        assert_eq!(cfg.gateway.max_tokens, 300);
        assert_eq!(cfg.depmon.connect_timeout_ms, 1_200);
        assert_eq!(cfg.watchdog.stall_timeout_ms, 60_000);
        assert_eq!(cfg.segmenter.sample_rate, 48_000);
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let cfg: WatsonConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.bot_name.0, "Watson");
        assert!(!cfg.voice.gated);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watson.toml");

        let mut cfg = WatsonConfig::default();
        cfg.voice.gated = true;
        cfg.voice.noise = NoiseLevel::High;
        cfg.channels.defs.push(ChannelDefConfig {
            name: "research".to_owned(),
            display_name: "Research".to_owned(),
            channel_id: "1001".to_owned(),
            kind: ChannelKind::Text,
            topic_prompt: None,
            session_key: None,
        });

        cfg.save_to_file(&path).unwrap();
        let loaded = WatsonConfig::load(&path).unwrap();

        assert!(loaded.voice.gated);
        assert_eq!(loaded.voice.noise, NoiseLevel::High);
        assert_eq!(loaded.channels.defs.len(), 1);
        assert_eq!(loaded.channels.defs[0].name, "research");
    }

    #[test]
    fn noise_levels_order_thresholds() {
        assert!(NoiseLevel::Low.threshold() < NoiseLevel::Medium.threshold());
        assert!(NoiseLevel::Medium.threshold() < NoiseLevel::High.threshold());
    }
}
