//! Voice activity segmentation.
//!
//! Accumulates inbound PCM frames into complete utterances using RMS energy
//! gating: a pre-roll pad so the first phoneme isn't clipped, a minimum
//! speech duration so coughs don't become turns, and a silence delay that
//! closes the segment. The closed segment is wrapped in a RIFF/WAVE
//! container ready for the STT backend.

use crate::config::SegmenterConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::Utterance;
use std::collections::VecDeque;
use std::io::Cursor;
use tracing::debug;

/// One inbound PCM frame from the voice transport.
#[derive(Debug, Clone)]
pub struct PcmFrame<'a> {
    /// Speaker id.
    pub user_id: &'a str,
    /// Mono 16-bit samples at the configured rate.
    pub samples: &'a [i16],
}

/// Energy-gated utterance segmenter.
pub struct VoiceSegmenter {
    sample_rate: u32,
    threshold: f32,
    pre_roll: VecDeque<i16>,
    pre_roll_max: usize,
    speech: Vec<i16>,
    speaker: Option<String>,
    in_speech: bool,
    silence_samples: usize,
    silence_samples_threshold: usize,
    min_speech_samples: usize,
}

impl VoiceSegmenter {
    /// Build a segmenter.
    #[must_use]
    pub fn new(config: &SegmenterConfig, threshold: f32, silence_delay_ms: u64) -> Self {
        let rate = config.sample_rate as usize;
        Self {
            sample_rate: config.sample_rate,
            threshold,
            pre_roll: VecDeque::new(),
            pre_roll_max: config.speech_pad_ms as usize * rate / 1000,
            speech: Vec::new(),
            speaker: None,
            in_speech: false,
            silence_samples: 0,
            silence_samples_threshold: silence_delay_ms as usize * rate / 1000,
            min_speech_samples: config.min_speech_duration_ms as usize * rate / 1000,
        }
    }

    /// Update the RMS threshold (noise-gate command).
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    /// Update the end-of-utterance silence delay (delay command).
    pub fn set_silence_delay_ms(&mut self, ms: u64) {
        self.silence_samples_threshold = ms as usize * self.sample_rate as usize / 1000;
    }

    /// Feed one frame; returns a complete utterance when one closes.
    pub fn push_frame(&mut self, frame: &PcmFrame<'_>) -> Option<Utterance> {
        let rms = rms_energy(frame.samples);
        let is_speech = rms > self.threshold;

        if self.pre_roll_max > 0 && !self.in_speech {
            self.pre_roll.extend(frame.samples.iter().copied());
            while self.pre_roll.len() > self.pre_roll_max {
                let _ = self.pre_roll.pop_front();
            }
        }

        if is_speech {
            if !self.in_speech {
                self.in_speech = true;
                self.speaker = Some(frame.user_id.to_owned());
                self.speech.clear();
                self.speech.extend(self.pre_roll.iter().copied());
                self.pre_roll.clear();
            }
            self.silence_samples = 0;
            self.speech.extend_from_slice(frame.samples);
            return None;
        }

        if !self.in_speech {
            return None;
        }

        // Trailing silence is kept inside the segment up to the delay.
        self.silence_samples = self.silence_samples.saturating_add(frame.samples.len());
        self.speech.extend_from_slice(frame.samples);

        if self.silence_samples < self.silence_samples_threshold {
            return None;
        }

        self.in_speech = false;
        self.silence_samples = 0;
        let samples = std::mem::take(&mut self.speech);
        let speaker = self.speaker.take().unwrap_or_default();

        if samples.len() < self.min_speech_samples {
            debug!("segment below min speech duration, dropped");
            return None;
        }

        let duration_ms = (samples.len() as u64 * 1000) / u64::from(self.sample_rate);
        match encode_wav(&samples, self.sample_rate) {
            Ok(wav) => Some(Utterance { user_id: speaker, wav, duration_ms }),
            Err(e) => {
                debug!("segment encode failed: {e}");
                None
            }
        }
    }

    /// Drop any partial segment.
    pub fn reset(&mut self) {
        self.pre_roll.clear();
        self.speech.clear();
        self.speaker = None;
        self.in_speech = false;
        self.silence_samples = 0;
    }
}

/// RMS energy of i16 samples normalized to \[0, 1\].
fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / f64::from(i16::MAX);
            v * v
        })
        .sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Wrap samples in a RIFF/WAVE container (mono 16-bit LE).
fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| VoiceError::Segmenter(format!("wav encode: {e}")))?;
        for &s in samples {
            writer
                .write_sample(s)
                .map_err(|e| VoiceError::Segmenter(format!("wav encode: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| VoiceError::Segmenter(format!("wav finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}
