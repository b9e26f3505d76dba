//! Earcon palette: short, named feedback cues.
//!
//! Each earcon is synthesized once at startup as mono 16-bit LE PCM at
//! 48 kHz inside a RIFF/WAVE container, then served as an immutable byte
//! slice. The palette is the single source of earcon audio; no other
//! component renders cue sounds.

use crate::error::{Result, VoiceError};
use std::io::Cursor;

/// Earcon sample rate in Hz.
pub const EARCON_SAMPLE_RATE: u32 = 48_000;

/// The eight fixed cue names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Earcon {
    /// Capture opened, Watson is listening.
    Listening,
    /// Input accepted.
    Acknowledged,
    /// Recognition or backend failure.
    Error,
    /// Five seconds left on an interaction timeout.
    TimeoutWarning,
    /// Flow cancelled or timed out.
    Cancelled,
    /// Pipeline back at idle, ready for the next turn.
    Ready,
    /// Utterance arrived while a prior turn is still in flight.
    Busy,
    /// Gated mode rejected a wake-less utterance.
    GateClosed,
}

impl Earcon {
    /// All cues in tour order.
    pub const ALL: [Earcon; 8] = [
        Earcon::Listening,
        Earcon::Acknowledged,
        Earcon::Error,
        Earcon::TimeoutWarning,
        Earcon::Cancelled,
        Earcon::Ready,
        Earcon::Busy,
        Earcon::GateClosed,
    ];

    /// Stable palette name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Listening => "listening",
            Self::Acknowledged => "acknowledged",
            Self::Error => "error",
            Self::TimeoutWarning => "timeout-warning",
            Self::Cancelled => "cancelled",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::GateClosed => "gate-closed",
        }
    }

    /// Pitch contour: `(frequency Hz, duration ms)` notes played in order.
    ///
    /// Each cue has a distinct contour so the earcon tour is meaningful
    /// without looking at a screen.
    fn contour(self) -> &'static [(f32, u32)] {
        match self {
            Self::Listening => &[(660.0, 70), (880.0, 90)],
            Self::Acknowledged => &[(880.0, 60), (1100.0, 60)],
            Self::Error => &[(300.0, 110), (220.0, 140)],
            Self::TimeoutWarning => &[(740.0, 60), (740.0, 60), (740.0, 90)],
            Self::Cancelled => &[(520.0, 80), (390.0, 120)],
            Self::Ready => &[(980.0, 90)],
            Self::Busy => &[(440.0, 50), (440.0, 50)],
            Self::GateClosed => &[(260.0, 120)],
        }
    }
}

/// Pre-rendered cue sounds.
pub struct EarconPalette {
    rendered: Vec<(Earcon, Vec<u8>)>,
}

impl EarconPalette {
    /// Render all eight cues.
    ///
    /// # Errors
    ///
    /// Returns an error if WAV encoding fails (should not happen with an
    /// in-memory cursor).
    pub fn render() -> Result<Self> {
        let mut rendered = Vec::with_capacity(Earcon::ALL.len());
        for cue in Earcon::ALL {
            rendered.push((cue, render_wav(cue.contour())?));
        }
        Ok(Self { rendered })
    }

    /// The WAV bytes for a cue.
    #[must_use]
    pub fn get(&self, cue: Earcon) -> &[u8] {
        // The palette is built over Earcon::ALL, so lookup always succeeds.
        self.rendered
            .iter()
            .find(|(c, _)| *c == cue)
            .map(|(_, bytes)| bytes.as_slice())
            .unwrap_or(&[])
    }
}

/// Render the soft two-note cue looped while the user holds for a response.
///
/// # Errors
///
/// Returns an error if WAV encoding fails.
pub fn waiting_tone() -> Result<Vec<u8>> {
    render_wav(&[(620.0, 120), (780.0, 160)])
}

/// Render a pitch contour into a RIFF/WAVE byte buffer.
fn render_wav(contour: &[(f32, u32)]) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: EARCON_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| VoiceError::Audio(format!("earcon encode: {e}")))?;
        for &(freq, ms) in contour {
            for sample in render_note(freq, ms) {
                writer
                    .write_sample(sample)
                    .map_err(|e| VoiceError::Audio(format!("earcon encode: {e}")))?;
            }
        }
        writer
            .finalize()
            .map_err(|e| VoiceError::Audio(format!("earcon finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

/// Render one sine note with a linear attack/release envelope.
fn render_note(freq: f32, ms: u32) -> Vec<i16> {
    let total = (EARCON_SAMPLE_RATE as u64 * u64::from(ms) / 1000) as usize;
    let ramp = (total / 8).max(1);
    let mut samples = Vec::with_capacity(total);
    for n in 0..total {
        let t = n as f32 / EARCON_SAMPLE_RATE as f32;
        let envelope = if n < ramp {
            n as f32 / ramp as f32
        } else if n + ramp > total {
            (total - n) as f32 / ramp as f32
        } else {
            1.0
        };
        let value = (t * freq * std::f32::consts::TAU).sin() * envelope * 0.4;
        samples.push((value * f32::from(i16::MAX)) as i16);
    }
    samples
}
