//! Audio output adapter.
//!
//! Serializes all outgoing audio (responses, feedback speech, earcons, the
//! waiting-tone loop) behind one player task feeding the voice transport.
//! Stop requests bypass the queue and take effect immediately; a generation
//! counter drops any stream that was queued before the stop.

use crate::earcons::{Earcon, EarconPalette, waiting_tone};
use crate::error::Result;
use crate::transport::VoiceTransport;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A `ready` earcon this close after the previous `ready` is coalesced away.
const READY_COALESCE_WINDOW: Duration = Duration::from_millis(220);

/// Pause between waiting-tone repetitions.
const WAITING_LOOP_GAP: Duration = Duration::from_millis(900);

/// What a finished stream was, for the completion notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackKind {
    /// The main spoken response; completion drives `SpeakingComplete`.
    Response,
    /// Short confirmations and prompts; completion is not tracked.
    Feedback,
    /// An idle-notify announcement; completion clears the in-flight flag.
    Notify,
}

/// Completion notification sent to the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackFinished {
    /// What finished.
    pub kind: PlaybackKind,
}

enum AudioCmd {
    Play { audio: Bytes, kind: PlaybackKind, generation: u64 },
    PlayEarcon { cue: Earcon, generation: u64 },
}

/// Handle to the player task.
#[derive(Clone)]
pub struct AudioAdapter {
    cmd_tx: mpsc::UnboundedSender<AudioCmd>,
    transport: Arc<dyn VoiceTransport>,
    playing: Arc<AtomicBool>,
    waiting: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl AudioAdapter {
    /// Spawn the player task.
    pub fn spawn(
        transport: Arc<dyn VoiceTransport>,
        palette: Arc<EarconPalette>,
        finished_tx: mpsc::UnboundedSender<PlaybackFinished>,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let playing = Arc::new(AtomicBool::new(false));
        let waiting = Arc::new(AtomicBool::new(false));
        let generation = Arc::new(AtomicU64::new(0));

        let task = PlayerTask {
            transport: Arc::clone(&transport),
            palette,
            finished_tx,
            playing: Arc::clone(&playing),
            waiting: Arc::clone(&waiting),
            generation: Arc::clone(&generation),
            pending_ready: None,
        };
        tokio::spawn(task.run(cmd_rx, cancel));

        Self { cmd_tx, transport, playing, waiting, generation }
    }

    /// Queue an audio stream for playback.
    pub fn play_stream(&self, audio: Bytes, kind: PlaybackKind) {
        // Mark playing at enqueue so state checks right after a dispatch see
        // the player as busy.
        self.playing.store(true, Ordering::Relaxed);
        let generation = self.generation.load(Ordering::Relaxed);
        let _ = self.cmd_tx.send(AudioCmd::Play { audio, kind, generation });
    }

    /// Queue an earcon.
    pub fn play_earcon(&self, cue: Earcon) {
        let generation = self.generation.load(Ordering::Relaxed);
        let _ = self.cmd_tx.send(AudioCmd::PlayEarcon { cue, generation });
    }

    /// Start the waiting-tone loop.
    pub fn start_waiting_loop(&self) {
        self.waiting.store(true, Ordering::Relaxed);
    }

    /// Stop the waiting-tone loop.
    pub fn stop_waiting_loop(&self) {
        self.waiting.store(false, Ordering::Relaxed);
    }

    /// Stop playback immediately and drop anything queued before this call.
    pub async fn stop_playback(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.playing.store(false, Ordering::Relaxed);
        if let Err(e) = self.transport.stop().await {
            warn!("transport stop failed: {e}");
        }
    }

    /// Whether a stream or earcon is currently playing (or queued).
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    /// Whether the waiting-tone loop is active.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Relaxed)
    }
}

/// A `ready` cue held back for its coalescing window.
#[derive(Debug, Clone, Copy)]
struct PendingReady {
    requested_at: Instant,
    generation: u64,
}

struct PlayerTask {
    transport: Arc<dyn VoiceTransport>,
    palette: Arc<EarconPalette>,
    finished_tx: mpsc::UnboundedSender<PlaybackFinished>,
    playing: Arc<AtomicBool>,
    waiting: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    /// A held-back `ready` cue; a newer `ready` inside the window replaces
    /// it, so the later cue is the one heard.
    pending_ready: Option<PendingReady>,
}

impl PlayerTask {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<AudioCmd>, cancel: CancellationToken) {
        let waiting_wav: Bytes = match waiting_tone() {
            Ok(wav) => Bytes::from(wav),
            Err(e) => {
                warn!("waiting tone render failed: {e}");
                Bytes::new()
            }
        };

        let mut last_tone: Option<Instant> = None;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => break,
                    }
                }
                () = tokio::time::sleep(Duration::from_millis(50)) => {
                    self.flush_ready_if_due().await;
                    if self.waiting.load(Ordering::Relaxed)
                        && last_tone.is_none_or(|t| t.elapsed() >= WAITING_LOOP_GAP)
                        && !waiting_wav.is_empty()
                    {
                        last_tone = Some(Instant::now());
                        if let Err(e) = self.transport.play(waiting_wav.clone()).await {
                            debug!("waiting tone playback failed: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn handle(&mut self, cmd: AudioCmd) {
        let current_gen = self.generation.load(Ordering::Relaxed);
        match cmd {
            AudioCmd::Play { audio, kind, generation } => {
                self.flush_pending_ready().await;
                if generation < current_gen {
                    // Stopped before it reached the player.
                    let _ = self.finished_tx.send(PlaybackFinished { kind });
                    return;
                }
                self.playing.store(true, Ordering::Relaxed);
                if let Err(e) = self.play(audio).await {
                    warn!("playback failed: {e}");
                }
                // Notify before clearing the flag so state checks racing the
                // completion never see a speaking pipeline with a dead player.
                let _ = self.finished_tx.send(PlaybackFinished { kind });
                self.playing.store(false, Ordering::Relaxed);
            }
            AudioCmd::PlayEarcon { cue: Earcon::Ready, generation } => {
                if generation < current_gen {
                    return;
                }
                // Held back for the coalescing window: two `ready` requests
                // inside the window play only the later one.
                self.pending_ready =
                    Some(PendingReady { requested_at: Instant::now(), generation });
            }
            AudioCmd::PlayEarcon { cue, generation } => {
                self.flush_pending_ready().await;
                if generation < current_gen {
                    return;
                }
                let wav = Bytes::copy_from_slice(self.palette.get(cue));
                if let Err(e) = self.play(wav).await {
                    warn!("earcon {} playback failed: {e}", cue.name());
                }
            }
        }
    }

    /// Play a held-back `ready` cue once its window passes unsuperseded.
    async fn flush_ready_if_due(&mut self) {
        if self
            .pending_ready
            .is_some_and(|p| p.requested_at.elapsed() >= READY_COALESCE_WINDOW)
        {
            self.flush_pending_ready().await;
        }
    }

    /// Play any held-back `ready` cue now, keeping it ordered before the
    /// next stream or earcon.
    async fn flush_pending_ready(&mut self) {
        let Some(pending) = self.pending_ready.take() else {
            return;
        };
        if pending.generation < self.generation.load(Ordering::Relaxed) {
            return;
        }
        let wav = Bytes::copy_from_slice(self.palette.get(Earcon::Ready));
        if let Err(e) = self.play(wav).await {
            warn!("earcon ready playback failed: {e}");
        }
    }

    async fn play(&self, audio: Bytes) -> Result<()> {
        if audio.is_empty() {
            return Ok(());
        }
        self.transport.play(audio).await
    }
}
