//! The voice pipeline orchestrator.
//!
//! The only component that talks to STT, TTS, the gateway, the router, the
//! queue, the state machine, and the audio adapter. All mutable pipeline
//! state lives on one task: collaborators feed it through channels and it
//! processes messages strictly serially, so every utterance runs the full
//! admission → transcription → classification → effect pipeline without
//! interleaving.

use crate::audio::{AudioAdapter, PlaybackFinished, PlaybackKind};
use crate::commands::{self, QueueChoice, SwitchChoice, VoiceCommand};
use crate::config::{VoiceSettings, WatsonConfig};
use crate::contracts::{ContractId, contract};
use crate::depmon::{self, Dependency, DependencyStatus};
use crate::earcons::{Earcon, EarconPalette};
use crate::error::Result;
use crate::gateway::{
    ChatGateway, ChatMessage, VOICE_ASSISTANT_LABEL, VOICE_USER_LABEL,
};
use crate::health::{CounterSnapshot, HealthCounters, HealthSnapshot, HealthState};
use crate::pipeline::context::{PendingPrompt, PipelineContext};
use crate::pipeline::messages::Utterance;
use crate::pipeline::state::{
    NewPostStep, PipelineEvent, PipelineState, StateMachine, StateType, TransitionEffect,
};
use crate::queue::inbox::now_ms;
use crate::queue::poller::{self, ReadyNotice, summarize};
use crate::queue::{InboxChannel, InboxTracker, ItemStatus, QueueMode, QueueStore, QueuedItem};
use crate::stt::SttClient;
use crate::transcript::SessionTranscript;
use crate::transport::VoiceTransport;
use crate::tts::TtsClient;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wake-check prompt grace window.
const PROMPT_GRACE: Duration = Duration::from_secs(15);

/// Ready-grace window after a switch-choice read.
const READY_GRACE: Duration = Duration::from_secs(5);

/// Cooldown for the gate-closed / near-miss cues.
const FAILED_WAKE_COOLDOWN: Duration = Duration::from_secs(10);

/// Prompt guard after a new-post flow timeout.
const NEW_POST_GUARD: Duration = Duration::from_secs(8);

/// Echo suppression window after playback completes.
const ECHO_WINDOW: Duration = Duration::from_secs(3);

/// Gap between cues on the earcon tour.
const EARCON_TOUR_GAP: Duration = Duration::from_millis(150);

/// External collaborators injected into the pipeline.
pub struct PipelineDeps {
    /// Chat gateway.
    pub gateway: Arc<dyn ChatGateway>,
    /// STT backend.
    pub stt: Arc<dyn SttClient>,
    /// TTS backend.
    pub tts: Arc<dyn TtsClient>,
    /// Voice transport.
    pub transport: Arc<dyn VoiceTransport>,
}

/// Messages fed to the orchestrator task.
#[derive(Debug)]
enum PipelineMsg {
    Utterance(Utterance),
    NotifyIfIdle(String),
    DispatchDone {
        item_id: Option<String>,
        generation: u64,
        result: std::result::Result<String, String>,
    },
}

/// Cloneable control surface over a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    msg_tx: mpsc::UnboundedSender<PipelineMsg>,
    counters: Arc<HealthCounters>,
    health: Arc<HealthState>,
    voice: Arc<Mutex<VoiceSettings>>,
    cancel: CancellationToken,
}

impl PipelineHandle {
    /// Feed one segmented utterance.
    pub fn handle_utterance(&self, user_id: &str, wav: Vec<u8>, duration_ms: u64) {
        let _ = self.msg_tx.send(PipelineMsg::Utterance(Utterance {
            user_id: user_id.to_owned(),
            wav,
            duration_ms,
        }));
    }

    /// Speak an announcement if the pipeline is idle.
    pub fn notify_if_idle(&self, message: &str) {
        let _ = self.msg_tx.send(PipelineMsg::NotifyIfIdle(message.to_owned()));
    }

    /// Copy the counters.
    #[must_use]
    pub fn get_counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Build a health snapshot.
    #[must_use]
    pub fn get_health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot(&self.counters)
    }

    /// Live voice settings (shared with the segmenter owner).
    #[must_use]
    pub fn voice_settings(&self) -> Arc<Mutex<VoiceSettings>> {
        Arc::clone(&self.voice)
    }

    /// Request shutdown.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// The voice pipeline.
///
/// Construct with [`VoicePipeline::new`] (inside a Tokio runtime), grab a
/// [`PipelineHandle`], then drive with [`VoicePipeline::run`].
pub struct VoicePipeline {
    config: WatsonConfig,
    voice: Arc<Mutex<VoiceSettings>>,
    machine: StateMachine,
    ctx: PipelineContext,
    counters: Arc<HealthCounters>,
    health: Arc<HealthState>,
    audio: AudioAdapter,
    router: crate::channels::ChannelRouter,
    queue: Arc<Mutex<QueueStore>>,
    inbox: InboxTracker,
    gateway: Arc<dyn ChatGateway>,
    stt: Arc<dyn SttClient>,
    tts: Arc<dyn TtsClient>,
    transcript: SessionTranscript,
    msg_tx: mpsc::UnboundedSender<PipelineMsg>,
    msg_rx: Option<mpsc::UnboundedReceiver<PipelineMsg>>,
    playback_rx: Option<mpsc::UnboundedReceiver<PlaybackFinished>>,
    ready_tx: mpsc::UnboundedSender<ReadyNotice>,
    ready_rx: Option<mpsc::UnboundedReceiver<ReadyNotice>>,
    dep_rx: Option<mpsc::UnboundedReceiver<DependencyStatus>>,
    poller: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl VoicePipeline {
    /// Build the pipeline and spawn its support tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when the earcon palette or the session transcript
    /// cannot be created.
    pub fn new(config: WatsonConfig, deps: PipelineDeps) -> Result<Self> {
        let cancel = CancellationToken::new();
        let counters = Arc::new(HealthCounters::default());
        let health = Arc::new(HealthState::default());
        let voice = Arc::new(Mutex::new(config.voice.clone()));

        let palette = Arc::new(EarconPalette::render()?);
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let audio = AudioAdapter::spawn(
            Arc::clone(&deps.transport),
            palette,
            playback_tx,
            cancel.child_token(),
        );

        let queue = Arc::new(Mutex::new(QueueStore::load(config.queue.state_path.clone())));
        let inbox = InboxTracker::new(Arc::clone(&deps.gateway), Arc::clone(&queue));
        let router = crate::channels::ChannelRouter::new(
            config.agent_id.0.clone(),
            &config.channels,
            Arc::clone(&deps.gateway),
            Arc::clone(&deps.transport),
        );
        let transcript = SessionTranscript::create(&config.transcript.dir)?;

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (dep_tx, dep_rx) = mpsc::unbounded_channel();

        if config.depmon.enabled {
            depmon::spawn(
                config.depmon.clone(),
                config.stt.url.clone(),
                config.tts.url.clone(),
                dep_tx,
                cancel.child_token(),
            );
        }

        crate::health::spawn_monitor(
            Arc::clone(&health),
            Arc::clone(&counters),
            Duration::from_millis(config.health.interval_ms),
            Duration::from_millis(config.health.state_age_alert_ms),
            None,
            cancel.child_token(),
        );

        Ok(Self {
            config,
            voice,
            machine: StateMachine::new(),
            ctx: PipelineContext::default(),
            counters,
            health,
            audio,
            router,
            queue,
            inbox,
            gateway: deps.gateway,
            stt: deps.stt,
            tts: deps.tts,
            transcript,
            msg_tx,
            msg_rx: Some(msg_rx),
            playback_rx: Some(playback_rx),
            ready_tx,
            ready_rx: Some(ready_rx),
            dep_rx: Some(dep_rx),
            poller: None,
            cancel,
        })
    }

    /// The control handle.
    #[must_use]
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            msg_tx: self.msg_tx.clone(),
            counters: Arc::clone(&self.counters),
            health: Arc::clone(&self.health),
            voice: Arc::clone(&self.voice),
            cancel: self.cancel.clone(),
        }
    }

    /// Run until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline was started twice.
    pub async fn run(mut self) -> Result<()> {
        info!("voice pipeline starting ({})", self.config.bot_name.0);

        let mut msg_rx = self
            .msg_rx
            .take()
            .ok_or_else(|| crate::error::VoiceError::Pipeline("pipeline already ran".into()))?;
        let mut playback_rx = self
            .playback_rx
            .take()
            .ok_or_else(|| crate::error::VoiceError::Pipeline("pipeline already ran".into()))?;
        let mut ready_rx = self
            .ready_rx
            .take()
            .ok_or_else(|| crate::error::VoiceError::Pipeline("pipeline already ran".into()))?;
        let mut dep_rx = self
            .dep_rx
            .take()
            .ok_or_else(|| crate::error::VoiceError::Pipeline("pipeline already ran".into()))?;

        // Baselines for channels the inbox has never seen.
        let fresh: Vec<InboxChannel> = self
            .inbox_channels()
            .into_iter()
            .filter(|c| lock(&self.queue).snapshot(&c.session_key).is_none())
            .collect();
        if !fresh.is_empty() {
            self.inbox.activate(&fresh);
        }

        // Items left pending by a previous run.
        if !lock(&self.queue).pending_items().is_empty() {
            self.ensure_poller();
        }

        let mut tick = tokio::time::interval(Duration::from_millis(
            self.config.watchdog.tick_interval_ms.max(50),
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(msg) = msg_rx.recv() => {
                    match msg {
                        PipelineMsg::Utterance(u) => self.on_utterance(u).await,
                        PipelineMsg::NotifyIfIdle(text) => self.notify_if_idle(&text).await,
                        PipelineMsg::DispatchDone { item_id, generation, result } => {
                            self.on_dispatch_done(item_id, generation, result).await;
                        }
                    }
                }
                Some(finished) = playback_rx.recv() => self.on_playback(finished.kind),
                Some(notice) = ready_rx.recv() => self.on_queue_ready(notice).await,
                Some(status) = dep_rx.recv() => self.on_dependency(status).await,
                _ = tick.tick() => self.on_tick().await,
            }
            self.after_event();
        }

        self.teardown();
        info!("voice pipeline stopped");
        Ok(())
    }

    fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.audio.stop_waiting_loop();
        self.machine.destroy();
        self.ctx.reset();
        self.health.set_state(StateType::Idle.name());
        // Counters are never reset here.
    }

    // -----------------------------------------------------------------------
    // Utterance pipeline (admission → STT → filters → routing)
    // -----------------------------------------------------------------------

    async fn on_utterance(&mut self, utterance: Utterance) {
        self.counters.incr_utterances();
        let entry_state = self.machine.state_type();

        // State admission: a turn in flight buffers the newcomer.
        if matches!(entry_state, StateType::Processing | StateType::Speaking) {
            let effects = self.machine.transition(PipelineEvent::UtteranceReceived);
            self.apply_effects(effects).await;
            self.machine.buffer_utterance(utterance);
            return;
        }

        let effects = self.machine.transition(PipelineEvent::UtteranceReceived);
        self.apply_effects(effects).await;
        let awaiting = entry_state.is_awaiting_input();

        let text = match self.stt.transcribe(&utterance.wav).await {
            Ok(t) => t,
            Err(e) => {
                warn!("stt failed: {e}");
                self.counters.incr_stt_failures();
                self.counters.incr_errors();
                self.audio.play_earcon(Earcon::Error);
                let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
                return;
            }
        };

        if self.machine.state_type() == StateType::Transcribing {
            let _ = self
                .machine
                .transition(PipelineEvent::TranscriptReady { text: text.clone() });
        }

        let text = text.trim().to_owned();
        debug!("transcript: {text:?}");

        // Non-lexical output and playback echo are dropped silently.
        if commands::is_non_lexical(&text) || self.is_echo(&text) {
            self.drop_current_input(awaiting);
            return;
        }

        let now = Instant::now();

        // Post-timeout guard: a fresh turn right after a new-post expiry is
        // almost always the lost title/body, not a new prompt.
        if self.ctx.new_post_timeout_guard_until.is_some_and(|t| now < t) {
            self.audio.play_earcon(Earcon::Error);
            self.speak_feedback("Post creation timed out. Say new post to start again.")
                .await;
            self.drop_current_input(awaiting);
            return;
        }

        let bot = self.config.bot_name.0.clone();
        let wake = commands::matches_wake_word(&text, &bot);

        // Gated admission: menus and the inbox iteration are always
        // wake-free; idle-state input needs the wake word outside the grace
        // windows.
        let gated = lock_voice(&self.voice).gated;
        if gated
            && !wake
            && !awaiting
            && entry_state == StateType::Idle
            && !self.ctx.in_grace(now)
        {
            if self.ctx.failed_wake_cue_until.is_none_or(|t| now >= t) {
                self.audio.play_earcon(Earcon::GateClosed);
                self.ctx.failed_wake_cue_until = Some(now + FAILED_WAKE_COOLDOWN);
            }
            let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
            return;
        }

        // Near-miss wake: a single error cue per cooldown, then drop.
        if !wake && !awaiting && commands::near_miss_wake(&text, &bot) {
            if !self.ctx.missed_wake_analysis_in_flight {
                self.ctx.missed_wake_analysis_in_flight = true;
                if self.ctx.failed_wake_cue_until.is_none_or(|t| now >= t) {
                    self.audio.play_earcon(Earcon::Error);
                    self.ctx.failed_wake_cue_until = Some(now + FAILED_WAKE_COOLDOWN);
                }
                self.ctx.missed_wake_analysis_in_flight = false;
            }
            let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
            return;
        }

        if awaiting {
            self.handle_awaiting_input(&text, &utterance.user_id).await;
            return;
        }

        // The inbox iteration accepts bare choice words, no wake word.
        if self.machine.state_type() == StateType::InboxFlow
            && self.handle_inbox_flow_input(&text).await
        {
            return;
        }

        if let Some(cmd) = commands::parse_voice_command(&text, &bot) {
            self.counters.incr_commands();
            self.handle_command(cmd, &utterance.user_id).await;
            return;
        }

        if self.machine.state_type() == StateType::InboxFlow {
            // Free text inside the inbox iteration: nudge instead of
            // dispatching a prompt mid-flow.
            self.audio.play_earcon(Earcon::Error);
            self.speak_feedback("Say next, clear inbox, or go back.").await;
            return;
        }

        // Prompt path. In gated mode a wake word (or grace window) got us
        // here; strip the prefix when present.
        let prompt = commands::wake_tail(&text, &bot)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| text.clone());

        if gated && !wake && self.ctx.gate_grace_until.is_some_and(|t| now < t) {
            // Ready-grace prompt: consume the window.
            self.ctx.gate_grace_until = None;
        }

        self.handle_prompt(&utterance.user_id, &prompt).await;
    }

    /// Dropped input: resume menu timers or put the machine back to idle.
    fn drop_current_input(&mut self, awaiting: bool) {
        if awaiting {
            self.machine.resume_awaiting_timers();
        } else if matches!(
            self.machine.state_type(),
            StateType::Transcribing | StateType::Processing
        ) {
            let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
        }
    }

    fn is_echo(&self, text: &str) -> bool {
        let Some(completed_at) = self.ctx.last_playback_completed_at else {
            return false;
        };
        if completed_at.elapsed() > ECHO_WINDOW {
            return false;
        }
        let Some(last) = &self.ctx.last_playback_text else {
            return false;
        };
        let heard = normalize_echo(text);
        let spoken = normalize_echo(last);
        if heard.len() < 4 {
            return false;
        }
        spoken.starts_with(&heard) || heard.starts_with(&spoken)
    }

    // -----------------------------------------------------------------------
    // Awaiting-state input
    // -----------------------------------------------------------------------

    async fn handle_awaiting_input(&mut self, text: &str, user_id: &str) {
        match self.machine.state().clone() {
            PipelineState::AwaitingQueueChoice { .. } => {
                if let Some(choice) = commands::match_queue_choice(text) {
                    self.apply_queue_choice(choice).await;
                    return;
                }
            }
            PipelineState::AwaitingSwitchChoice { last_message, .. } => {
                if let Some(choice) = commands::match_switch_choice(text) {
                    self.apply_switch_choice(choice, last_message).await;
                    return;
                }
            }
            PipelineState::AwaitingChannelSelection { options, .. } => {
                if let Some(idx) = commands::match_channel_selection(text, &options) {
                    self.apply_channel_selection(&options[idx]).await;
                    return;
                }
            }
            PipelineState::NewPostFlow { step, forum_id, title, .. } => {
                if self.handle_new_post_input(step, forum_id, title, text).await {
                    return;
                }
            }
            _ => {}
        }

        // Global navigation commands exit any menu.
        let bot = self.config.bot_name.0.clone();
        if let Some(cmd) = commands::parse_voice_command(text, &bot)
            && matches!(
                cmd,
                VoiceCommand::Switch { .. }
                    | VoiceCommand::List
                    | VoiceCommand::Default
                    | VoiceCommand::InboxCheck
            )
        {
            self.counters.incr_commands();
            let _ = self.machine.transition(PipelineEvent::ProcessingStarted);
            self.handle_command(cmd, user_id).await;
            return;
        }

        // Unrecognized: the machine reprompts and restarts its timers.
        let effects = self
            .machine
            .transition(PipelineEvent::AwaitingInputReceived { recognized: false });
        if self.ctx.reject_reprompt_in_flight {
            // A reprompt is already queued; keep the cue + timer reset only.
            let effects: Vec<TransitionEffect> = effects
                .into_iter()
                .filter(|e| !matches!(e, TransitionEffect::Speak(_)))
                .collect();
            self.apply_effects(effects).await;
        } else {
            self.ctx.reject_reprompt_in_flight = true;
            self.apply_effects(effects).await;
        }
    }

    async fn apply_queue_choice(&mut self, choice: QueueChoice) {
        match choice {
            QueueChoice::Queue | QueueChoice::Silent => {
                self.audio.play_earcon(Earcon::Acknowledged);
                self.ctx.speculative_queue_item_id = None;
                self.ctx.deferred_wait_response_text = None;
                let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
                self.audio.play_earcon(Earcon::Ready);
            }
            QueueChoice::Wait => {
                self.audio.play_earcon(Earcon::Acknowledged);
                let item_id = self.ctx.speculative_queue_item_id.take();

                // Speculative dispatch already resolved: deliver now.
                if let Some(text) = self.ctx.deferred_wait_response_text.take() {
                    if let Some(id) = &item_id {
                        lock(&self.queue).mark_heard(id);
                    }
                    let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
                    self.speak_response(&text).await;
                    return;
                }

                let Some(id) = item_id else {
                    let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
                    self.audio.play_earcon(Earcon::Ready);
                    return;
                };

                let ready_text = lock(&self.queue)
                    .item(&id)
                    .filter(|i| i.status == ItemStatus::Ready)
                    .map(|i| i.response_text.clone());
                if let Some(text) = ready_text {
                    lock(&self.queue).mark_heard(&id);
                    let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
                    self.speak_response(&text).await;
                } else {
                    // Hold the line: idle, waiting loop on, single-shot wait
                    // armed on this item.
                    self.ctx.active_wait_queue_item_id = Some(id);
                    let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
                    if self.ctx.silent_wait {
                        self.ctx.silent_wait = false;
                    } else {
                        self.audio.start_waiting_loop();
                    }
                }
            }
            QueueChoice::Cancel => {
                self.ctx.speculative_queue_item_id = None;
                self.ctx.deferred_wait_response_text = None;
                let effects = self.machine.transition(PipelineEvent::CancelFlow);
                self.apply_effects(effects).await;
            }
        }
    }

    async fn apply_switch_choice(&mut self, choice: SwitchChoice, last_message: Option<String>) {
        match choice {
            SwitchChoice::Read => {
                self.audio.play_earcon(Earcon::Acknowledged);
                let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
                match last_message {
                    Some(msg) => self.speak_feedback(&msg).await,
                    None => self.speak_feedback("There's nothing to read.").await,
                }
                // Follow-up prompts may arrive wake-free for a short window.
                self.ctx.gate_grace_until = Some(Instant::now() + READY_GRACE);
                self.audio.play_earcon(Earcon::Ready);
            }
            SwitchChoice::Prompt => {
                self.audio.play_earcon(Earcon::Acknowledged);
                let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
                self.ctx.prompt_grace_until = Some(Instant::now() + PROMPT_GRACE);
                self.speak_feedback("Go ahead.").await;
            }
            SwitchChoice::Cancel => {
                let effects = self.machine.transition(PipelineEvent::CancelFlow);
                self.apply_effects(effects).await;
            }
        }
    }

    async fn apply_channel_selection(&mut self, name: &str) {
        self.audio.play_earcon(Earcon::Acknowledged);
        let _ = self.machine.transition(PipelineEvent::ProcessingStarted);
        let name = name.to_owned();
        let outcome = self.router.switch_to(&name).await;
        if outcome.success {
            let display = outcome.display_name.unwrap_or(name);
            self.speak_feedback(&format!("Switched to {display}.")).await;
        } else {
            self.speak_feedback("That channel didn't work.").await;
        }
        let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
        self.audio.play_earcon(Earcon::Ready);
    }

    async fn handle_new_post_input(
        &mut self,
        step: NewPostStep,
        forum_id: Option<String>,
        title: Option<String>,
        text: &str,
    ) -> bool {
        match step {
            NewPostStep::Forum => {
                let Some(forum) = self.router.find_forum(text) else {
                    return false;
                };
                let forum_id = forum.channel_id.clone();
                let forum_name = forum.display_name.clone();
                self.audio.play_earcon(Earcon::Acknowledged);
                let _ = self.machine.transition(PipelineEvent::NewPostAdvance {
                    step: NewPostStep::Title,
                    forum_id: Some(forum_id),
                    forum_name: Some(forum_name),
                    title: None,
                });
                self.speak_feedback(contract(ContractId::NewPostTitle).reprompt_text).await;
                true
            }
            NewPostStep::Title => {
                self.audio.play_earcon(Earcon::Acknowledged);
                let _ = self.machine.transition(PipelineEvent::ProcessingStarted);
                self.create_post(forum_id.as_deref().unwrap_or_default(), text).await;
                true
            }
            NewPostStep::Body => {
                self.audio.play_earcon(Earcon::Acknowledged);
                let _ = self.machine.transition(PipelineEvent::ProcessingStarted);
                let combined = match title {
                    Some(t) => format!("{t}. {text}"),
                    None => text.to_owned(),
                };
                self.create_post(forum_id.as_deref().unwrap_or_default(), &combined).await;
                true
            }
        }
    }

    async fn create_post(&mut self, forum_id: &str, title: &str) {
        match self.router.create_forum_post(forum_id, title).await {
            Ok(name) => {
                self.speak_feedback(&format!("Created {name}.")).await;
            }
            Err(e) => {
                warn!("forum post failed: {e}");
                self.counters.incr_errors();
                self.audio.play_earcon(Earcon::Error);
                self.speak_feedback("I couldn't create the post.").await;
            }
        }
        let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
        self.audio.play_earcon(Earcon::Ready);
    }

    // -----------------------------------------------------------------------
    // Command handlers (normative table)
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: VoiceCommand, _user_id: &str) {
        match cmd {
            VoiceCommand::WakeCheck => {
                self.ctx.prompt_grace_until = Some(Instant::now() + PROMPT_GRACE);
                self.finish_command();
            }
            VoiceCommand::Switch { channel } => {
                let outcome = self.router.switch_to(&channel).await;
                if outcome.success {
                    let display = outcome.display_name.clone().unwrap_or_else(|| channel.clone());
                    self.speak_feedback(&format!("Switched to {display}.")).await;
                    let last = self.router.last_message_text(self.router.active());
                    if let Some(last) = last {
                        let _ = self.machine.transition(PipelineEvent::EnterSwitchChoice {
                            last_message: Some(last),
                            timeout_ms: None,
                        });
                        self.speak_feedback(
                            "There's a recent message here. Say read, or prompt.",
                        )
                        .await;
                    } else {
                        self.finish_command();
                    }
                } else {
                    self.speak_feedback(&format!("I couldn't find {channel}.")).await;
                    let options: Vec<String> = self
                        .router
                        .recent_channels(6)
                        .iter()
                        .map(|d| d.name.clone())
                        .collect();
                    if options.is_empty() {
                        self.finish_command();
                    } else {
                        let menu = options.join(", ");
                        let _ = self.machine.transition(PipelineEvent::EnterChannelSelection {
                            options,
                            timeout_ms: None,
                        });
                        self.speak_feedback(&format!("You can switch to: {menu}.")).await;
                    }
                }
            }
            VoiceCommand::List => {
                let names: Vec<String> = self
                    .router
                    .defs()
                    .iter()
                    .enumerate()
                    .map(|(i, d)| format!("{}: {}", i + 1, d.display_name))
                    .collect();
                if names.is_empty() {
                    self.speak_feedback("No channels are configured.").await;
                } else {
                    self.speak_feedback(&format!("Channels: {}.", names.join(", "))).await;
                }
                self.finish_command();
            }
            VoiceCommand::Default => {
                if self.machine.state_type() == StateType::InboxFlow {
                    // "done" inside the inbox iteration advances it.
                    self.handle_inbox_next().await;
                    return;
                }
                let outcome = self.router.switch_to_default().await;
                let display = outcome.display_name.unwrap_or_else(|| "the default channel".into());
                self.speak_feedback(&format!("Back to {display}.")).await;
                self.finish_command();
            }
            VoiceCommand::Noise { level } => {
                lock_voice(&self.voice).noise = level;
                self.speak_feedback(&format!("Noise set to {}.", level.spoken())).await;
                self.finish_command();
            }
            VoiceCommand::Delay { value_ms } => {
                lock_voice(&self.voice).delay_ms = value_ms;
                self.speak_feedback(&format!("Delay set to {} seconds.", value_ms / 1000))
                    .await;
                self.finish_command();
            }
            VoiceCommand::DelayAdjust { longer } => {
                let delay = {
                    let mut voice = lock_voice(&self.voice);
                    voice.delay_ms = if longer {
                        (voice.delay_ms + 500).min(10_000)
                    } else {
                        voice.delay_ms.saturating_sub(500).max(200)
                    };
                    voice.delay_ms
                };
                self.speak_feedback(&format!(
                    "Delay is now {:.1} seconds.",
                    delay as f64 / 1000.0
                ))
                .await;
                self.finish_command();
            }
            VoiceCommand::Settings => {
                self.speak_feedback(
                    "You can say: noise low, medium or high; delay in seconds; \
                     gated mode on or off; or wait, inbox, or ask mode.",
                )
                .await;
                self.finish_command();
            }
            VoiceCommand::Mode { mode } => {
                lock(&self.queue).set_mode(mode);
                self.speak_feedback(&format!("{} mode.", capitalize(mode.spoken()))).await;
                self.finish_command();
            }
            VoiceCommand::InboxCheck => {
                self.handle_inbox_check().await;
            }
            VoiceCommand::InboxNext => {
                self.handle_inbox_next().await;
            }
            VoiceCommand::InboxClear => {
                self.handle_inbox_clear().await;
            }
            VoiceCommand::ReadLastMessage => {
                let last = self.router.last_message_text(self.router.active());
                match last {
                    Some(text) => self.speak_feedback(&text).await,
                    None => self.speak_feedback("Nothing to read yet.").await,
                }
                self.finish_command();
            }
            VoiceCommand::VoiceStatus => {
                let summary = self.status_summary();
                self.speak_feedback(&summary).await;
                self.finish_command();
            }
            VoiceCommand::Pause => {
                self.audio.stop_playback().await;
                self.audio.stop_waiting_loop();
                self.ctx.pending_wait_generation = None;
                self.ctx.pending_wait_prompt = None;
                self.ctx.active_wait_queue_item_id = None;
                self.finish_command();
            }
            VoiceCommand::Replay => {
                let last = self.ctx.last_playback_text.clone();
                match last {
                    Some(text) => self.speak_feedback(&text).await,
                    None => self.speak_feedback("I haven't said anything yet.").await,
                }
                self.finish_command();
            }
            VoiceCommand::GatedMode { on } => {
                lock_voice(&self.voice).gated = on;
                self.speak_feedback(if on { "Gated mode on." } else { "Gated mode off." })
                    .await;
                self.finish_command();
            }
            VoiceCommand::NewPost => {
                if self.router.forums().is_empty() {
                    self.speak_feedback("No forum channels available.").await;
                    self.finish_command();
                } else {
                    let _ = self.machine.transition(PipelineEvent::EnterNewPostFlow {
                        step: NewPostStep::Forum,
                        forum_id: None,
                        forum_name: None,
                        title: None,
                        timeout_ms: None,
                    });
                    self.speak_feedback(contract(ContractId::NewPostForum).reprompt_text).await;
                }
            }
            VoiceCommand::EarconTour => {
                for cue in Earcon::ALL {
                    self.audio.play_earcon(cue);
                    tokio::time::sleep(EARCON_TOUR_GAP).await;
                }
                self.finish_command();
            }
            VoiceCommand::SilentWait => {
                self.ctx.silent_wait = true;
                self.audio.play_earcon(Earcon::Acknowledged);
                self.finish_command();
            }
            VoiceCommand::Dispatch { body } => {
                self.handle_dispatch(&body).await;
            }
        }
    }

    /// Command epilogue: back to idle with a ready cue, unless the handler
    /// entered a flow or menu.
    fn finish_command(&mut self) {
        match self.machine.state_type() {
            StateType::Processing | StateType::Transcribing => {
                let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
                self.audio.play_earcon(Earcon::Ready);
            }
            StateType::Idle => self.audio.play_earcon(Earcon::Ready),
            _ => {}
        }
    }

    fn status_summary(&self) -> String {
        let voice = lock_voice(&self.voice).clone();
        let mode = lock(&self.queue).mode();
        let active = self
            .router
            .active_def()
            .map_or_else(|| self.router.active().to_owned(), |d| d.display_name.clone());
        format!(
            "{} mode. Gated {}. Noise {}. Delay {:.1} seconds. Active channel {active}.",
            capitalize(mode.spoken()),
            if voice.gated { "on" } else { "off" },
            voice.noise.spoken(),
            voice.delay_ms as f64 / 1000.0,
        )
    }

    async fn handle_dispatch(&mut self, body: &str) {
        let Some((channel, payload)) = parse_dispatch_body(body) else {
            self.speak_feedback("Say dispatch, the channel name, then the message.").await;
            self.finish_command();
            return;
        };
        let Some(def) = self.router.def(&channel).cloned() else {
            self.speak_feedback(&format!("I don't know a channel called {channel}.")).await;
            self.finish_command();
            return;
        };

        let session_key = def.session_key(&self.config.agent_id.0);
        let item_id = self.enqueue_prompt(&def.name, &def.display_name, &session_key, &payload);
        self.spawn_item_dispatch(&item_id, &def.name, &payload);
        self.speak_feedback(&format!("Dispatched to {}.", def.display_name)).await;
        self.finish_command();
    }

    // -----------------------------------------------------------------------
    // Inbox flow
    // -----------------------------------------------------------------------

    /// Bare inbox-iteration words ("next", "done", "clear", "go back").
    /// Returns `true` when the input was consumed.
    async fn handle_inbox_flow_input(&mut self, text: &str) -> bool {
        match commands::normalize(text).as_str() {
            "next" | "next one" | "next item" | "skip" | "done" | "okay" | "ok" | "yes" => {
                self.handle_inbox_next().await;
                true
            }
            "clear" | "clear inbox" | "clear the inbox" | "dismiss all" => {
                self.handle_inbox_clear().await;
                true
            }
            "go back" | "back" | "stop" | "exit" | "cancel" => {
                let PipelineState::InboxFlow { return_channel, .. } = self.machine.state().clone()
                else {
                    return false;
                };
                let effects = self.machine.transition(PipelineEvent::CancelFlow);
                self.apply_effects(effects).await;
                if let Some(rc) = return_channel
                    && rc != self.router.active()
                {
                    let _ = self.router.switch_to(&rc).await;
                }
                true
            }
            _ => false,
        }
    }

    fn inbox_channels(&self) -> Vec<InboxChannel> {
        let agent = self.config.agent_id.0.clone();
        self.router
            .defs()
            .iter()
            .map(|d| InboxChannel {
                name: d.name.clone(),
                display_name: d.display_name.clone(),
                session_key: d.session_key(&agent),
            })
            .collect()
    }

    async fn handle_inbox_check(&mut self) {
        let channels = self.inbox_channels();
        let activities = match self.inbox.check_inbox(&channels).await {
            Ok(a) => a,
            Err(e) => {
                warn!("inbox check failed: {e}");
                self.counters.incr_errors();
                self.audio.play_earcon(Earcon::Error);
                self.finish_command();
                return;
            }
        };

        if activities.is_empty() {
            self.speak_feedback("Nothing new.").await;
            self.finish_command();
            return;
        }

        let names: Vec<String> = activities.iter().map(|a| a.display_name.clone()).collect();
        let summary = format!(
            "New activity in {}. Say next to step through.",
            names.join(", ")
        );
        let return_channel = Some(self.router.active().to_owned());
        let _ = self.machine.transition(PipelineEvent::EnterInboxFlow {
            items: activities,
            return_channel,
        });
        self.speak_feedback(&summary).await;
    }

    async fn handle_inbox_next(&mut self) {
        let PipelineState::InboxFlow { items, index, return_channel } =
            self.machine.state().clone()
        else {
            self.speak_feedback("The inbox isn't open. Say inbox first.").await;
            self.finish_command();
            return;
        };

        if index >= items.len() {
            self.finish_inbox(return_channel).await;
            return;
        }

        let item = items[index].clone();
        let _ = self.router.switch_to(&item.channel).await;
        self.inbox.mark_seen(&item.session_key);

        let mut spoken = format!("{}. ", item.display_name);
        if item.new_count > 0 {
            spoken.push_str(&crate::queue::format_for_tts(&item.new_messages));
        }
        if item.ready_count > 0 {
            let ready: Vec<QueuedItem> = lock(&self.queue)
                .items()
                .iter()
                .filter(|i| i.session_key == item.session_key && i.status == ItemStatus::Ready)
                .cloned()
                .collect();
            for r in &ready {
                spoken.push_str(&format!(" Queued response: {}", r.summary));
                lock(&self.queue).mark_heard(&r.id);
            }
        }
        self.speak_feedback(spoken.trim()).await;

        let _ = self.machine.transition(PipelineEvent::InboxAdvance);
        if index + 1 >= items.len() {
            self.finish_inbox(return_channel).await;
        }
    }

    async fn handle_inbox_clear(&mut self) {
        if let PipelineState::InboxFlow { items, index, return_channel } =
            self.machine.state().clone()
        {
            for item in items.iter().skip(index) {
                self.inbox.mark_seen(&item.session_key);
            }
            let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
            if let Some(rc) = return_channel
                && rc != self.router.active()
            {
                let _ = self.router.switch_to(&rc).await;
            }
            self.speak_feedback("Inbox cleared.").await;
            self.audio.play_earcon(Earcon::Ready);
        } else {
            self.speak_feedback("Inbox is clear.").await;
            self.finish_command();
        }
    }

    async fn finish_inbox(&mut self, return_channel: Option<String>) {
        let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
        if let Some(rc) = return_channel
            && rc != self.router.active()
        {
            let _ = self.router.switch_to(&rc).await;
        }
        self.speak_feedback("That's everything.").await;
        self.audio.play_earcon(Earcon::Ready);
    }

    // -----------------------------------------------------------------------
    // Prompt dispatch (wait / queue / ask)
    // -----------------------------------------------------------------------

    async fn handle_prompt(&mut self, user_id: &str, prompt: &str) {
        let mode = lock(&self.queue).mode();
        match mode {
            QueueMode::Wait => self.start_wait_dispatch(user_id, prompt).await,
            QueueMode::Queue => {
                let (def_name, display, session_key) = self.active_channel_coords();
                let item_id = self.enqueue_prompt(&def_name, &display, &session_key, prompt);
                self.spawn_item_dispatch(&item_id, &def_name, prompt);
                self.audio.play_earcon(Earcon::Acknowledged);
                self.speak_feedback(&format!("Queued to {display}.")).await;
                let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
            }
            QueueMode::Ask => {
                let (def_name, display, session_key) = self.active_channel_coords();
                let item_id = self.enqueue_prompt(&def_name, &display, &session_key, prompt);
                self.spawn_item_dispatch(&item_id, &def_name, prompt);
                self.ctx.speculative_queue_item_id = Some(item_id);
                let _ = self.machine.transition(PipelineEvent::EnterQueueChoice {
                    user_id: user_id.to_owned(),
                    transcript: prompt.to_owned(),
                    timeout_ms: None,
                });
                self.speak_feedback("Queue that, or wait for the answer?").await;
            }
        }
    }

    fn active_channel_coords(&self) -> (String, String, String) {
        let name = self.router.active().to_owned();
        let (display, key) = match self.router.active_def() {
            Some(def) => (def.display_name.clone(), def.session_key(&self.config.agent_id.0)),
            None => (
                name.clone(),
                format!("agent:{}:discord:channel:{name}", self.config.agent_id.0),
            ),
        };
        (name, display, key)
    }

    async fn start_wait_dispatch(&mut self, user_id: &str, prompt: &str) {
        let (channel, _display, session_key) = self.active_channel_coords();
        let _ = self.machine.transition(PipelineEvent::ProcessingStarted);

        // Single-shot: re-arming cancels any previous wait.
        let generation = self.ctx.next_generation();
        self.ctx.pending_wait_generation = Some(generation);
        self.ctx.pending_wait_prompt = Some(PendingPrompt {
            channel: channel.clone(),
            session_key,
            user_id: user_id.to_owned(),
            text: prompt.to_owned(),
        });

        if self.ctx.silent_wait {
            self.ctx.silent_wait = false;
        } else {
            self.audio.start_waiting_loop();
        }

        let messages = self.build_messages(&channel, prompt);
        let gateway = Arc::clone(&self.gateway);
        let msg_tx = self.msg_tx.clone();
        let user = user_id.to_owned();
        self.counters.incr_dispatches();
        tokio::spawn(async move {
            let result = gateway
                .complete(&messages, &user)
                .await
                .map_err(|e| e.to_string());
            let _ = msg_tx.send(PipelineMsg::DispatchDone { item_id: None, generation, result });
        });
    }

    fn enqueue_prompt(
        &mut self,
        channel: &str,
        display: &str,
        session_key: &str,
        prompt: &str,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        lock(&self.queue).enqueue(QueuedItem {
            id: id.clone(),
            channel: channel.to_owned(),
            display_name: display.to_owned(),
            session_key: session_key.to_owned(),
            user_message: prompt.to_owned(),
            summary: String::new(),
            response_text: String::new(),
            timestamp: now_ms(),
            status: ItemStatus::Pending,
        });

        // Mirror the prompt into the target session right away.
        let gateway = Arc::clone(&self.gateway);
        let key = session_key.to_owned();
        let text = prompt.to_owned();
        tokio::spawn(async move {
            if let Err(e) = gateway.inject(&key, &text, Some(VOICE_USER_LABEL)).await {
                debug!("voice-user mirror failed: {e}");
            }
        });
        self.transcript.append("user", prompt, Some(channel));

        self.ensure_poller();
        id
    }

    fn spawn_item_dispatch(&mut self, item_id: &str, channel: &str, prompt: &str) {
        let messages = self.build_messages(channel, prompt);
        let gateway = Arc::clone(&self.gateway);
        let msg_tx = self.msg_tx.clone();
        let generation = self.ctx.next_generation();
        let item_id = item_id.to_owned();
        self.counters.incr_dispatches();
        tokio::spawn(async move {
            let result = gateway
                .complete(&messages, "voice")
                .await
                .map_err(|e| e.to_string());
            let _ = msg_tx.send(PipelineMsg::DispatchDone {
                item_id: Some(item_id),
                generation,
                result,
            });
        });
    }

    fn build_messages(&self, channel: &str, prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        let mut system = format!(
            "You are {}, a voice assistant. Answer briefly; your reply is read aloud.",
            self.config.bot_name.0
        );
        if let Some(topic) = self.router.def(channel).and_then(|d| d.topic_prompt.clone()) {
            system.push(' ');
            system.push_str(&topic);
        }
        messages.push(ChatMessage { role: "system".to_owned(), content: system });

        if let Some(history) = self.router.history(channel) {
            for entry in history.entries() {
                if entry.role == crate::channels::Role::System {
                    continue;
                }
                messages.push(ChatMessage {
                    role: entry.role.as_str().to_owned(),
                    content: entry.content.clone(),
                });
            }
        }

        messages.push(ChatMessage { role: "user".to_owned(), content: prompt.to_owned() });
        messages
    }

    // -----------------------------------------------------------------------
    // Dispatch completions
    // -----------------------------------------------------------------------

    async fn on_dispatch_done(
        &mut self,
        item_id: Option<String>,
        generation: u64,
        result: std::result::Result<String, String>,
    ) {
        match item_id {
            None => self.on_wait_dispatch_done(generation, result).await,
            Some(id) => self.on_item_dispatch_done(&id, result).await,
        }
    }

    async fn on_wait_dispatch_done(
        &mut self,
        generation: u64,
        result: std::result::Result<String, String>,
    ) {
        if self.ctx.pending_wait_generation != Some(generation) {
            debug!("stale wait dispatch {generation} ignored");
            return;
        }
        self.ctx.pending_wait_generation = None;
        self.audio.stop_waiting_loop();
        let Some(pending) = self.ctx.pending_wait_prompt.take() else {
            return;
        };

        match result {
            Ok(response) => {
                self.router.record_user(&pending.channel, &pending.text);
                self.router.record_assistant(&pending.channel, &response);
                self.mirror_turn(&pending.session_key, &pending.text, &response);
                self.transcript.append("user", &pending.text, Some(&pending.channel));
                self.transcript.append("assistant", &response, Some(&pending.channel));
                self.speak_response(&response).await;
            }
            Err(e) => {
                warn!("wait dispatch failed: {e}");
                self.counters.incr_errors();
                self.audio.play_earcon(Earcon::Error);
                self.speak_feedback("Sorry, that request didn't go through.").await;
                let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
            }
        }
    }

    async fn on_item_dispatch_done(
        &mut self,
        item_id: &str,
        result: std::result::Result<String, String>,
    ) {
        let item = lock(&self.queue).item(item_id).cloned();
        let Some(item) = item else {
            return;
        };

        match result {
            Ok(response) => {
                lock(&self.queue).mark_ready(item_id, &summarize(&response), &response);
                let gateway = Arc::clone(&self.gateway);
                let key = item.session_key.clone();
                let text = response.clone();
                tokio::spawn(async move {
                    if let Err(e) = gateway.inject(&key, &text, Some(VOICE_ASSISTANT_LABEL)).await
                    {
                        debug!("voice-assistant mirror failed: {e}");
                    }
                });
                self.transcript.append("assistant", &response, Some(&item.channel));

                if self.ctx.active_wait_queue_item_id.as_deref() == Some(item_id) {
                    // The user is holding the line for exactly this item.
                    self.ctx.active_wait_queue_item_id = None;
                    self.audio.stop_waiting_loop();
                    lock(&self.queue).mark_heard(item_id);
                    self.speak_response(&response).await;
                } else if self.machine.state_type() == StateType::AwaitingQueueChoice
                    && self.ctx.speculative_queue_item_id.as_deref() == Some(item_id)
                {
                    // Resolved before the user chose: keep it hot.
                    self.ctx.deferred_wait_response_text = Some(response);
                } else if self.machine.state_type() == StateType::Idle {
                    self.notify_if_idle(&format!("Response ready in {}.", item.display_name))
                        .await;
                }
            }
            Err(e) => {
                warn!("dispatch for {item_id} failed: {e}");
                self.counters.incr_errors();
                if self.ctx.active_wait_queue_item_id.as_deref() == Some(item_id) {
                    self.ctx.active_wait_queue_item_id = None;
                    self.audio.stop_waiting_loop();
                    self.audio.play_earcon(Earcon::Error);
                    self.speak_feedback("Sorry, that request didn't go through.").await;
                    let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
                }
                // Otherwise the poller may still catch a late gateway reply.
            }
        }
    }

    fn mirror_turn(&self, session_key: &str, user_text: &str, assistant_text: &str) {
        let gateway = Arc::clone(&self.gateway);
        let key = session_key.to_owned();
        let user_text = user_text.to_owned();
        let assistant_text = assistant_text.to_owned();
        tokio::spawn(async move {
            if let Err(e) = gateway.inject(&key, &user_text, Some(VOICE_USER_LABEL)).await {
                debug!("voice-user mirror failed: {e}");
            }
            if let Err(e) = gateway
                .inject(&key, &assistant_text, Some(VOICE_ASSISTANT_LABEL))
                .await
            {
                debug!("voice-assistant mirror failed: {e}");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Periodic work and notifications
    // -----------------------------------------------------------------------

    async fn on_tick(&mut self) {
        let was_new_post = self.machine.state_type() == StateType::NewPostFlow;
        let effects = self.machine.tick();
        if !effects.is_empty() {
            let timed_out = self.machine.state_type() == StateType::Idle;
            if was_new_post && timed_out {
                self.ctx.new_post_timeout_guard_until = Some(Instant::now() + NEW_POST_GUARD);
            }
            self.apply_effects(effects).await;
        }

        // Stall watchdog.
        if let Some(deadline) = self.ctx.stall_deadline
            && Instant::now() >= deadline
        {
            warn!(
                "stall watchdog fired in state {}",
                self.machine.state_type().name()
            );
            self.counters.incr_stall_fires();
            self.audio.play_earcon(Earcon::Error);
            self.audio.stop_waiting_loop();
            let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
            let generation = self.ctx.dispatch_generation;
            self.ctx.reset();
            self.ctx.dispatch_generation = generation;
        }
    }

    async fn notify_if_idle(&mut self, message: &str) {
        if self.machine.state_type() != StateType::Idle || self.ctx.idle_notify_in_flight {
            return;
        }
        self.ctx.idle_notify_in_flight = true;
        match self.tts.synthesize(message).await {
            Ok(audio) => {
                self.ctx.last_playback_text = Some(message.to_owned());
                self.audio.play_stream(audio, PlaybackKind::Notify);
            }
            Err(e) => {
                warn!("notify synth failed: {e}");
                self.counters.incr_tts_failures();
                self.counters.incr_errors();
                self.ctx.idle_notify_in_flight = false;
            }
        }
    }

    async fn on_queue_ready(&mut self, notice: ReadyNotice) {
        if self.ctx.active_wait_queue_item_id.as_deref() == Some(notice.id.as_str()) {
            // The poller beat the dispatch callback to it.
            let text = lock(&self.queue).item(&notice.id).map(|i| i.response_text.clone());
            if let Some(text) = text {
                self.ctx.active_wait_queue_item_id = None;
                self.audio.stop_waiting_loop();
                lock(&self.queue).mark_heard(&notice.id);
                self.speak_response(&text).await;
            }
            return;
        }
        self.notify_if_idle(&format!("Response ready in {}.", notice.display_name)).await;
    }

    async fn on_dependency(&mut self, status: DependencyStatus) {
        self.health.set_dependency(status.dep, status.up);
        match status.dep {
            Dependency::Stt => {
                if status.up {
                    self.ctx.stt_down_announced = false;
                } else if !self.ctx.stt_down_announced {
                    self.ctx.stt_down_announced = true;
                    self.speak_feedback("Speech recognition is unavailable.").await;
                }
            }
            Dependency::Tts => {
                if status.up {
                    self.ctx.tts_down_announced = false;
                } else if !self.ctx.tts_down_announced {
                    self.ctx.tts_down_announced = true;
                    self.audio.play_earcon(Earcon::Error);
                    self.speak_feedback("Voice output is unavailable.").await;
                }
            }
        }
    }

    fn on_playback(&mut self, kind: PlaybackKind) {
        self.ctx.last_playback_completed_at = Some(Instant::now());
        match kind {
            PlaybackKind::Response => {
                if self.machine.state_type() == StateType::Speaking {
                    let _ = self.machine.transition(PipelineEvent::SpeakingComplete);
                    self.audio.play_earcon(Earcon::Ready);
                }
            }
            PlaybackKind::Feedback => {
                self.ctx.reject_reprompt_in_flight = false;
            }
            PlaybackKind::Notify => {
                self.ctx.idle_notify_in_flight = false;
            }
        }
    }

    /// Post-event bookkeeping: watchdog arming, health state, invariant
    /// audit, buffered-utterance drain.
    fn after_event(&mut self) {
        let st = self.machine.state_type();
        if self.ctx.prev_state != Some(st) {
            self.ctx.prev_state = Some(st);
            self.health.set_state(st.name());
            self.ctx.stall_deadline = if st == StateType::Idle {
                None
            } else {
                Some(Instant::now() + Duration::from_millis(self.config.watchdog.stall_timeout_ms))
            };
            if st == StateType::Idle {
                self.ctx.reject_reprompt_in_flight = false;
            }
        }
        // Idle drains one buffered utterance per event, even when the state
        // never left idle during the event.
        if st == StateType::Idle
            && let Some(buffered) = self.machine.take_buffered_utterance()
        {
            let _ = self.msg_tx.send(PipelineMsg::Utterance(buffered));
        }
        self.audit_invariants();
    }

    fn audit_invariants(&self) {
        let st = self.machine.state_type();
        if st.is_awaiting_input() && !self.machine.has_active_timers() {
            warn!("invariant violation: {} without active timers", st.name());
            self.counters.incr_invariant_violations();
        }
        if st == StateType::Speaking && !self.audio.is_playing() && !self.audio.is_waiting() {
            warn!("invariant violation: speaking without playback");
            self.counters.incr_invariant_violations();
        }
        if st == StateType::Idle
            && self.audio.is_waiting()
            && self.ctx.pending_wait_generation.is_none()
            && self.ctx.active_wait_queue_item_id.is_none()
        {
            warn!("invariant violation: idle with waiting loop and no pending wait");
            self.counters.incr_invariant_violations();
        }
    }

    fn ensure_poller(&mut self) {
        let running = self.poller.as_ref().is_some_and(|p| !p.is_finished());
        if running {
            return;
        }
        self.poller = Some(poller::spawn(
            Arc::clone(&self.queue),
            Arc::clone(&self.gateway),
            self.ready_tx.clone(),
            Duration::from_millis(self.config.queue.poll_interval_ms),
            self.cancel.child_token(),
        ));
    }

    // -----------------------------------------------------------------------
    // Effect application and speech
    // -----------------------------------------------------------------------

    async fn apply_effects(&mut self, effects: Vec<TransitionEffect>) {
        for effect in effects {
            match effect {
                TransitionEffect::Earcon(cue) => self.audio.play_earcon(cue),
                TransitionEffect::Speak(text) => self.speak_feedback(&text).await,
                TransitionEffect::StopPlayback => self.audio.stop_playback().await,
                TransitionEffect::StartWaitingLoop => self.audio.start_waiting_loop(),
                TransitionEffect::StopWaitingLoop => self.audio.stop_waiting_loop(),
            }
        }
    }

    /// Speak a short confirmation/prompt without entering `Speaking`.
    async fn speak_feedback(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.tts.synthesize(text).await {
            Ok(audio) => {
                self.ctx.last_playback_text = Some(text.to_owned());
                self.audio.play_stream(audio, PlaybackKind::Feedback);
            }
            Err(e) => {
                warn!("feedback synth failed: {e}");
                self.counters.incr_tts_failures();
                self.counters.incr_errors();
                self.audio.play_earcon(Earcon::Error);
            }
        }
    }

    /// Speak the main response: `Speaking` until the player drains.
    async fn speak_response(&mut self, text: &str) {
        match self.tts.synthesize(text).await {
            Ok(audio) => {
                let _ = self.machine.transition(PipelineEvent::SpeakingStarted);
                self.ctx.last_playback_text = Some(text.to_owned());
                self.audio.play_stream(audio, PlaybackKind::Response);
            }
            Err(e) => {
                warn!("response synth failed: {e}");
                self.counters.incr_tts_failures();
                self.counters.incr_errors();
                self.audio.play_earcon(Earcon::Error);
                let _ = self.machine.transition(PipelineEvent::ReturnToIdle);
            }
        }
    }
}

fn lock(queue: &Arc<Mutex<QueueStore>>) -> std::sync::MutexGuard<'_, QueueStore> {
    queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock_voice(voice: &Arc<Mutex<VoiceSettings>>) -> std::sync::MutexGuard<'_, VoiceSettings> {
    voice.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Normalize text for the echo prefix comparison.
fn normalize_echo(text: &str) -> String {
    text.chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c.to_ascii_lowercase())
            } else if c.is_whitespace() {
                Some(' ')
            } else {
                None
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a dispatch body into `(channel, payload)`.
fn parse_dispatch_body(body: &str) -> Option<(String, String)> {
    let body = body.trim();
    let body = body.strip_prefix("to ").unwrap_or(body);
    let (first, rest) = body.split_once(char::is_whitespace)?;
    let channel = first.trim_end_matches(':').to_lowercase();
    let payload = rest.trim();
    if channel.is_empty() || payload.is_empty() {
        return None;
    }
    Some((channel, payload.to_owned()))
}
