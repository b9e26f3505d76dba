//! The pipeline state machine.
//!
//! A single sum-typed state, a sum-typed event set, and transitions that
//! return ordered effect lists for the orchestrator to apply. The machine is
//! synchronous and pure apart from deadline bookkeeping: contract warning and
//! timeout deadlines are stored as instants and fired by the orchestrator's
//! periodic tick, so every path is deterministic under test.

use crate::contracts::{ContractId, WARNING_LEAD, contract};
use crate::earcons::Earcon;
use crate::pipeline::messages::Utterance;
use crate::queue::InboxActivity;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

/// Bounded utterance buffer size; the oldest entry is dropped beyond this.
const UTTERANCE_BUFFER_CAP: usize = 3;

/// Step of the guided forum-post flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewPostStep {
    /// Choosing the forum.
    Forum,
    /// Dictating the title.
    Title,
    /// Dictating the body.
    Body,
}

impl NewPostStep {
    fn contract_id(self) -> ContractId {
        match self {
            Self::Forum => ContractId::NewPostForum,
            Self::Title => ContractId::NewPostTitle,
            Self::Body => ContractId::NewPostBody,
        }
    }
}

/// Current pipeline state.
#[derive(Debug, Clone)]
pub enum PipelineState {
    /// Nothing in flight.
    Idle,
    /// An utterance is at the STT backend.
    Transcribing,
    /// A transcript is being classified / dispatched.
    Processing,
    /// A response is playing.
    Speaking,
    /// Waiting for a numbered/named channel pick.
    AwaitingChannelSelection {
        /// Offered channel names, menu order.
        options: Vec<String>,
        /// When the prompt opened.
        entered_at: Instant,
        /// Contract expiry for this instance, ms.
        timeout_ms: u64,
        /// Whether the pre-expiry warning already fired.
        warning_fired: bool,
    },
    /// Waiting for queue / wait / cancel after an ask-mode prompt.
    AwaitingQueueChoice {
        /// Speaker the prompt came from.
        user_id: String,
        /// The original prompt transcript.
        transcript: String,
        /// When the prompt opened.
        entered_at: Instant,
        /// Contract expiry for this instance, ms.
        timeout_ms: u64,
        /// Whether the pre-expiry warning already fired.
        warning_fired: bool,
    },
    /// Waiting for read / prompt / cancel after a channel switch.
    AwaitingSwitchChoice {
        /// Most recent message in the switched channel, if any.
        last_message: Option<String>,
        /// When the prompt opened.
        entered_at: Instant,
        /// Contract expiry for this instance, ms.
        timeout_ms: u64,
        /// Whether the pre-expiry warning already fired.
        warning_fired: bool,
    },
    /// Guided forum-post creation.
    NewPostFlow {
        /// Current step.
        step: NewPostStep,
        /// Resolved forum id once chosen.
        forum_id: Option<String>,
        /// Resolved forum display name once chosen.
        forum_name: Option<String>,
        /// Captured title once dictated.
        title: Option<String>,
        /// When the current step opened.
        entered_at: Instant,
        /// Contract expiry for this step, ms.
        timeout_ms: u64,
        /// Whether the pre-expiry warning already fired.
        warning_fired: bool,
    },
    /// Iterating inbox activities.
    InboxFlow {
        /// Activities, oldest first.
        items: Vec<InboxActivity>,
        /// Current position.
        index: usize,
        /// Channel to restore when iteration ends.
        return_channel: Option<String>,
    },
}

/// Discriminant of [`PipelineState`], for logging and health snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateType {
    /// See [`PipelineState::Idle`].
    Idle,
    /// See [`PipelineState::Transcribing`].
    Transcribing,
    /// See [`PipelineState::Processing`].
    Processing,
    /// See [`PipelineState::Speaking`].
    Speaking,
    /// See [`PipelineState::AwaitingChannelSelection`].
    AwaitingChannelSelection,
    /// See [`PipelineState::AwaitingQueueChoice`].
    AwaitingQueueChoice,
    /// See [`PipelineState::AwaitingSwitchChoice`].
    AwaitingSwitchChoice,
    /// See [`PipelineState::NewPostFlow`].
    NewPostFlow,
    /// See [`PipelineState::InboxFlow`].
    InboxFlow,
}

impl StateType {
    /// Whether the state waits on user input under a contract (and must
    /// therefore hold active timers).
    #[must_use]
    pub fn is_awaiting_input(self) -> bool {
        matches!(
            self,
            Self::AwaitingChannelSelection
                | Self::AwaitingQueueChoice
                | Self::AwaitingSwitchChoice
                | Self::NewPostFlow
        )
    }

    /// Short label for logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Transcribing => "transcribing",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::AwaitingChannelSelection => "awaiting-channel-selection",
            Self::AwaitingQueueChoice => "awaiting-queue-choice",
            Self::AwaitingSwitchChoice => "awaiting-switch-choice",
            Self::NewPostFlow => "new-post-flow",
            Self::InboxFlow => "inbox-flow",
        }
    }
}

impl PipelineState {
    /// The state's discriminant.
    #[must_use]
    pub fn state_type(&self) -> StateType {
        match self {
            Self::Idle => StateType::Idle,
            Self::Transcribing => StateType::Transcribing,
            Self::Processing => StateType::Processing,
            Self::Speaking => StateType::Speaking,
            Self::AwaitingChannelSelection { .. } => StateType::AwaitingChannelSelection,
            Self::AwaitingQueueChoice { .. } => StateType::AwaitingQueueChoice,
            Self::AwaitingSwitchChoice { .. } => StateType::AwaitingSwitchChoice,
            Self::NewPostFlow { .. } => StateType::NewPostFlow,
            Self::InboxFlow { .. } => StateType::InboxFlow,
        }
    }

    /// Contract governing the current awaiting state, if any.
    #[must_use]
    pub fn contract_id(&self) -> Option<ContractId> {
        match self {
            Self::AwaitingChannelSelection { .. } => Some(ContractId::ChannelSelection),
            Self::AwaitingQueueChoice { .. } => Some(ContractId::QueueChoice),
            Self::AwaitingSwitchChoice { .. } => Some(ContractId::SwitchChoice),
            Self::NewPostFlow { step, .. } => Some(step.contract_id()),
            _ => None,
        }
    }

    fn warning_fired_mut(&mut self) -> Option<&mut bool> {
        match self {
            Self::AwaitingChannelSelection { warning_fired, .. }
            | Self::AwaitingQueueChoice { warning_fired, .. }
            | Self::AwaitingSwitchChoice { warning_fired, .. }
            | Self::NewPostFlow { warning_fired, .. } => Some(warning_fired),
            _ => None,
        }
    }

    fn awaiting_fields_mut(&mut self) -> Option<(&mut Instant, &mut u64, &mut bool)> {
        match self {
            Self::AwaitingChannelSelection { entered_at, timeout_ms, warning_fired, .. }
            | Self::AwaitingQueueChoice { entered_at, timeout_ms, warning_fired, .. }
            | Self::AwaitingSwitchChoice { entered_at, timeout_ms, warning_fired, .. }
            | Self::NewPostFlow { entered_at, timeout_ms, warning_fired, .. } => {
                Some((entered_at, timeout_ms, warning_fired))
            }
            _ => None,
        }
    }
}

/// Events fed to the machine.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// An utterance arrived from the segmenter.
    UtteranceReceived,
    /// Transcription finished.
    TranscriptReady {
        /// The transcript (carried for logging; classification happens in
        /// the orchestrator).
        text: String,
    },
    /// Classification / dispatch began.
    ProcessingStarted,
    /// Classification / dispatch finished without speech.
    ProcessingComplete,
    /// Response playback began.
    SpeakingStarted,
    /// Response playback finished.
    SpeakingComplete,
    /// Open the channel-selection menu.
    EnterChannelSelection {
        /// Offered channel names.
        options: Vec<String>,
        /// Timeout override, ms.
        timeout_ms: Option<u64>,
    },
    /// Open the queue-choice menu.
    EnterQueueChoice {
        /// Speaker the prompt came from.
        user_id: String,
        /// The original prompt transcript.
        transcript: String,
        /// Timeout override, ms.
        timeout_ms: Option<u64>,
    },
    /// Open the switch-choice menu.
    EnterSwitchChoice {
        /// Most recent message in the switched channel.
        last_message: Option<String>,
        /// Timeout override, ms.
        timeout_ms: Option<u64>,
    },
    /// Open (or re-open) the forum-post flow.
    EnterNewPostFlow {
        /// Starting step.
        step: NewPostStep,
        /// Pre-resolved forum id.
        forum_id: Option<String>,
        /// Pre-resolved forum name.
        forum_name: Option<String>,
        /// Pre-captured title.
        title: Option<String>,
        /// Timeout override, ms.
        timeout_ms: Option<u64>,
    },
    /// Advance the forum-post flow to a new step.
    NewPostAdvance {
        /// New step.
        step: NewPostStep,
        /// Forum id carried forward.
        forum_id: Option<String>,
        /// Forum name carried forward.
        forum_name: Option<String>,
        /// Title carried forward.
        title: Option<String>,
    },
    /// Begin inbox iteration.
    EnterInboxFlow {
        /// Activities, oldest first.
        items: Vec<InboxActivity>,
        /// Channel to restore afterwards.
        return_channel: Option<String>,
    },
    /// Step the inbox iteration.
    InboxAdvance,
    /// An input was classified while a menu was open.
    AwaitingInputReceived {
        /// Whether it matched an accepted intent.
        recognized: bool,
    },
    /// Poll timer deadlines.
    TimeoutCheck,
    /// Abandon the current flow with a cancelled cue.
    CancelFlow,
    /// Unconditional reset to idle.
    ReturnToIdle,
}

/// One side effect the orchestrator must apply, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionEffect {
    /// Play a named cue.
    Earcon(Earcon),
    /// Speak text via TTS.
    Speak(String),
    /// Stop current playback immediately.
    StopPlayback,
    /// Start the waiting-tone loop.
    StartWaitingLoop,
    /// Stop the waiting-tone loop.
    StopWaitingLoop,
}

/// Deadline slots for the current awaiting state.
#[derive(Debug, Clone, Copy)]
struct AwaitTimers {
    /// When the pre-expiry warning fires (cleared once fired).
    warning_at: Option<Instant>,
    /// Hard expiry.
    timeout_at: Instant,
    /// Firing is suspended while an in-flight utterance is classified;
    /// deadlines keep their instants.
    suspended: bool,
}

/// The pipeline state machine.
pub struct StateMachine {
    state: PipelineState,
    timers: Option<AwaitTimers>,
    buffered: VecDeque<Utterance>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// A fresh machine at idle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            timers: None,
            buffered: VecDeque::new(),
        }
    }

    /// Current state (read-only).
    #[must_use]
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Current state discriminant.
    #[must_use]
    pub fn state_type(&self) -> StateType {
        self.state.state_type()
    }

    /// Whether warning/timeout timers are scheduled.
    ///
    /// Holds exactly when the state awaits input: suspension (while an
    /// utterance classifies) does not deschedule the timers.
    #[must_use]
    pub fn has_active_timers(&self) -> bool {
        self.timers.is_some()
    }

    /// Buffer an utterance that arrived while a turn was in flight.
    ///
    /// At most three are held; a fourth pushes out the oldest.
    pub fn buffer_utterance(&mut self, utterance: Utterance) {
        if self.buffered.len() >= UTTERANCE_BUFFER_CAP {
            let _ = self.buffered.pop_front();
        }
        self.buffered.push_back(utterance);
    }

    /// Pop the oldest buffered utterance.
    pub fn take_buffered_utterance(&mut self) -> Option<Utterance> {
        self.buffered.pop_front()
    }

    /// Number of buffered utterances.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Feed one event.
    pub fn transition(&mut self, event: PipelineEvent) -> Vec<TransitionEffect> {
        self.transition_at(event, Instant::now())
    }

    /// Deterministic transition entry point (`now` injected).
    pub fn transition_at(&mut self, event: PipelineEvent, now: Instant) -> Vec<TransitionEffect> {
        match event {
            PipelineEvent::UtteranceReceived => self.on_utterance(),
            PipelineEvent::TranscriptReady { .. } => {
                if matches!(self.state, PipelineState::Transcribing) {
                    self.state = PipelineState::Processing;
                } else {
                    warn!(
                        "transcript arrived in state {}, ignored",
                        self.state_type().name()
                    );
                }
                Vec::new()
            }
            PipelineEvent::ProcessingStarted => {
                self.clear_timers();
                self.state = PipelineState::Processing;
                Vec::new()
            }
            PipelineEvent::ProcessingComplete
            | PipelineEvent::SpeakingComplete
            | PipelineEvent::ReturnToIdle => {
                self.clear_timers();
                self.state = PipelineState::Idle;
                Vec::new()
            }
            PipelineEvent::SpeakingStarted => {
                self.clear_timers();
                self.state = PipelineState::Speaking;
                Vec::new()
            }
            PipelineEvent::EnterChannelSelection { options, timeout_ms } => {
                let timeout = self.resolve_timeout(ContractId::ChannelSelection, timeout_ms);
                self.state = PipelineState::AwaitingChannelSelection {
                    options,
                    entered_at: now,
                    timeout_ms: timeout,
                    warning_fired: false,
                };
                self.schedule(now, timeout);
                Vec::new()
            }
            PipelineEvent::EnterQueueChoice { user_id, transcript, timeout_ms } => {
                let timeout = self.resolve_timeout(ContractId::QueueChoice, timeout_ms);
                self.state = PipelineState::AwaitingQueueChoice {
                    user_id,
                    transcript,
                    entered_at: now,
                    timeout_ms: timeout,
                    warning_fired: false,
                };
                self.schedule(now, timeout);
                Vec::new()
            }
            PipelineEvent::EnterSwitchChoice { last_message, timeout_ms } => {
                let timeout = self.resolve_timeout(ContractId::SwitchChoice, timeout_ms);
                self.state = PipelineState::AwaitingSwitchChoice {
                    last_message,
                    entered_at: now,
                    timeout_ms: timeout,
                    warning_fired: false,
                };
                self.schedule(now, timeout);
                Vec::new()
            }
            PipelineEvent::EnterNewPostFlow { step, forum_id, forum_name, title, timeout_ms } => {
                let timeout = self.resolve_timeout(step.contract_id(), timeout_ms);
                self.state = PipelineState::NewPostFlow {
                    step,
                    forum_id,
                    forum_name,
                    title,
                    entered_at: now,
                    timeout_ms: timeout,
                    warning_fired: false,
                };
                self.schedule(now, timeout);
                Vec::new()
            }
            PipelineEvent::NewPostAdvance { step, forum_id, forum_name, title } => {
                let timeout = self.resolve_timeout(step.contract_id(), None);
                self.state = PipelineState::NewPostFlow {
                    step,
                    forum_id,
                    forum_name,
                    title,
                    entered_at: now,
                    timeout_ms: timeout,
                    warning_fired: false,
                };
                self.schedule(now, timeout);
                Vec::new()
            }
            PipelineEvent::EnterInboxFlow { items, return_channel } => {
                self.clear_timers();
                self.state = PipelineState::InboxFlow { items, index: 0, return_channel };
                Vec::new()
            }
            PipelineEvent::InboxAdvance => {
                if let PipelineState::InboxFlow { index, .. } = &mut self.state {
                    *index += 1;
                } else {
                    warn!("inbox advance outside inbox flow, ignored");
                }
                Vec::new()
            }
            PipelineEvent::AwaitingInputReceived { recognized } => {
                if !self.state_type().is_awaiting_input() {
                    warn!(
                        "awaiting input event in state {}, ignored",
                        self.state_type().name()
                    );
                    return Vec::new();
                }
                if recognized {
                    return Vec::new();
                }
                let reprompt = self
                    .state
                    .contract_id()
                    .map(|id| contract(id).reprompt_text.to_owned())
                    .unwrap_or_default();
                self.reset_awaiting_timers(now);
                vec![
                    TransitionEffect::Earcon(Earcon::Error),
                    TransitionEffect::Speak(reprompt),
                ]
            }
            PipelineEvent::TimeoutCheck => self.tick_at(now),
            PipelineEvent::CancelFlow => {
                self.clear_timers();
                self.state = PipelineState::Idle;
                vec![TransitionEffect::Earcon(Earcon::Cancelled)]
            }
        }
    }

    fn on_utterance(&mut self) -> Vec<TransitionEffect> {
        match self.state.state_type() {
            StateType::Idle => {
                self.state = PipelineState::Transcribing;
                Vec::new()
            }
            StateType::Processing => vec![TransitionEffect::Earcon(Earcon::Busy)],
            StateType::Speaking => vec![
                TransitionEffect::StopPlayback,
                TransitionEffect::Earcon(Earcon::Busy),
            ],
            s if s.is_awaiting_input() => {
                // Suspend firing while the input classifies; the deadlines
                // keep their instants and resume afterwards.
                if let Some(timers) = &mut self.timers {
                    timers.suspended = true;
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Restart the current contract's timers from `now`.
    ///
    /// Resets `entered_at` and the warning, reschedules the full duration.
    pub fn reset_awaiting_timers(&mut self, now: Instant) {
        let Some((entered_at, timeout_ms, warning_fired)) = self.state.awaiting_fields_mut()
        else {
            return;
        };
        *entered_at = now;
        *warning_fired = false;
        let timeout = *timeout_ms;
        self.schedule(now, timeout);
    }

    /// Resume suspended timers without rescheduling.
    ///
    /// Used when an in-flight input was dropped (empty transcript, echo)
    /// rather than classified: the original deadlines stay authoritative.
    pub fn resume_awaiting_timers(&mut self) {
        if let Some(timers) = &mut self.timers {
            timers.suspended = false;
        }
    }

    /// Poll deadlines.
    pub fn tick(&mut self) -> Vec<TransitionEffect> {
        self.tick_at(Instant::now())
    }

    /// Deterministic deadline poll (`now` injected).
    pub fn tick_at(&mut self, now: Instant) -> Vec<TransitionEffect> {
        if !self.state_type().is_awaiting_input() {
            // Non-awaiting states never hold timers.
            self.timers = None;
            return Vec::new();
        }
        let Some(timers) = self.timers else {
            return Vec::new();
        };
        if timers.suspended {
            return Vec::new();
        }

        if now >= timers.timeout_at {
            let timeout_text = self
                .state
                .contract_id()
                .map(|id| contract(id).timeout_text.to_owned())
                .unwrap_or_default();
            self.clear_timers();
            self.state = PipelineState::Idle;
            return vec![
                TransitionEffect::Earcon(Earcon::Cancelled),
                TransitionEffect::Speak(timeout_text),
            ];
        }

        if let Some(warning_at) = timers.warning_at
            && now >= warning_at
        {
            if let Some(timers) = &mut self.timers {
                timers.warning_at = None;
            }
            if let Some(fired) = self.state.warning_fired_mut()
                && !*fired
            {
                *fired = true;
                return vec![TransitionEffect::Earcon(Earcon::TimeoutWarning)];
            }
        }

        Vec::new()
    }

    /// Clear timers, drop buffered utterances, return to idle. Idempotent.
    pub fn destroy(&mut self) {
        self.clear_timers();
        self.buffered.clear();
        self.state = PipelineState::Idle;
    }

    fn resolve_timeout(&self, id: ContractId, override_ms: Option<u64>) -> u64 {
        override_ms.unwrap_or_else(|| contract(id).default_timeout.as_millis() as u64)
    }

    /// Schedule warning and timeout deadlines, replacing any prior pair.
    fn schedule(&mut self, now: Instant, timeout_ms: u64) {
        let timeout_at = now + Duration::from_millis(timeout_ms);
        let warning_at = if Duration::from_millis(timeout_ms) > WARNING_LEAD {
            Some(timeout_at - WARNING_LEAD)
        } else {
            Some(now)
        };
        self.timers = Some(AwaitTimers {
            warning_at,
            timeout_at,
            suspended: false,
        });
    }

    fn clear_timers(&mut self) {
        self.timers = None;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn enter_queue_choice(sm: &mut StateMachine, now: Instant) {
        let effects = sm.transition_at(
            PipelineEvent::EnterQueueChoice {
                user_id: "u1".to_owned(),
                transcript: "add milk".to_owned(),
                timeout_ms: None,
            },
            now,
        );
        assert!(effects.is_empty());
    }

    fn utterance() -> Utterance {
        Utterance { user_id: "u1".to_owned(), wav: vec![0; 44], duration_ms: 500 }
    }

    // -----------------------------------------------------------------------
    // Basic transitions
    // -----------------------------------------------------------------------

    #[test]
    fn idle_utterance_starts_transcribing() {
        let mut sm = StateMachine::new();
        let effects = sm.transition(PipelineEvent::UtteranceReceived);
        assert!(effects.is_empty());
        assert_eq!(sm.state_type(), StateType::Transcribing);
    }

    #[test]
    fn transcript_moves_to_processing() {
        let mut sm = StateMachine::new();
        sm.transition(PipelineEvent::UtteranceReceived);
        sm.transition(PipelineEvent::TranscriptReady { text: "hello".to_owned() });
        assert_eq!(sm.state_type(), StateType::Processing);
    }

    #[test]
    fn stray_transcript_does_not_mutate() {
        let mut sm = StateMachine::new();
        sm.transition(PipelineEvent::TranscriptReady { text: "hello".to_owned() });
        assert_eq!(sm.state_type(), StateType::Idle);
    }

    #[test]
    fn busy_earcon_while_processing() {
        let mut sm = StateMachine::new();
        sm.transition(PipelineEvent::ProcessingStarted);
        let effects = sm.transition(PipelineEvent::UtteranceReceived);
        assert_eq!(effects, vec![TransitionEffect::Earcon(Earcon::Busy)]);
        assert_eq!(sm.state_type(), StateType::Processing);
    }

    #[test]
    fn speaking_preempts_playback_then_busy() {
        let mut sm = StateMachine::new();
        sm.transition(PipelineEvent::SpeakingStarted);
        let effects = sm.transition(PipelineEvent::UtteranceReceived);
        assert_eq!(
            effects,
            vec![
                TransitionEffect::StopPlayback,
                TransitionEffect::Earcon(Earcon::Busy),
            ]
        );
        assert_eq!(sm.state_type(), StateType::Speaking);
    }

    #[test]
    fn complete_events_return_to_idle() {
        let mut sm = StateMachine::new();
        sm.transition(PipelineEvent::ProcessingStarted);
        sm.transition(PipelineEvent::ProcessingComplete);
        assert_eq!(sm.state_type(), StateType::Idle);

        sm.transition(PipelineEvent::SpeakingStarted);
        sm.transition(PipelineEvent::SpeakingComplete);
        assert_eq!(sm.state_type(), StateType::Idle);
    }

    // -----------------------------------------------------------------------
    // Timer invariants
    // -----------------------------------------------------------------------

    #[test]
    fn awaiting_states_hold_timers_and_idle_does_not() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        assert!(!sm.has_active_timers());

        enter_queue_choice(&mut sm, now);
        assert!(sm.has_active_timers());
        assert_eq!(sm.state_type(), StateType::AwaitingQueueChoice);

        sm.transition_at(PipelineEvent::ReturnToIdle, now);
        assert!(!sm.has_active_timers());
        assert_eq!(sm.state_type(), StateType::Idle);
    }

    #[test]
    fn timers_cleared_on_every_exit_path() {
        let now = Instant::now();
        for exit in [
            PipelineEvent::ProcessingStarted,
            PipelineEvent::ProcessingComplete,
            PipelineEvent::ReturnToIdle,
            PipelineEvent::CancelFlow,
        ] {
            let mut sm = StateMachine::new();
            enter_queue_choice(&mut sm, now);
            assert!(sm.has_active_timers());
            sm.transition_at(exit.clone(), now);
            assert!(!sm.has_active_timers(), "timers survived {exit:?}");
        }
    }

    #[test]
    fn invariant_awaiting_iff_timers_across_event_sweep() {
        let now = Instant::now();
        let events: Vec<PipelineEvent> = vec![
            PipelineEvent::UtteranceReceived,
            PipelineEvent::TranscriptReady { text: "t".to_owned() },
            PipelineEvent::ProcessingStarted,
            PipelineEvent::EnterQueueChoice {
                user_id: "u".to_owned(),
                transcript: "t".to_owned(),
                timeout_ms: None,
            },
            PipelineEvent::UtteranceReceived,
            PipelineEvent::AwaitingInputReceived { recognized: false },
            PipelineEvent::EnterSwitchChoice { last_message: None, timeout_ms: None },
            PipelineEvent::EnterChannelSelection {
                options: vec!["a".to_owned()],
                timeout_ms: None,
            },
            PipelineEvent::EnterNewPostFlow {
                step: NewPostStep::Forum,
                forum_id: None,
                forum_name: None,
                title: None,
                timeout_ms: None,
            },
            PipelineEvent::NewPostAdvance {
                step: NewPostStep::Title,
                forum_id: Some("f".to_owned()),
                forum_name: Some("F".to_owned()),
                title: None,
            },
            PipelineEvent::CancelFlow,
            PipelineEvent::EnterInboxFlow { items: vec![], return_channel: None },
            PipelineEvent::InboxAdvance,
            PipelineEvent::ReturnToIdle,
        ];

        let mut sm = StateMachine::new();
        for event in events {
            sm.transition_at(event.clone(), now);
            assert_eq!(
                sm.state_type().is_awaiting_input(),
                sm.has_active_timers(),
                "invariant broken after {event:?} in {}",
                sm.state_type().name()
            );
        }
    }

    // -----------------------------------------------------------------------
    // Warning and timeout firing
    // -----------------------------------------------------------------------

    #[test]
    fn warning_fires_once_before_timeout() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        enter_queue_choice(&mut sm, now); // 20 s contract

        // Before the warning point: nothing.
        assert!(sm.tick_at(now + Duration::from_secs(10)).is_empty());

        // Past the warning point: exactly one warning cue.
        let effects = sm.tick_at(now + Duration::from_secs(16));
        assert_eq!(effects, vec![TransitionEffect::Earcon(Earcon::TimeoutWarning)]);

        // Never again.
        assert!(sm.tick_at(now + Duration::from_secs(17)).is_empty());
        assert_eq!(sm.state_type(), StateType::AwaitingQueueChoice);
    }

    #[test]
    fn timeout_cancels_with_contract_text() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        enter_queue_choice(&mut sm, now);

        let effects = sm.tick_at(now + Duration::from_secs(21));
        assert_eq!(effects.len(), 2);
        assert_eq!(effects[0], TransitionEffect::Earcon(Earcon::Cancelled));
        let TransitionEffect::Speak(text) = &effects[1] else {
            panic!("expected speak effect, got {:?}", effects[1]);
        };
        assert_eq!(text, contract(ContractId::QueueChoice).timeout_text);
        assert_eq!(sm.state_type(), StateType::Idle);
        assert!(!sm.has_active_timers());

        // Expired timers never fire twice.
        assert!(sm.tick_at(now + Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn timeout_override_is_honored() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        sm.transition_at(
            PipelineEvent::EnterSwitchChoice {
                last_message: None,
                timeout_ms: Some(1_000),
            },
            now,
        );
        let effects = sm.tick_at(now + Duration::from_millis(1_100));
        assert_eq!(effects[0], TransitionEffect::Earcon(Earcon::Cancelled));
        assert_eq!(sm.state_type(), StateType::Idle);
    }

    #[test]
    fn utterance_suspends_firing_until_resume() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        sm.transition_at(
            PipelineEvent::EnterQueueChoice {
                user_id: "u".to_owned(),
                transcript: "t".to_owned(),
                timeout_ms: Some(2_000),
            },
            now,
        );

        // Utterance arrives: timers stay scheduled but suspended.
        sm.transition_at(PipelineEvent::UtteranceReceived, now + Duration::from_millis(500));
        assert!(sm.has_active_timers());
        assert!(sm.tick_at(now + Duration::from_secs(5)).is_empty());
        assert_eq!(sm.state_type(), StateType::AwaitingQueueChoice);

        // Dropped input resumes the original deadlines: expiry fires.
        sm.resume_awaiting_timers();
        let effects = sm.tick_at(now + Duration::from_secs(5));
        assert_eq!(effects[0], TransitionEffect::Earcon(Earcon::Cancelled));
        assert_eq!(sm.state_type(), StateType::Idle);
    }

    #[test]
    fn unrecognized_input_reprompts_and_restarts_timers() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        enter_queue_choice(&mut sm, now);

        // Fire the warning first.
        sm.tick_at(now + Duration::from_secs(16));

        let later = now + Duration::from_secs(18);
        let effects =
            sm.transition_at(PipelineEvent::AwaitingInputReceived { recognized: false }, later);
        assert_eq!(effects[0], TransitionEffect::Earcon(Earcon::Error));
        let TransitionEffect::Speak(text) = &effects[1] else {
            panic!("expected reprompt speak");
        };
        assert_eq!(text, contract(ContractId::QueueChoice).reprompt_text);

        // Timers restarted from `later`: old expiry no longer applies …
        assert!(sm.tick_at(now + Duration::from_secs(21)).is_empty());
        // … the warning can fire again …
        assert_eq!(
            sm.tick_at(later + Duration::from_secs(16)),
            vec![TransitionEffect::Earcon(Earcon::TimeoutWarning)]
        );
        // … and the new expiry is `later + 20 s`.
        let effects = sm.tick_at(later + Duration::from_secs(21));
        assert_eq!(effects[0], TransitionEffect::Earcon(Earcon::Cancelled));
    }

    #[test]
    fn recognized_input_is_a_no_op() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        enter_queue_choice(&mut sm, now);
        let effects =
            sm.transition_at(PipelineEvent::AwaitingInputReceived { recognized: true }, now);
        assert!(effects.is_empty());
        assert_eq!(sm.state_type(), StateType::AwaitingQueueChoice);
    }

    #[test]
    fn cancel_flow_emits_cancelled_cue() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        enter_queue_choice(&mut sm, now);
        let effects = sm.transition_at(PipelineEvent::CancelFlow, now);
        assert_eq!(effects, vec![TransitionEffect::Earcon(Earcon::Cancelled)]);
        assert_eq!(sm.state_type(), StateType::Idle);
    }

    #[test]
    fn short_contract_fires_warning_immediately() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        sm.transition_at(
            PipelineEvent::EnterQueueChoice {
                user_id: "u".to_owned(),
                transcript: "t".to_owned(),
                timeout_ms: Some(3_000),
            },
            now,
        );
        let effects = sm.tick_at(now + Duration::from_millis(1));
        assert_eq!(effects, vec![TransitionEffect::Earcon(Earcon::TimeoutWarning)]);
    }

    // -----------------------------------------------------------------------
    // New-post flow
    // -----------------------------------------------------------------------

    #[test]
    fn new_post_advance_overwrites_step_and_timer() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        sm.transition_at(
            PipelineEvent::EnterNewPostFlow {
                step: NewPostStep::Forum,
                forum_id: None,
                forum_name: None,
                title: None,
                timeout_ms: None,
            },
            now,
        );

        let later = now + Duration::from_secs(10);
        sm.transition_at(
            PipelineEvent::NewPostAdvance {
                step: NewPostStep::Title,
                forum_id: Some("f9".to_owned()),
                forum_name: Some("Ideas".to_owned()),
                title: None,
            },
            later,
        );

        let PipelineState::NewPostFlow { step, forum_id, forum_name, .. } = sm.state() else {
            panic!("expected new-post flow");
        };
        assert_eq!(*step, NewPostStep::Title);
        assert_eq!(forum_id.as_deref(), Some("f9"));
        assert_eq!(forum_name.as_deref(), Some("Ideas"));

        // The title step's own 30 s contract applies from `later`.
        assert!(sm.tick_at(now + Duration::from_secs(31)).is_empty());
        let effects = sm.tick_at(later + Duration::from_secs(31));
        assert_eq!(effects[0], TransitionEffect::Earcon(Earcon::Cancelled));
    }

    #[test]
    fn new_post_body_step_uses_sixty_seconds() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        sm.transition_at(
            PipelineEvent::EnterNewPostFlow {
                step: NewPostStep::Body,
                forum_id: Some("f".to_owned()),
                forum_name: Some("F".to_owned()),
                title: Some("T".to_owned()),
                timeout_ms: None,
            },
            now,
        );
        assert!(sm.tick_at(now + Duration::from_secs(50)).is_empty());
        let effects = sm.tick_at(now + Duration::from_secs(61));
        assert_eq!(effects[0], TransitionEffect::Earcon(Earcon::Cancelled));
    }

    // -----------------------------------------------------------------------
    // Inbox flow
    // -----------------------------------------------------------------------

    #[test]
    fn inbox_flow_has_no_timers_and_advances() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        sm.transition_at(
            PipelineEvent::EnterInboxFlow { items: vec![], return_channel: Some("general".to_owned()) },
            now,
        );
        assert_eq!(sm.state_type(), StateType::InboxFlow);
        assert!(!sm.has_active_timers());

        sm.transition_at(PipelineEvent::InboxAdvance, now);
        let PipelineState::InboxFlow { index, .. } = sm.state() else {
            panic!("expected inbox flow");
        };
        assert_eq!(*index, 1);
    }

    #[test]
    fn inbox_advance_elsewhere_is_ignored() {
        let mut sm = StateMachine::new();
        sm.transition(PipelineEvent::InboxAdvance);
        assert_eq!(sm.state_type(), StateType::Idle);
    }

    // -----------------------------------------------------------------------
    // Utterance buffer
    // -----------------------------------------------------------------------

    #[test]
    fn buffer_caps_at_three_dropping_oldest() {
        let mut sm = StateMachine::new();
        for i in 0..4 {
            let mut u = utterance();
            u.duration_ms = i;
            sm.buffer_utterance(u);
        }
        assert_eq!(sm.buffered_len(), 3);
        assert_eq!(sm.take_buffered_utterance().unwrap().duration_ms, 1);
        assert_eq!(sm.take_buffered_utterance().unwrap().duration_ms, 2);
        assert_eq!(sm.take_buffered_utterance().unwrap().duration_ms, 3);
        assert!(sm.take_buffered_utterance().is_none());
    }

    #[test]
    fn destroy_is_idempotent() {
        let now = Instant::now();
        let mut sm = StateMachine::new();
        enter_queue_choice(&mut sm, now);
        sm.buffer_utterance(utterance());

        sm.destroy();
        assert_eq!(sm.state_type(), StateType::Idle);
        assert!(!sm.has_active_timers());
        assert_eq!(sm.buffered_len(), 0);

        sm.destroy();
        assert_eq!(sm.state_type(), StateType::Idle);
    }
}
