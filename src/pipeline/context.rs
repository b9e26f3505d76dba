//! Orchestrator-owned transient context.
//!
//! Everything here is cross-cutting turn state the state machine must not
//! carry: grace windows, cooldowns, pending dispatch bookkeeping, and the
//! stall watchdog deadline. Every field has a defined zero value restored by
//! `reset()` when the pipeline stops or the watchdog fires.

use crate::pipeline::state::StateType;
use std::time::Instant;

/// A wait-mode prompt whose completion is pending.
#[derive(Debug, Clone)]
pub struct PendingPrompt {
    /// Channel the prompt was dispatched on.
    pub channel: String,
    /// Gateway session key of that channel.
    pub session_key: String,
    /// Speaker id.
    pub user_id: String,
    /// Prompt text.
    pub text: String,
}

/// Transient pipeline context.
#[derive(Debug, Default)]
pub struct PipelineContext {
    /// Wake-free prompting allowed until this instant (wake check, "prompt"
    /// choice).
    pub prompt_grace_until: Option<Instant>,
    /// Gated-mode admission open until this instant (switch-choice read).
    pub gate_grace_until: Option<Instant>,
    /// Suppress the waiting tone for the next wait.
    pub silent_wait: bool,
    /// Generation of the single-shot wait callback; re-arming replaces it.
    pub pending_wait_generation: Option<u64>,
    /// The prompt belonging to the pending wait dispatch.
    pub pending_wait_prompt: Option<PendingPrompt>,
    /// Queue item the user chose to hold the line for.
    pub active_wait_queue_item_id: Option<String>,
    /// Speculative ask-mode item awaiting the queue choice.
    pub speculative_queue_item_id: Option<String>,
    /// Speculative response that resolved before the user chose.
    pub deferred_wait_response_text: Option<String>,
    /// Last text spoken through the player (echo filter, replay).
    pub last_playback_text: Option<String>,
    /// When the last playback finished (echo filter window).
    pub last_playback_completed_at: Option<Instant>,
    /// Gate-closed / near-miss cue suppressed until this instant.
    pub failed_wake_cue_until: Option<Instant>,
    /// Post-timeout prompt guard after a new-post flow expiry.
    pub new_post_timeout_guard_until: Option<Instant>,
    /// A reprompt is queued; don't stack another.
    pub reject_reprompt_in_flight: bool,
    /// An idle-notify announcement is queued.
    pub idle_notify_in_flight: bool,
    /// Near-miss wake handling in progress (re-entrancy guard).
    pub missed_wake_analysis_in_flight: bool,
    /// Stall watchdog deadline; armed whenever the state is not idle.
    pub stall_deadline: Option<Instant>,
    /// Previous observed state, for change detection.
    pub prev_state: Option<StateType>,
    /// One-shot "speech recognition unavailable" notice spoken.
    pub stt_down_announced: bool,
    /// One-shot "voice output unavailable" notice spoken.
    pub tts_down_announced: bool,
    /// Monotonic dispatch generation for the wait callback.
    pub dispatch_generation: u64,
}

impl PipelineContext {
    /// Restore every field to its zero value.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Next dispatch generation.
    pub fn next_generation(&mut self) -> u64 {
        self.dispatch_generation += 1;
        self.dispatch_generation
    }

    /// Whether either admission grace window is open.
    #[must_use]
    pub fn in_grace(&self, now: Instant) -> bool {
        self.prompt_grace_until.is_some_and(|t| now < t)
            || self.gate_grace_until.is_some_and(|t| now < t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reset_restores_zero_values() {
        let mut ctx = PipelineContext::default();
        ctx.silent_wait = true;
        ctx.pending_wait_generation = Some(4);
        ctx.idle_notify_in_flight = true;
        ctx.dispatch_generation = 9;
        ctx.prompt_grace_until = Some(Instant::now());

        ctx.reset();

        assert!(!ctx.silent_wait);
        assert!(ctx.pending_wait_generation.is_none());
        assert!(!ctx.idle_notify_in_flight);
        assert_eq!(ctx.dispatch_generation, 0);
        assert!(ctx.prompt_grace_until.is_none());
    }

    #[test]
    fn generations_are_monotonic() {
        let mut ctx = PipelineContext::default();
        let a = ctx.next_generation();
        let b = ctx.next_generation();
        assert!(b > a);
    }

    #[test]
    fn grace_windows_expire() {
        let mut ctx = PipelineContext::default();
        let now = Instant::now();
        assert!(!ctx.in_grace(now));

        ctx.prompt_grace_until = Some(now + Duration::from_secs(15));
        assert!(ctx.in_grace(now + Duration::from_secs(14)));
        assert!(!ctx.in_grace(now + Duration::from_secs(16)));

        ctx.reset();
        ctx.gate_grace_until = Some(now + Duration::from_secs(5));
        assert!(ctx.in_grace(now + Duration::from_secs(4)));
        assert!(!ctx.in_grace(now + Duration::from_millis(5_100)));
    }
}
