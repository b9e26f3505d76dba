//! Health counters, snapshots, and the alert monitor.
//!
//! Counters are monotonic atomics owned by the orchestrator and shared with
//! the monitor task. The monitor is pure logic over successive snapshots: it
//! diffs them and emits alerts for the caller (and the log) to act on.

use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Monotonically non-decreasing pipeline counters.
///
/// `stop()` never resets these.
#[derive(Debug, Default)]
pub struct HealthCounters {
    utterances_processed: AtomicU64,
    commands_recognized: AtomicU64,
    llm_dispatches: AtomicU64,
    errors: AtomicU64,
    stt_failures: AtomicU64,
    tts_failures: AtomicU64,
    invariant_violations: AtomicU64,
    stall_watchdog_fires: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Utterances received from the segmenter.
    pub utterances_processed: u64,
    /// Wake-prefixed commands recognized.
    pub commands_recognized: u64,
    /// LLM dispatches fired.
    pub llm_dispatches: u64,
    /// All categorized errors.
    pub errors: u64,
    /// STT request failures.
    pub stt_failures: u64,
    /// TTS request failures.
    pub tts_failures: u64,
    /// Invariant auditor findings.
    pub invariant_violations: u64,
    /// Stall watchdog resets.
    pub stall_watchdog_fires: u64,
}

impl HealthCounters {
    /// Bump `utterances_processed`.
    pub fn incr_utterances(&self) {
        self.utterances_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump `commands_recognized`.
    pub fn incr_commands(&self) {
        self.commands_recognized.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump `llm_dispatches`.
    pub fn incr_dispatches(&self) {
        self.llm_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump `errors`.
    pub fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump `stt_failures`.
    pub fn incr_stt_failures(&self) {
        self.stt_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump `tts_failures`.
    pub fn incr_tts_failures(&self) {
        self.tts_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump `invariant_violations`.
    pub fn incr_invariant_violations(&self) {
        self.invariant_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump `stall_watchdog_fires`.
    pub fn incr_stall_fires(&self) {
        self.stall_watchdog_fires.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy all counters.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            utterances_processed: self.utterances_processed.load(Ordering::Relaxed),
            commands_recognized: self.commands_recognized.load(Ordering::Relaxed),
            llm_dispatches: self.llm_dispatches.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            stt_failures: self.stt_failures.load(Ordering::Relaxed),
            tts_failures: self.tts_failures.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
            stall_watchdog_fires: self.stall_watchdog_fires.load(Ordering::Relaxed),
        }
    }
}

/// Shared mutable health facts the orchestrator keeps current.
#[derive(Debug)]
struct SharedInner {
    state_name: &'static str,
    state_since: Instant,
    stt_up: bool,
    tts_up: bool,
}

/// Orchestrator-updated view consumed by the monitor.
#[derive(Debug)]
pub struct HealthState {
    inner: Mutex<SharedInner>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(SharedInner {
                state_name: "idle",
                state_since: Instant::now(),
                stt_up: true,
                tts_up: true,
            }),
        }
    }
}

impl HealthState {
    /// Record a pipeline state change.
    pub fn set_state(&self, name: &'static str) {
        let mut inner = self.lock();
        if inner.state_name != name {
            inner.state_name = name;
            inner.state_since = Instant::now();
        }
    }

    /// Record a dependency transition.
    pub fn set_dependency(&self, dep: crate::depmon::Dependency, up: bool) {
        let mut inner = self.lock();
        match dep {
            crate::depmon::Dependency::Stt => inner.stt_up = up,
            crate::depmon::Dependency::Tts => inner.tts_up = up,
        }
    }

    /// Build a snapshot over the given counters.
    #[must_use]
    pub fn snapshot(&self, counters: &HealthCounters) -> HealthSnapshot {
        let inner = self.lock();
        HealthSnapshot {
            state: inner.state_name,
            state_age: inner.state_since.elapsed(),
            stt_up: inner.stt_up,
            tts_up: inner.tts_up,
            counters: counters.snapshot(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Point-in-time pipeline health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Current state name.
    pub state: &'static str,
    /// How long the state has been current.
    pub state_age: Duration,
    /// STT backend reachability.
    pub stt_up: bool,
    /// TTS backend reachability.
    pub tts_up: bool,
    /// Counter values.
    pub counters: CounterSnapshot,
}

/// An alert derived from two successive snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAlert {
    /// A dependency went from up to down.
    DependencyDown {
        /// Which dependency.
        dep: &'static str,
    },
    /// The stall watchdog fired since the last snapshot.
    StallFired {
        /// Fires observed in the interval.
        count: u64,
    },
    /// Errors accumulated since the last snapshot.
    ErrorsRising {
        /// New errors in the interval.
        delta: u64,
    },
    /// Invariant violations accumulated since the last snapshot.
    InvariantViolations {
        /// New violations in the interval.
        delta: u64,
    },
    /// A non-idle state has been current beyond the alert threshold.
    StateStuck {
        /// State name.
        state: &'static str,
        /// Age of the state.
        age: Duration,
    },
}

/// Diff two snapshots into alerts. Pure.
#[must_use]
pub fn evaluate(
    prev: &HealthSnapshot,
    curr: &HealthSnapshot,
    state_age_alert: Duration,
) -> Vec<HealthAlert> {
    let mut alerts = Vec::new();

    if prev.stt_up && !curr.stt_up {
        alerts.push(HealthAlert::DependencyDown { dep: "stt" });
    }
    if prev.tts_up && !curr.tts_up {
        alerts.push(HealthAlert::DependencyDown { dep: "tts" });
    }

    let stall_delta = curr
        .counters
        .stall_watchdog_fires
        .saturating_sub(prev.counters.stall_watchdog_fires);
    if stall_delta > 0 {
        alerts.push(HealthAlert::StallFired { count: stall_delta });
    }

    let error_delta = curr.counters.errors.saturating_sub(prev.counters.errors);
    if error_delta > 0 {
        alerts.push(HealthAlert::ErrorsRising { delta: error_delta });
    }

    let violation_delta = curr
        .counters
        .invariant_violations
        .saturating_sub(prev.counters.invariant_violations);
    if violation_delta > 0 {
        alerts.push(HealthAlert::InvariantViolations { delta: violation_delta });
    }

    if curr.state != "idle" && curr.state_age >= state_age_alert {
        alerts.push(HealthAlert::StateStuck { state: curr.state, age: curr.state_age });
    }

    alerts
}

/// Spawn the periodic monitor.
///
/// Alerts go to the log and, when provided, the alert channel.
pub fn spawn_monitor(
    state: std::sync::Arc<HealthState>,
    counters: std::sync::Arc<HealthCounters>,
    interval: Duration,
    state_age_alert: Duration,
    alert_tx: Option<tokio::sync::mpsc::UnboundedSender<HealthAlert>>,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut prev = state.snapshot(&counters);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    let curr = state.snapshot(&counters);
                    for alert in evaluate(&prev, &curr, state_age_alert) {
                        warn!("health alert: {alert:?}");
                        if let Some(tx) = &alert_tx {
                            let _ = tx.send(alert);
                        }
                    }
                    prev = curr;
                }
            }
        }
    })
}
