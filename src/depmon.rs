//! Dependency liveness monitoring.
//!
//! Periodic TCP probes against the STT and TTS backends. Status transitions
//! are published to the pipeline so it can speak a one-shot unavailability
//! notice; an optional restart command fires on primary-down, gated by a
//! per-dependency cooldown.

use crate::config::DepMonConfig;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A monitored dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    /// Speech-to-text backend.
    Stt,
    /// Text-to-speech backend.
    Tts,
}

impl Dependency {
    /// Short label for logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Stt => "stt",
            Self::Tts => "tts",
        }
    }
}

/// A status transition published to the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct DependencyStatus {
    /// Which dependency changed.
    pub dep: Dependency,
    /// Whether it is reachable now.
    pub up: bool,
}

/// Extract `host:port` from a backend URL for a TCP probe.
///
/// Accepts bare `host:port` as well as full URLs; defaults the port to 80/443
/// by scheme when absent.
#[must_use]
pub fn probe_address(url: &str) -> Option<String> {
    let (scheme, rest) = match url.split_once("://") {
        Some((s, r)) => (s, r),
        None => ("", url),
    };
    let authority = rest.split(['/', '?']).next()?;
    if authority.is_empty() {
        return None;
    }
    if authority.contains(':') {
        return Some(authority.to_owned());
    }
    let port = match scheme {
        "https" => 443,
        _ => 80,
    };
    Some(format!("{authority}:{port}"))
}

struct DepState {
    dep: Dependency,
    address: Option<String>,
    restart_cmd: Option<String>,
    up: Option<bool>,
    last_restart: Option<Instant>,
}

/// Spawn the monitor task.
pub fn spawn(
    config: DepMonConfig,
    stt_url: String,
    tts_url: String,
    status_tx: mpsc::UnboundedSender<DependencyStatus>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut deps = vec![
        DepState {
            dep: Dependency::Stt,
            address: probe_address(&stt_url),
            restart_cmd: config.stt_restart_cmd.clone(),
            up: None,
            last_restart: None,
        },
        DepState {
            dep: Dependency::Tts,
            address: probe_address(&tts_url),
            restart_cmd: config.tts_restart_cmd.clone(),
            up: None,
            last_restart: None,
        },
    ];

    let interval = Duration::from_millis(config.interval_ms);
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
    let cooldown = Duration::from_millis(config.restart_cooldown_ms);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    for state in &mut deps {
                        probe_one(state, connect_timeout, cooldown, &status_tx).await;
                    }
                }
            }
        }
    })
}

async fn probe_one(
    state: &mut DepState,
    connect_timeout: Duration,
    cooldown: Duration,
    status_tx: &mpsc::UnboundedSender<DependencyStatus>,
) {
    let Some(address) = &state.address else {
        return;
    };

    let up = matches!(
        tokio::time::timeout(connect_timeout, tokio::net::TcpStream::connect(address)).await,
        Ok(Ok(_))
    );

    if state.up != Some(up) {
        if up {
            info!("{} backend reachable at {address}", state.dep.name());
        } else {
            warn!("{} backend unreachable at {address}", state.dep.name());
        }
        state.up = Some(up);
        let _ = status_tx.send(DependencyStatus { dep: state.dep, up });
    }

    if !up
        && let Some(cmd) = &state.restart_cmd
    {
        let cooled = state.last_restart.is_none_or(|t| t.elapsed() >= cooldown);
        if cooled {
            info!("restarting {} backend: {cmd}", state.dep.name());
            state.last_restart = Some(Instant::now());
            let cmd = cmd.clone();
            let name = state.dep.name();
            tokio::spawn(async move {
                match tokio::process::Command::new("/bin/sh").arg("-c").arg(&cmd).status().await {
                    Ok(status) if status.success() => {
                        info!("{name} restart command completed");
                    }
                    Ok(status) => warn!("{name} restart command exited with {status}"),
                    Err(e) => warn!("{name} restart command failed to launch: {e}"),
                }
            });
        }
    }
}
