//! Response poller.
//!
//! Scans pending queue items against gateway history and promotes them to
//! ready once an assistant reply lands. Runs only while pending items exist
//! and stops itself when the queue drains.

use crate::gateway::ChatGateway;
use crate::queue::store::QueueStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Messages fetched per pending item on each poll.
const POLL_HISTORY_LIMIT: usize = 5;

/// Summary length spoken for a ready item.
const SUMMARY_CHARS: usize = 100;

/// Notification that an item became ready.
#[derive(Debug, Clone)]
pub struct ReadyNotice {
    /// Item id.
    pub id: String,
    /// Spoken channel name.
    pub display_name: String,
}

/// Build the spoken summary of a response (first 100 chars, ellipsised).
#[must_use]
pub fn summarize(text: &str) -> String {
    let mut summary: String = text.chars().take(SUMMARY_CHARS).collect();
    if text.chars().count() > SUMMARY_CHARS {
        summary.push('…');
    }
    summary
}

/// Decide whether `message` answers `item_timestamp`.
///
/// The reply must be an assistant message at or after the dispatch time whose
/// text does not begin with a `[voice-user]` mirror marker.
fn is_answer(msg: &crate::gateway::GatewayMessage, item_timestamp: i64) -> bool {
    if msg.role != "assistant" {
        return false;
    }
    if !msg.timestamp.is_some_and(|ts| ts >= item_timestamp) {
        return false;
    }
    !msg.content.flatten().trim_start().starts_with("[voice-user]")
}

/// Run one poll pass over the pending items.
///
/// Returns the number of items still pending afterwards.
pub async fn poll_once(
    queue: &Arc<Mutex<QueueStore>>,
    gateway: &Arc<dyn ChatGateway>,
    notify: &mpsc::UnboundedSender<ReadyNotice>,
) -> usize {
    let pending = lock(queue).pending_items();

    for item in &pending {
        let messages = match gateway.history(&item.session_key, POLL_HISTORY_LIMIT).await {
            Ok(m) => m,
            Err(e) => {
                debug!("poll skipped {}: {e}", item.id);
                continue;
            }
        };

        // Most recent qualifying assistant message wins.
        let answer = messages
            .iter()
            .rev()
            .find(|m| is_answer(m, item.timestamp));

        if let Some(answer) = answer {
            let text = answer.content.flatten();
            let summary = summarize(&text);
            if lock(queue).mark_ready(&item.id, &summary, &text) {
                info!("queue item {} ready ({})", item.id, item.display_name);
                let _ = notify.send(ReadyNotice {
                    id: item.id.clone(),
                    display_name: item.display_name.clone(),
                });
            }
        }
    }

    lock(queue).pending_items().len()
}

/// Spawn the poller loop.
///
/// The task exits when no pending items remain or on cancellation; the
/// orchestrator re-spawns it on the next enqueue.
pub fn spawn(
    queue: Arc<Mutex<QueueStore>>,
    gateway: Arc<dyn ChatGateway>,
    notify: mpsc::UnboundedSender<ReadyNotice>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    let remaining = poll_once(&queue, &gateway, &notify).await;
                    if remaining == 0 {
                        debug!("response poller drained, stopping");
                        break;
                    }
                }
            }
        }
    })
}

fn lock(queue: &Arc<Mutex<QueueStore>>) -> std::sync::MutexGuard<'_, QueueStore> {
    queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
