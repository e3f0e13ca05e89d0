//! Idle-session garbage collection.
//!
//! A sweep evicts every session idle past the TTL and deletes its artifact
//! directory. A session evicted mid-job has its job cancelled through the
//! session token; the sweep waits (bounded) for the worker to be gone
//! before deleting the directory it writes into.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactStore;
use crate::session::SessionRegistry;

/// Poll step while waiting for a cancelled job to release its session.
const SETTLE_POLL: Duration = Duration::from_millis(50);

/// Evict sessions idle longer than `ttl` as of `now` and delete their
/// artifacts. Returns the number of sessions evicted.
///
/// `settle` bounds how long to wait for a cancelled job to finish
/// terminating before its directory is removed anyway.
pub async fn sweep(
    sessions: &SessionRegistry,
    artifacts: &ArtifactStore,
    ttl: Duration,
    settle: Duration,
    now: std::time::Instant,
) -> usize {
    let evicted = sessions.evict_idle(ttl, now);
    for session in &evicted {
        if session.is_running() {
            let deadline = Instant::now() + settle;
            while session.is_running() && Instant::now() < deadline {
                tokio::time::sleep(SETTLE_POLL).await;
            }
            if session.is_running() {
                tracing::warn!(session = %session.id(), "evicted job still terminating, removing artifacts anyway");
            }
        }
        match artifacts.remove_session(session.id()).await {
            Ok(()) => tracing::info!(session = %session.id(), "session expired"),
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "failed to remove session artifacts")
            }
        }
    }
    evicted.len()
}

/// Run [`sweep`] every `interval` until `shutdown` fires.
pub fn spawn_sweeper(
    sessions: SessionRegistry,
    artifacts: ArtifactStore,
    ttl: Duration,
    interval: Duration,
    settle: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = sweep(&sessions, &artifacts, ttl, settle, std::time::Instant::now()).await;
                    if evicted > 0 {
                        tracing::info!(evicted, remaining = sessions.len(), "session sweep complete");
                    }
                }
            }
        }
        tracing::debug!("session sweeper stopped");
    })
}
