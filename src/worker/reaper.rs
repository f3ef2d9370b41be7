//! Lease reaper.
//!
//! Runs alongside the worker loop: returns expired leases to their tier
//! partition (redelivery) and fails the jobs behind messages that exhausted
//! their delivery budget (dead-letter). This is what turns a crashed
//! worker's silent disappearance into an observable retry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;

use super::WorkerError;
use crate::app_state::AppState;
use crate::models::job::{ErrorKind, JobError};
use crate::queue::{QueueMessage, RenderQueue};
use crate::store::{JobStore, StoreError};

/// Conflict-recovery bound when failing a dead-lettered job.
const MAX_TRANSITION_RETRIES: usize = 3;

/// Run the reaper loop forever at the configured interval.
pub async fn run_loop(state: AppState) {
    let mut ticker = interval(Duration::from_secs(state.config.reap_interval_secs));

    loop {
        ticker.tick().await;
        if let Err(e) = reap_once(&state, Utc::now()).await {
            tracing::error!(error = %e, "Reaper cycle failed");
        }
    }
}

/// Run a single reap cycle against the given clock reading.
pub async fn reap_once(state: &AppState, now: DateTime<Utc>) -> Result<(), WorkerError> {
    let outcome = state.queue.reap_expired(now).await?;

    for msg in &outcome.redelivered {
        metrics::counter!("render_jobs_redelivered_total").increment(1);
        tracing::warn!(
            job_id = %msg.job_id,
            delivery_count = msg.delivery_count,
            "Lease expired, message redelivered"
        );
    }

    for msg in &outcome.dead_lettered {
        metrics::counter!("render_jobs_dead_lettered_total").increment(1);
        fail_dead_lettered(state, msg).await?;
    }

    if let Ok(snapshot) = state.queue.snapshot().await {
        metrics::gauge!("render_queue_depth").set(snapshot.depth as f64);
        metrics::gauge!("render_queue_in_flight").set(snapshot.in_flight as f64);
    }

    Ok(())
}

async fn fail_dead_lettered(state: &AppState, msg: &QueueMessage) -> Result<(), WorkerError> {
    for _ in 0..MAX_TRANSITION_RETRIES {
        let Some(job) = state.store.get(msg.job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        let error = JobError::new(
            ErrorKind::MaxRetriesExceeded,
            format!(
                "delivery budget exhausted after {} deliveries",
                msg.delivery_count
            ),
        );

        match state.store.mark_failed(job.id, job.version, &error).await {
            Ok(_) => {
                tracing::error!(
                    job_id = %job.id,
                    delivery_count = msg.delivery_count,
                    "Dead-lettered job marked failed"
                );
                return Ok(());
            }
            Err(StoreError::Conflict) => continue,
            Err(StoreError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }

    tracing::error!(
        job_id = %msg.job_id,
        "Could not settle dead-lettered job after repeated conflicts"
    );
    Ok(())
}
