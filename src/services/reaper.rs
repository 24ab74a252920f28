use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::db::store;
use crate::services::worker::WorkerContext;

/// Periodic recovery task: returns lease-expired jobs to pending and
/// re-offers their ids. Deliberately separate from the worker code path so
/// worker bugs cannot suppress recovery.
pub async fn run_reaper(
    ctx: Arc<WorkerContext>,
    interval: Duration,
    batch: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(interval_secs = interval.as_secs(), "reaper started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        reap_once(&ctx, batch).await;
    }

    tracing::info!("reaper stopped");
}

/// One reaper tick: scan expired leases, reset each, re-offer; then re-offer
/// pending rows that have sat still for a full lease window (ids the queue
/// hint may have lost).
pub async fn reap_once(ctx: &WorkerContext, batch: i64) {
    let now = ctx.clock.now();

    match store::scan_expired_leases(&ctx.db, now, batch).await {
        Ok(ids) => {
            for id in ids {
                match store::reset_expired(&ctx.db, id, now).await {
                    Ok(true) => {
                        ctx.queue.offer(id);
                        metrics::counter!("jobs_reaped_total").increment(1);
                        tracing::warn!(job_id = %id, "returned expired job to queue");
                    }
                    Ok(false) => {
                        tracing::debug!(job_id = %id, "lease no longer expired, skipping");
                    }
                    Err(e) => {
                        tracing::error!(job_id = %id, error = %e, "expired lease reset failed");
                    }
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "expired lease scan failed");
        }
    }

    let cutoff = now - chrono::Duration::seconds(ctx.settings.lease_seconds);
    match store::scan_stale_pending(&ctx.db, cutoff, batch).await {
        Ok(ids) => {
            for id in ids {
                if ctx.queue.offer(id) {
                    tracing::debug!(job_id = %id, "re-offered stale pending job");
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "stale pending scan failed");
        }
    }
}
