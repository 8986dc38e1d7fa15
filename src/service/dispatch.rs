//! Background loops of the export service

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::JobQueue;
use crate::state::JobStateManager;
use crate::worker::WorkerPool;

/// Upper bound on how long the dispatcher sleeps without a wake-up
const DISPATCH_POLL: Duration = Duration::from_millis(500);

/// Pair idle workers with queued jobs until shutdown
pub(crate) async fn dispatch_loop(
    queue: Arc<JobQueue>,
    pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
) {
    debug!("dispatcher started");
    loop {
        while let Some(lease) = pool.try_reserve() {
            let (entry, job) = match queue.dequeue_next().await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to dequeue export job");
                    break;
                }
            };
            let worker = lease.worker();
            match lease.assign(entry, job) {
                Ok(lease_id) => debug!(worker, lease = lease_id, "dispatched export job"),
                Err((entry, _)) => {
                    // Still held by a superseded worker; retry once it lets go.
                    if let Err(e) = queue.release(&entry).await {
                        warn!(job_id = %entry.job_id, error = %e, "failed to return entry to queue");
                    }
                    break;
                }
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = queue.notified() => {}
            _ = pool.idle_notified() => {}
            _ = tokio::time::sleep(DISPATCH_POLL) => {}
        }
    }
    debug!("dispatcher stopped");
}

/// Requeue jobs whose worker stopped writing progress
pub(crate) async fn stall_monitor(
    queue: Arc<JobQueue>,
    manager: Arc<JobStateManager>,
    pool: Arc<WorkerPool>,
    timeout: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(1));
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let stalled = match queue.stalled(Utc::now(), timeout).await {
            Ok(stalled) => stalled,
            Err(e) => {
                warn!(error = %e, "stall check failed");
                continue;
            }
        };
        for job in stalled {
            match manager.requeue(&job.id, job.version).await {
                Ok(Some(requeued)) => {
                    warn!(job_id = %job.id, attempt = requeued.attempt, "requeued stalled export job");
                    pool.supersede(&job.id).await;
                    if let Err(e) = queue
                        .enqueue(&requeued.id, requeued.priority, requeued.enqueued_at)
                        .await
                    {
                        warn!(job_id = %job.id, error = %e, "failed to enqueue stalled job");
                    }
                }
                Ok(None) => debug!(job_id = %job.id, "stalled job moved on before requeue"),
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to requeue stalled job"),
            }
        }
    }
    info!("stall monitor stopped");
}
