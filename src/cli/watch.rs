//! Terminal progress display for `export --watch`

use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use crate::error::Result;
use crate::model::{ExportJob, JobStatus};
use crate::service::Exporter;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Progress bar over a job's processed item count
pub struct ProgressTracker {
    start_time: Instant,
    bar: Option<ProgressBar>,
}

impl ProgressTracker {
    pub fn new(enable_bar: bool) -> Self {
        let bar = enable_bar.then(|| {
            let bar = ProgressBar::new(0);
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-");
            bar.set_style(style);
            bar
        });
        Self {
            start_time: Instant::now(),
            bar,
        }
    }

    pub fn update(&self, job: &ExportJob) {
        let Some(ref bar) = self.bar else {
            return;
        };
        bar.set_length(job.progress.total_items);
        bar.set_position(job.progress.processed_items);

        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let speed = job.progress.processed_items as f64 / elapsed;
            bar.set_message(format!("{} ({:.0} items/sec)", job.status, speed));
        }
    }

    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}

/// Follow a job until it is terminal or paused
///
/// Ctrl+C asks the service to pause the job; watching continues until the
/// pause lands.
pub async fn watch_job(exporter: &Exporter, job_id: &str, show_bar: bool) -> Result<ExportJob> {
    let tracker = ProgressTracker::new(show_bar);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut pause_requested = false;

    let job = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            signal = tokio::signal::ctrl_c(), if !pause_requested => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl+C");
                }
                pause_requested = true;
                if let Err(e) = exporter.pause_export(job_id).await {
                    warn!(job_id, error = %e, "pause request failed");
                }
            }
        }

        let job = exporter.get_status(job_id).await?;
        tracker.update(&job);
        if job.status.is_terminal() || job.status == JobStatus::Paused {
            break job;
        }
    };

    tracker.finish();
    Ok(job)
}
