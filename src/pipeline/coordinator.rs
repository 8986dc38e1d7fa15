//! Export coordinator
//!
//! Drives one pipeline run for one job: opens or resumes the artifact,
//! pulls record batches, encodes and writes them, reports progress and
//! checkpoints, and honors stop signals between records.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::model::{Checkpoint, ExportFormat, NormalizedFilters, Progress};
use crate::store::RecordStore;

use super::encoder::{RecordEncoder, encoder_for};
use super::progress::ProgressStage;
use super::sink::ArtifactSink;
use super::source::RecordCursor;
use super::{Flow, PipelineObserver, PipelineOutcome, StopReason};

/// Everything a run needs to know about the job
#[derive(Debug, Clone)]
pub struct ExportPlan {
    pub job_id: String,
    pub format: ExportFormat,
    pub filters: NormalizedFilters,
    /// Anchor for time-relative filters
    pub as_of: DateTime<Utc>,
    pub artifact_path: PathBuf,
    /// Resume point; `None` starts from scratch
    pub checkpoint: Option<Checkpoint>,
    /// Total counted by an earlier run, reused on resume
    pub known_total: Option<u64>,
}

/// Coordinator for export pipeline runs
pub struct ExportCoordinator {
    records: Arc<dyn RecordStore>,
    settings: PipelineConfig,
}

/// Mutable position of a run
struct RunState {
    sink: ArtifactSink,
    processed: u64,
    last_key: Option<String>,
}

impl ExportCoordinator {
    pub fn new(records: Arc<dyn RecordStore>, settings: PipelineConfig) -> Self {
        Self { records, settings }
    }

    /// Execute the export described by `plan`
    ///
    /// A corrupt artifact found on resume is reported to the observer and
    /// the run restarts from zero once. Pause, cancel and supersession end
    /// the run with the matching [`PipelineOutcome`], never with an error.
    pub async fn execute(
        &self,
        plan: &ExportPlan,
        observer: &mut dyn PipelineObserver,
    ) -> Result<PipelineOutcome> {
        let started = Instant::now();
        let mut checkpoint = plan.checkpoint.clone();
        let mut restarted = false;

        loop {
            match self.run(plan, checkpoint.as_ref(), observer).await {
                Err(e) if e.is_corruption() && !restarted => {
                    warn!(job_id = %plan.job_id, error = %e, "artifact corrupt, restarting export from scratch");
                    observer.on_restart().await?;
                    checkpoint = None;
                    restarted = true;
                }
                Ok(outcome) => {
                    info!(
                        job_id = %plan.job_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        outcome = outcome_label(&outcome),
                        "pipeline run finished"
                    );
                    return Ok(outcome);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run(
        &self,
        plan: &ExportPlan,
        checkpoint: Option<&Checkpoint>,
        observer: &mut dyn PipelineObserver,
    ) -> Result<PipelineOutcome> {
        let encoder = encoder_for(plan.format);
        let mut state = self.open(plan, checkpoint, encoder.as_ref()).await?;

        let total = match (checkpoint, plan.known_total) {
            (Some(_), Some(total)) => total,
            _ => self.records.count(&plan.filters, plan.as_of).await?,
        };
        debug!(
            job_id = %plan.job_id,
            total,
            resume_from = state.processed,
            "starting pipeline run"
        );

        let mut stage = ProgressStage::new(total, self.settings.progress_step, state.processed);
        let mut cursor = self
            .records
            .scan(
                &plan.filters,
                plan.as_of,
                state.last_key.clone(),
                self.settings.batch_size,
            )
            .await?;

        let mut buf = Vec::with_capacity(4096);
        let mut since_checkpoint = 0u64;
        let mut since_poll = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                reason = observer.stopped() => Err(reason),
                batch = cursor.next_batch() => Ok(batch?),
            };
            let batch = match next {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(reason) => {
                    return self.stop(plan, reason, state, cursor, encoder.as_ref(), total).await;
                }
            };

            for record in batch {
                buf.clear();
                encoder.encode(&record, state.processed == 0, &mut buf)?;
                state.sink.write(&buf).await?;
                state.processed += 1;
                state.last_key = Some(record.sort_key().to_string());
                since_checkpoint += 1;

                let report = stage.record(state.processed);
                let checkpoint = if since_checkpoint >= self.settings.checkpoint_interval {
                    since_checkpoint = 0;
                    state.sink.flush_durable().await?;
                    Some(state.checkpoint())
                } else {
                    None
                };

                if report.is_some() || checkpoint.is_some() {
                    if let Flow::Stop(reason) = observer.on_progress(report, checkpoint).await {
                        return self.stop(plan, reason, state, cursor, encoder.as_ref(), total).await;
                    }
                }

                since_poll += 1;
                if since_poll >= self.settings.control_check_interval {
                    since_poll = 0;
                    if let Some(reason) = observer.poll_stop() {
                        return self.stop(plan, reason, state, cursor, encoder.as_ref(), total).await;
                    }
                }
            }
        }

        cursor.close().await?;

        if let Some(done) = stage.finish(state.processed) {
            if let Flow::Stop(reason) = observer.on_progress(Some(done), None).await {
                return self.stop(plan, reason, state, cursor, encoder.as_ref(), total).await;
            }
        }

        state.sink.write(encoder.footer()).await?;
        state.sink.flush_durable().await?;

        Ok(PipelineOutcome::Completed {
            total_processed: state.processed,
            artifact_path: plan.artifact_path.clone(),
            size_bytes: state.sink.position(),
        })
    }

    async fn open(
        &self,
        plan: &ExportPlan,
        checkpoint: Option<&Checkpoint>,
        encoder: &dyn RecordEncoder,
    ) -> Result<RunState> {
        match checkpoint {
            Some(cp) => {
                let (sink, truncated) =
                    ArtifactSink::resume(&plan.artifact_path, cp, encoder).await?;
                info!(
                    job_id = %plan.job_id,
                    processed = cp.processed_items,
                    offset = cp.last_valid_byte_offset,
                    truncated,
                    "resuming export from checkpoint"
                );
                Ok(RunState {
                    sink,
                    processed: cp.processed_items,
                    last_key: cp.last_processed_key.clone(),
                })
            }
            None => {
                let mut sink = ArtifactSink::create(&plan.artifact_path).await?;
                sink.write(&encoder.preamble()).await?;
                Ok(RunState {
                    sink,
                    processed: 0,
                    last_key: None,
                })
            }
        }
    }

    async fn stop(
        &self,
        plan: &ExportPlan,
        reason: StopReason,
        mut state: RunState,
        mut cursor: Box<dyn RecordCursor>,
        encoder: &dyn RecordEncoder,
        total: u64,
    ) -> Result<PipelineOutcome> {
        if let Err(e) = cursor.close().await {
            debug!(job_id = %plan.job_id, error = %e, "failed to close cursor on stop");
        }
        info!(job_id = %plan.job_id, reason = %reason, processed = state.processed, "pipeline stopped");

        match reason {
            StopReason::Paused => {
                state.sink.flush_durable().await?;
                let checkpoint = state.checkpoint();
                // Keep the partial JSON parseable; the footer lies past the checkpoint.
                if !encoder.footer().is_empty() {
                    state.sink.write(encoder.footer()).await?;
                    state.sink.flush_durable().await?;
                }
                Ok(PipelineOutcome::Paused {
                    processed_items: state.processed,
                    last_processed_key: state.last_key,
                    checkpoint,
                    progress: Progress::new(state.processed, total),
                })
            }
            StopReason::Cancelled => Ok(PipelineOutcome::Cancelled {
                processed_items: state.processed,
                artifact_path: state.sink.path().to_path_buf(),
            }),
            StopReason::Superseded => Ok(PipelineOutcome::Superseded),
        }
    }
}

impl RunState {
    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            last_processed_key: self.last_key.clone(),
            last_valid_byte_offset: self.sink.position(),
            processed_items: self.processed,
        }
    }
}

fn outcome_label(outcome: &PipelineOutcome) -> &'static str {
    match outcome {
        PipelineOutcome::Completed { .. } => "completed",
        PipelineOutcome::Paused { .. } => "paused",
        PipelineOutcome::Cancelled { .. } => "cancelled",
        PipelineOutcome::Superseded => "superseded",
    }
}
