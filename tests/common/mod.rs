#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::{Semaphore, broadcast};

use exportd::config::StoreBackend;
use exportd::model::{TaskPriority, TaskRecord, TaskStatus};
use exportd::store::MemoryRecordStore;
use exportd::state::StatusUpdate;
use exportd::{Config, ExportFilters, ExportJob, Exporter, JobEvent, JobStatus};

pub fn records(n: usize) -> Vec<TaskRecord> {
    let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
    (1..=n)
        .map(|i| TaskRecord {
            id: format!("task-{i:03}"),
            title: format!("Task number {i}"),
            description: (i % 3 == 0).then(|| format!("needs \"review\", part {i}")),
            status: if i % 2 == 0 {
                TaskStatus::Done
            } else {
                TaskStatus::Todo
            },
            priority: TaskPriority::Medium,
            estimated_hours: Some(i as f64),
            actual_hours: (i % 2 == 0).then_some(i as f64 + 0.5),
            tags: vec!["ops".to_string()],
            due_date: None,
            created_at: ts,
            updated_at: ts,
            completed_at: None,
        })
        .collect()
}

/// Small batches and per-record reporting so tests can stop runs at exact counts
pub fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.store.backend = StoreBackend::Memory;
    config.workers.count = 2;
    config.pipeline.batch_size = 2;
    config.pipeline.checkpoint_interval = 2;
    config.pipeline.progress_step = 1;
    config.pipeline.control_check_interval = 1;
    config.pipeline.temp_dir = dir.to_path_buf();
    config
}

pub fn gated_store(n: usize, permits: usize) -> (Arc<MemoryRecordStore>, Arc<Semaphore>) {
    let gate = Arc::new(Semaphore::new(permits));
    let store = MemoryRecordStore::with_records(records(n)).with_gate(gate.clone());
    (Arc::new(store), gate)
}

pub async fn started(config: Config, records: Arc<MemoryRecordStore>) -> Exporter {
    let exporter = Exporter::in_memory(config, records);
    exporter.start().await.unwrap();
    exporter
}

pub fn search(text: &str) -> ExportFilters {
    ExportFilters {
        search: Some(text.to_string()),
        ..Default::default()
    }
}

/// Poll the job until `done` holds, failing after a few seconds
pub async fn wait_for(
    exporter: &Exporter,
    job_id: &str,
    mut done: impl FnMut(&ExportJob) -> bool,
) -> ExportJob {
    let mut last = None;
    for _ in 0..1000 {
        let job = exporter.get_status(job_id).await.unwrap();
        if done(&job) {
            return job;
        }
        last = Some(job);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached the expected state: {last:?}");
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

pub async fn download_bytes(exporter: &Exporter, job_id: &str, dir: &Path) -> Vec<u8> {
    let download = exporter.download_export(job_id).await.unwrap();
    let dest = dir.join(format!("download-{job_id}"));
    download.save_to(&dest).await.unwrap();
    tokio::fs::read(&dest).await.unwrap()
}

/// Drain `events` for `job_id` up to its final event, keeping the status updates
pub async fn collect_until_terminal(
    events: &mut broadcast::Receiver<JobEvent>,
    job_id: &str,
) -> (Vec<StatusUpdate>, JobEvent) {
    let mut updates = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        if event.job_id() != job_id {
            continue;
        }
        match event {
            JobEvent::StatusChanged(update) => updates.push(update),
            terminal => return (updates, terminal),
        }
    }
}

/// Status changes follow legal edges and progress never drops while processing
pub fn assert_legal_history(updates: &[StatusUpdate]) {
    for pair in updates.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.status != next.status {
            assert!(
                prev.status.can_transition_to(next.status),
                "illegal transition {:?} -> {:?}",
                prev.status,
                next.status
            );
        } else if next.status == JobStatus::Processing {
            assert!(
                next.progress >= prev.progress,
                "progress dropped from {} to {}",
                prev.progress,
                next.progress
            );
        }
    }
}
