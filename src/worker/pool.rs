//! Fixed-size worker pool
//!
//! Jobs are handed out in two steps: [`WorkerPool::try_reserve`] sets an
//! idle worker aside, then [`WorkerLease::assign`] gives it the job. The
//! dispatcher reserves before it dequeues, so a dequeued job always has a
//! worker waiting for it. Dropping an unused lease returns the worker
//! without waking the dispatcher.
//!
//! A supervisor task receives `Finished` reports from workers and `Exited`
//! notices from per-worker monitors. A worker that panics is replaced, and
//! the job it held is handed to [`JobRunner::on_worker_lost`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::WorkerConfig;
use crate::model::ExportJob;
use crate::store::QueueEntry;

use super::actor::{
    Assignment, ControlAction, ControlSignal, JobRunner, WorkerEvent, worker_loop,
};
use super::registry::{JobRegistry, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotState {
    Idle,
    Reserved,
    Busy { job_id: String, lease: u64 },
}

struct WorkerSlot {
    tasks: mpsc::Sender<Assignment>,
    control: mpsc::Sender<ControlSignal>,
    state: SlotState,
    generation: u64,
}

struct PoolShared {
    slots: Mutex<Vec<WorkerSlot>>,
    registry: Arc<JobRegistry>,
    runner: Arc<dyn JobRunner>,
    idle: Notify,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<WorkerEvent>,
    control_capacity: usize,
    leases: AtomicU64,
    generations: AtomicU64,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// An idle worker set aside for one assignment
pub struct WorkerLease {
    shared: Arc<PoolShared>,
    worker: WorkerId,
    armed: bool,
}

impl WorkerPool {
    /// Spawn `config.count` workers; must be called inside a Tokio runtime
    pub fn new(config: &WorkerConfig, registry: Arc<JobRegistry>, runner: Arc<dyn JobRunner>) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PoolShared {
            slots: Mutex::new(Vec::with_capacity(config.count)),
            registry,
            runner,
            idle: Notify::new(),
            shutdown: CancellationToken::new(),
            events,
            control_capacity: config.control_capacity.max(1),
            leases: AtomicU64::new(0),
            generations: AtomicU64::new(0),
        });

        let slots: Vec<WorkerSlot> = (0..config.count).map(|id| spawn_worker(&shared, id)).collect();
        *shared.slots.lock() = slots;

        let supervisor = tokio::spawn(supervise(shared.clone(), rx));
        info!(workers = config.count, "worker pool started");
        Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.slots.lock().len()
    }

    /// Workers currently reserved or running a job
    pub fn busy(&self) -> usize {
        self.shared
            .slots
            .lock()
            .iter()
            .filter(|slot| slot.state != SlotState::Idle)
            .count()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.shared.registry
    }

    /// Set an idle worker aside, if there is one
    pub fn try_reserve(&self) -> Option<WorkerLease> {
        if self.shared.shutdown.is_cancelled() {
            return None;
        }
        let mut slots = self.shared.slots.lock();
        let worker = slots.iter().position(|slot| slot.state == SlotState::Idle)?;
        slots[worker].state = SlotState::Reserved;
        Some(WorkerLease {
            shared: self.shared.clone(),
            worker,
            armed: true,
        })
    }

    /// Wait until a worker became idle
    pub async fn idle_notified(&self) {
        self.shared.idle.notified().await
    }

    /// Ask the worker holding `job_id` to pause; `false` if no worker holds it
    pub async fn pause(&self, job_id: &str) -> bool {
        self.signal(job_id, ControlAction::Pause).await
    }

    /// Ask the worker holding `job_id` to cancel; `false` if no worker holds it
    pub async fn cancel(&self, job_id: &str) -> bool {
        self.signal(job_id, ControlAction::Cancel).await
    }

    /// Tell the worker holding `job_id` that it lost ownership
    pub async fn supersede(&self, job_id: &str) -> bool {
        self.signal(job_id, ControlAction::Supersede).await
    }

    async fn signal(&self, job_id: &str, action: ControlAction) -> bool {
        let Some(holder) = self.shared.registry.holder(job_id) else {
            return false;
        };
        let control = {
            let slots = self.shared.slots.lock();
            match slots.get(holder.worker) {
                Some(slot) => slot.control.clone(),
                None => return false,
            }
        };
        let delivered = control
            .send(ControlSignal {
                lease: holder.lease,
                action,
            })
            .await
            .is_ok();
        debug!(job_id, worker = holder.worker, ?action, delivered, "sent control signal");
        delivered
    }

    /// Stop all workers; running jobs are interrupted where they are
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl WorkerLease {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Hand the job to the reserved worker
    ///
    /// Fails, giving the job back, when another worker still holds the same
    /// job id or the worker is gone. The lease is released either way.
    pub fn assign(
        mut self,
        entry: QueueEntry,
        job: ExportJob,
    ) -> std::result::Result<u64, (QueueEntry, ExportJob)> {
        let lease = self.shared.leases.fetch_add(1, Ordering::Relaxed) + 1;
        let job_id = job.id.clone();
        if !self.shared.registry.claim(&job_id, self.worker, lease) {
            debug!(job_id = %job_id, "job still held by another worker");
            return Err((entry, job));
        }

        let assignment = Assignment {
            worker: self.worker,
            lease,
            entry,
            job,
        };
        let mut slots = self.shared.slots.lock();
        let slot = &mut slots[self.worker];
        match slot.tasks.try_send(assignment) {
            Ok(()) => {
                slot.state = SlotState::Busy { job_id, lease };
                self.armed = false;
                Ok(lease)
            }
            Err(e) => {
                drop(slots);
                self.shared.registry.release(&job_id, lease);
                let assignment = e.into_inner();
                Err((assignment.entry, assignment.job))
            }
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.shared.slots.lock();
        if let Some(slot) = slots.get_mut(self.worker) {
            if slot.state == SlotState::Reserved {
                slot.state = SlotState::Idle;
            }
        }
    }
}

fn spawn_worker(shared: &Arc<PoolShared>, id: WorkerId) -> WorkerSlot {
    let (tasks_tx, tasks_rx) = mpsc::channel(1);
    let (control_tx, control_rx) = mpsc::channel(shared.control_capacity);
    let generation = shared.generations.fetch_add(1, Ordering::Relaxed);

    let handle = tokio::spawn(worker_loop(
        id,
        tasks_rx,
        control_rx,
        shared.runner.clone(),
        shared.events.clone(),
        shared.shutdown.clone(),
    ));

    let events = shared.events.clone();
    tokio::spawn(async move {
        let panicked = match handle.await {
            Ok(()) => false,
            Err(e) => e.is_panic(),
        };
        let _ = events.send(WorkerEvent::Exited {
            worker: id,
            generation,
            panicked,
        });
    });

    WorkerSlot {
        tasks: tasks_tx,
        control: control_tx,
        state: SlotState::Idle,
        generation,
    }
}

async fn supervise(shared: Arc<PoolShared>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            WorkerEvent::Finished {
                worker,
                lease,
                job_id,
            } => {
                shared.registry.release(&job_id, lease);
                {
                    let mut slots = shared.slots.lock();
                    if let Some(slot) = slots.get_mut(worker) {
                        if matches!(&slot.state, SlotState::Busy { lease: l, .. } if *l == lease) {
                            slot.state = SlotState::Idle;
                        }
                    }
                }
                debug!(worker, job_id = %job_id, "worker idle");
                shared.idle.notify_one();
            }
            WorkerEvent::Exited {
                worker,
                generation,
                panicked,
            } => {
                if shared.shutdown.is_cancelled() {
                    break;
                }
                let lost = {
                    let slots = shared.slots.lock();
                    match slots.get(worker) {
                        Some(slot) if slot.generation == generation => Some(slot.state.clone()),
                        _ => None,
                    }
                };
                let Some(state) = lost else {
                    continue;
                };

                if let SlotState::Busy { job_id, lease } = state {
                    error!(worker, job_id = %job_id, panicked, "worker terminated while running a job");
                    let attempt = shared
                        .registry
                        .release(&job_id, lease)
                        .and_then(|holder| holder.attempt);
                    shared.runner.on_worker_lost(&job_id, attempt).await;
                } else {
                    error!(worker, panicked, "idle worker terminated");
                }

                let replacement = spawn_worker(&shared, worker);
                shared.slots.lock()[worker] = replacement;
                info!(worker, "worker replaced");
                shared.idle.notify_one();
            }
        }
    }
}
