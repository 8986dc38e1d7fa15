//! Worker actor
//!
//! A worker owns two channels: tasks arrive on one, pause/cancel signals on
//! the other. It runs one job at a time through a [`JobRunner`] and reports
//! back to the pool when the job is done.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::ExportJob;
use crate::pipeline::StopReason;
use crate::store::QueueEntry;

use super::registry::WorkerId;

/// Out-of-band request for the job a worker is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Cancel,
    /// The job was requeued under a newer attempt
    Supersede,
}

impl ControlAction {
    fn stop_reason(self) -> StopReason {
        match self {
            ControlAction::Pause => StopReason::Paused,
            ControlAction::Cancel => StopReason::Cancelled,
            ControlAction::Supersede => StopReason::Superseded,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControlSignal {
    pub lease: u64,
    pub action: ControlAction,
}

/// A dequeued job handed to a worker
#[derive(Debug, Clone)]
pub struct Assignment {
    pub worker: WorkerId,
    pub lease: u64,
    pub entry: QueueEntry,
    pub job: ExportJob,
}

/// Control signals addressed to one assignment
///
/// Signals carrying another lease are leftovers from an earlier job of the
/// same worker and are dropped.
pub struct ControlInbox<'a> {
    rx: &'a mut mpsc::Receiver<ControlSignal>,
    lease: u64,
    pending: Option<StopReason>,
}

impl<'a> ControlInbox<'a> {
    pub fn new(rx: &'a mut mpsc::Receiver<ControlSignal>, lease: u64) -> Self {
        Self {
            rx,
            lease,
            pending: None,
        }
    }

    pub fn lease(&self) -> u64 {
        self.lease
    }

    /// Drain queued signals without waiting
    ///
    /// When several arrived, supersession beats cancellation beats pause.
    pub fn try_recv(&mut self) -> Option<StopReason> {
        loop {
            match self.rx.try_recv() {
                Ok(signal) if signal.lease == self.lease => {
                    let reason = signal.action.stop_reason();
                    self.pending = Some(match self.pending {
                        Some(current) if rank(current) >= rank(reason) => current,
                        _ => reason,
                    });
                }
                Ok(_) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.pending.take()
    }

    /// Wait for the next signal for this assignment
    ///
    /// Cancel-safe. Never resolves once the sending side is gone.
    pub async fn recv(&mut self) -> StopReason {
        if let Some(reason) = self.pending.take() {
            return reason;
        }
        loop {
            match self.rx.recv().await {
                Some(signal) if signal.lease == self.lease => return signal.action.stop_reason(),
                Some(_) => continue,
                None => std::future::pending::<()>().await,
            }
        }
    }
}

fn rank(reason: StopReason) -> u8 {
    match reason {
        StopReason::Paused => 0,
        StopReason::Cancelled => 1,
        StopReason::Superseded => 2,
    }
}

/// What a worker does with an assignment
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    /// Run the job to an outcome; all reporting happens inside
    async fn run(&self, assignment: Assignment, control: ControlInbox<'_>);

    /// The worker holding `job_id` died before reporting an outcome
    async fn on_worker_lost(&self, job_id: &str, attempt: Option<u32>);
}

/// Messages from workers to the pool supervisor
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Finished {
        worker: WorkerId,
        lease: u64,
        job_id: String,
    },
    Exited {
        worker: WorkerId,
        generation: u64,
        panicked: bool,
    },
}

pub(crate) async fn worker_loop(
    id: WorkerId,
    mut tasks: mpsc::Receiver<Assignment>,
    mut control: mpsc::Receiver<ControlSignal>,
    runner: Arc<dyn JobRunner>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let assignment = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = tasks.recv() => match next {
                Some(assignment) => assignment,
                None => break,
            },
        };

        let lease = assignment.lease;
        let job_id = assignment.job.id.clone();
        debug!(worker = id, job_id = %job_id, lease, "worker picked up job");

        let inbox = ControlInbox::new(&mut control, lease);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(worker = id, job_id = %job_id, "worker interrupted by shutdown");
                break;
            }
            _ = runner.run(assignment, inbox) => {}
        }

        let finished = WorkerEvent::Finished {
            worker: id,
            lease,
            job_id,
        };
        if events.send(finished).is_err() {
            break;
        }
    }
    debug!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inbox_filters_foreign_leases() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(ControlSignal {
            lease: 1,
            action: ControlAction::Cancel,
        })
        .await
        .unwrap();
        tx.send(ControlSignal {
            lease: 2,
            action: ControlAction::Pause,
        })
        .await
        .unwrap();

        let mut inbox = ControlInbox::new(&mut rx, 2);
        assert_eq!(inbox.try_recv(), Some(StopReason::Paused));
        assert_eq!(inbox.try_recv(), None);
    }

    #[tokio::test]
    async fn test_inbox_prefers_stronger_signal() {
        let (tx, mut rx) = mpsc::channel(8);
        for action in [ControlAction::Cancel, ControlAction::Pause] {
            tx.send(ControlSignal { lease: 5, action }).await.unwrap();
        }
        let mut inbox = ControlInbox::new(&mut rx, 5);
        assert_eq!(inbox.try_recv(), Some(StopReason::Cancelled));
    }

    #[tokio::test]
    async fn test_recv_waits_for_matching_lease() {
        let (tx, mut rx) = mpsc::channel(8);
        let sender = tokio::spawn(async move {
            tx.send(ControlSignal {
                lease: 1,
                action: ControlAction::Cancel,
            })
            .await
            .unwrap();
            tx.send(ControlSignal {
                lease: 3,
                action: ControlAction::Supersede,
            })
            .await
            .unwrap();
        });
        let mut inbox = ControlInbox::new(&mut rx, 3);
        assert_eq!(inbox.recv().await, StopReason::Superseded);
        sender.await.unwrap();
    }

    #[test]
    fn test_recv_pends_when_closed() {
        let (tx, mut rx) = mpsc::channel::<ControlSignal>(1);
        drop(tx);
        let mut inbox = ControlInbox::new(&mut rx, 1);
        let mut fut = tokio_test::task::spawn(inbox.recv());
        assert!(fut.poll().is_pending());
    }
}
