//! Which worker holds which job

use std::collections::HashMap;

use parking_lot::Mutex;

/// Index of a worker slot in the pool
pub type WorkerId = usize;

/// Current holder of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
    pub worker: WorkerId,
    /// Assignment id; control signals carry it so stale ones can be told apart
    pub lease: u64,
    /// Attempt recorded once the worker took ownership in the state manager
    pub attempt: Option<u32>,
}

#[derive(Default)]
struct RegistryState {
    by_job: HashMap<String, Holder>,
    by_worker: HashMap<WorkerId, String>,
}

/// `job_id → worker` map enforcing at most one worker per job
#[derive(Default)]
pub struct JobRegistry {
    state: Mutex<RegistryState>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `worker` holds `job_id`; fails if any worker already does
    pub fn claim(&self, job_id: &str, worker: WorkerId, lease: u64) -> bool {
        let mut state = self.state.lock();
        if state.by_job.contains_key(job_id) || state.by_worker.contains_key(&worker) {
            return false;
        }
        state.by_job.insert(
            job_id.to_string(),
            Holder {
                worker,
                lease,
                attempt: None,
            },
        );
        state.by_worker.insert(worker, job_id.to_string());
        true
    }

    pub fn record_attempt(&self, job_id: &str, lease: u64, attempt: u32) -> bool {
        let mut state = self.state.lock();
        match state.by_job.get_mut(job_id) {
            Some(holder) if holder.lease == lease => {
                holder.attempt = Some(attempt);
                true
            }
            _ => false,
        }
    }

    /// Drop the claim if it still belongs to `lease`
    pub fn release(&self, job_id: &str, lease: u64) -> Option<Holder> {
        let mut state = self.state.lock();
        let holder = *state.by_job.get(job_id)?;
        if holder.lease != lease {
            return None;
        }
        state.by_job.remove(job_id);
        state.by_worker.remove(&holder.worker);
        Some(holder)
    }

    pub fn holder(&self, job_id: &str) -> Option<Holder> {
        self.state.lock().by_job.get(job_id).copied()
    }

    pub fn job_of(&self, worker: WorkerId) -> Option<String> {
        self.state.lock().by_worker.get(&worker).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().by_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_worker_per_job() {
        let registry = JobRegistry::new();
        assert!(registry.claim("a", 0, 1));
        assert!(!registry.claim("a", 1, 2));
        assert!(!registry.claim("b", 0, 3));
        assert!(registry.claim("b", 1, 4));
        assert_eq!(registry.job_of(1).as_deref(), Some("b"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_release_requires_matching_lease() {
        let registry = JobRegistry::new();
        registry.claim("a", 0, 7);
        assert!(registry.record_attempt("a", 7, 3));
        assert!(!registry.record_attempt("a", 8, 4));
        assert!(registry.release("a", 8).is_none());

        let holder = registry.release("a", 7).unwrap();
        assert_eq!(holder.attempt, Some(3));
        assert!(registry.is_empty());
        assert!(registry.job_of(0).is_none());
    }
}
