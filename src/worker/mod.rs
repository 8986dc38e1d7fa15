//! Worker pool
//!
//! - [`WorkerPool`]: fixed number of worker actors with reserve/assign
//!   dispatch, crash replacement, and targeted control signals
//! - [`JobRegistry`]: `job_id → worker` ownership map
//! - [`JobRunner`]: what a worker does with an assignment

pub mod actor;
pub mod pool;
pub mod registry;

pub use actor::{Assignment, ControlAction, ControlInbox, ControlSignal, JobRunner};
pub use pool::{WorkerLease, WorkerPool};
pub use registry::{Holder, JobRegistry, WorkerId};
