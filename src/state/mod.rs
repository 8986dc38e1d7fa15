//! Job state machine and status broadcasting
//!
//! - [`JobStateManager`]: serialized per-job writer of the persisted record
//! - [`JobEvent`] / [`StatusUpdate`]: what subscribers receive
//! - [`JobView`]: idempotent reducer for at-least-once event delivery
//! - [`RetryPolicy`]: backoff applied to state writes

pub mod events;
pub mod manager;
pub mod retry;

pub use events::{JobEvent, JobView, StatusUpdate};
pub use manager::JobStateManager;
pub use retry::RetryPolicy;
