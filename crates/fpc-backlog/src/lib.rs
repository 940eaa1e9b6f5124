//! Remote service health and the backlog of deferred requests.
//!
//! Both live in small files in the data directory so every process sharing
//! the cache sees the same state:
//!
//! - `service-health`: [`HealthStatus`] as text, owned by [`HealthMonitor`]
//! - `time.mark`: JSON map of named timestamps ([`TimeMarks`])
//! - `backlog.queue`: the [`Backlog`] queue file
//!
//! All access goes through [`fpc_storage::Storage`], so the same code runs
//! over the filesystem and the key-value backend.

mod error;
mod health;
mod marks;
mod queue;

pub use error::BacklogError;
pub use health::{HealthMonitor, HealthStatus, ISSUE_WINDOW};
pub use marks::TimeMarks;
pub use queue::{Backlog, BacklogHeader, REPLAY_TTL};
