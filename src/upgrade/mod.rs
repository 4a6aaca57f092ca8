//! Major-version upgrade orchestration
//!
//! Every pass derives its position from durable state only: the cluster
//! status, the per-cluster coordination store and the jobs and workloads that
//! currently exist. The operator can be restarted between any two passes.

pub mod dcs;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod platform;
pub mod result;
pub mod store;

pub use engine::{Advance, Pipeline};
pub use error::{Result, UpgradeError};
pub use platform::{KubePlatform, Platform, Propagation};
pub use store::CoordinationStore;
