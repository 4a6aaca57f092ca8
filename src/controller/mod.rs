pub mod context;
pub mod error;
pub mod reconciler;
pub mod status;
pub mod validation;

pub use context::Context;
pub use error::{BackoffConfig, Error, Result, RetryTracker};
pub use reconciler::{Step, error_policy, next_step, reconcile};
pub use status::{ConditionBuilder, condition_status, condition_types};
pub use validation::{MAX_NODES, validate_spec, validate_version_upgrade};
