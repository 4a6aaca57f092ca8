//! Error types for the upgrade pipeline
//!
//! Errors fall into four classes:
//! - **Transient**: API failures and update conflicts, retried on the next pass
//! - **Job failure**: a worker job reported `failed > 0`; the job is deleted
//!   and the same phase runs again
//! - **Precondition**: the cluster cannot be upgraded as it is; the pipeline
//!   stays put until the condition is corrected
//! - **Malformed result**: a job succeeded but its output is unusable; the job
//!   is kept for inspection

use thiserror::Error;

use crate::crd::UpgradePhase;

#[derive(Error, Debug)]
pub enum UpgradeError {
    // Transient
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("concurrent modification of {0}, retrying")]
    Conflict(String),

    // Job failure
    #[error("{phase} job {job} failed")]
    JobFailed { phase: UpgradePhase, job: String },

    // Precondition
    #[error("max_prepared_transactions is {0}, must be 0 to upgrade")]
    PreparedTransactions(i64),

    #[error("no volume status recorded for member {0}")]
    MissingVolumeStatus(usize),

    #[error("no image ships PostgreSQL {0}")]
    UnsupportedVersion(i32),

    #[error("no image ships both PostgreSQL {from} and {to}")]
    UnsupportedUpgrade { from: i32, to: i32 },

    #[error("coordination key {0} not set")]
    MissingCoordinationKey(&'static str),

    #[error("Patroni has not published a sync leader")]
    NoSyncLeader,

    #[error("sync leader {member:?} is not a member of this cluster")]
    SyncLeaderOutOfRange { member: String },

    // Malformed result
    #[error("job {job} produced no output")]
    MissingResult { job: String },

    #[error("job {job} produced malformed output: {reason}")]
    MalformedResult { job: String, reason: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl UpgradeError {
    /// Retried with backoff at the reconciliation cadence
    pub fn is_retryable(&self) -> bool {
        match self {
            UpgradeError::KubeError(kube::Error::Api(api_err)) => {
                let code = api_err.code;
                !(400..500).contains(&code) || code == 409 || code == 429
            }
            UpgradeError::KubeError(_) => true,
            UpgradeError::Conflict(_) => true,
            UpgradeError::MissingResult { .. } => true,
            UpgradeError::NoSyncLeader => true,
            // Retried after the job has been deleted
            UpgradeError::JobFailed { .. } => true,
            _ => false,
        }
    }

    /// Blocks the upgrade until the cluster is changed externally
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            UpgradeError::PreparedTransactions(_)
                | UpgradeError::MissingVolumeStatus(_)
                | UpgradeError::UnsupportedVersion(_)
                | UpgradeError::UnsupportedUpgrade { .. }
                | UpgradeError::MissingCoordinationKey(_)
                | UpgradeError::SyncLeaderOutOfRange { .. }
        )
    }

    pub fn is_job_failure(&self) -> bool {
        matches!(self, UpgradeError::JobFailed { .. })
    }

    pub fn is_malformed_result(&self) -> bool {
        matches!(
            self,
            UpgradeError::MalformedResult { .. } | UpgradeError::SerializationError(_)
        )
    }

    /// Short reason string for status conditions
    pub fn reason(&self) -> &'static str {
        if self.is_job_failure() {
            "JobFailed"
        } else if self.is_permanent() {
            "PreconditionFailed"
        } else if self.is_malformed_result() {
            "MalformedJobResult"
        } else {
            "Transient"
        }
    }
}

/// Convert a conflicting update into [`UpgradeError::Conflict`]
pub(crate) fn conflict_aware(err: kube::Error, object: &str) -> UpgradeError {
    match err {
        kube::Error::Api(ref api_err) if api_err.code == 409 => {
            UpgradeError::Conflict(object.to_string())
        }
        other => UpgradeError::KubeError(other),
    }
}

pub type Result<T, E = UpgradeError> = std::result::Result<T, E>;
