//! One handler per upgrade phase
//!
//! Every handler is called repeatedly until it reports `true`. Each call
//! re-derives the remaining work from the cluster status, the coordination
//! store and the live jobs and workloads; nothing is carried in memory
//! between passes.

mod capture_config;
mod post_upgrade;
mod primary_relocate;
mod primary_upgrade;
mod quiesce;
mod replica_sync;
mod scale_down;
mod secondary_upgrade;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;

use crate::config::OperatorConfig;
use crate::crd::{PatroniPostgres, PatroniPostgresStatus, UpgradePhase};
use crate::upgrade::error::{Result, UpgradeError};
use crate::upgrade::jobs::{JobManager, JobProgress};
use crate::upgrade::platform::Platform;
use crate::upgrade::store::CoordinationStore;

pub use replica_sync::MAX_SYNC_ROUNDS;
pub use secondary_upgrade::{STREAM_PORT, streamer_name};

/// Everything a handler needs besides the mutable status
pub struct PhaseContext<'a, P> {
    pub platform: &'a P,
    pub config: &'a OperatorConfig,
    pub cluster: &'a PatroniPostgres,
}

impl<'a, P: Platform> PhaseContext<'a, P> {
    pub fn cluster_name(&self) -> String {
        self.cluster.name_any()
    }

    pub fn members(&self) -> usize {
        self.cluster.spec.nodes.len()
    }

    pub fn jobs(&self) -> JobManager<'a, P> {
        JobManager::new(self.platform)
    }

    pub fn store(&self) -> CoordinationStore<'a, P> {
        CoordinationStore::new(self.platform, self.cluster)
    }

    /// Claim holding member `index`'s data
    pub fn claim(&self, status: &PatroniPostgresStatus, index: usize) -> Result<String> {
        status
            .claim_name(index)
            .map(str::to_string)
            .ok_or(UpgradeError::MissingVolumeStatus(index))
    }

    /// Database image running `version`
    pub fn image_for(&self, version: i32) -> Result<String> {
        self.config
            .images
            .for_version(version)
            .map(str::to_string)
            .ok_or(UpgradeError::UnsupportedVersion(version))
    }

    /// Database image shipping the binaries of both sides of the upgrade
    pub fn upgrade_image(&self, status: &PatroniPostgresStatus) -> Result<String> {
        let (from, to) = (status.version, status.upgrade_version);
        self.config
            .images
            .for_upgrade(from, to)
            .map(str::to_string)
            .ok_or(UpgradeError::UnsupportedUpgrade { from, to })
    }

    /// Drive a single job to completion
    ///
    /// Returns the job once it has succeeded. A failed job is deleted and
    /// reported as a failure of `phase`.
    pub async fn run_job(&self, phase: UpgradePhase, job: Job) -> Result<Option<Job>> {
        let jobs = self.jobs();
        match jobs.ensure(job).await? {
            JobProgress::Created | JobProgress::Running => Ok(None),
            JobProgress::Failed(job) => Err(jobs.fail(phase, &job).await),
            JobProgress::Succeeded(job) => Ok(Some(job)),
        }
    }
}

/// Ready members of an applied StatefulSet
pub(crate) fn ready_replicas(sts: &StatefulSet) -> i32 {
    sts.status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

/// Whether the StatefulSet controller has seen the latest spec
pub(crate) fn observed(sts: &StatefulSet) -> bool {
    let generation = sts.metadata.generation.unwrap_or(0);
    sts.status
        .as_ref()
        .and_then(|s| s.observed_generation)
        .is_some_and(|g| g >= generation)
}

/// Run the handler of `phase`; `true` when the phase is complete
pub async fn handle<P: Platform>(
    ctx: &PhaseContext<'_, P>,
    phase: UpgradePhase,
    status: &mut PatroniPostgresStatus,
) -> Result<bool> {
    match phase {
        UpgradePhase::CaptureConfig => capture_config::handle(ctx, status).await,
        UpgradePhase::Quiesce => quiesce::handle(ctx, status).await,
        UpgradePhase::ReplicaSync => replica_sync::handle(ctx, status).await,
        UpgradePhase::ScaleDown => scale_down::handle(ctx, status).await,
        UpgradePhase::PrimaryUpgrade => primary_upgrade::handle(ctx, status).await,
        UpgradePhase::SecondaryUpgrade => secondary_upgrade::handle(ctx, status).await,
        UpgradePhase::PrimaryRelocate => primary_relocate::handle(ctx, status).await,
        UpgradePhase::PostUpgrade => post_upgrade::handle(ctx, status).await,
    }
}
