//! Bring every replica to the primary's final WAL position
//!
//! The synchronization itself runs in a worker job (see
//! [`crate::worker::quorum`]); the job pauses Patroni before it exits.
//! Leadership is frozen from then on, so the leader the data-plane phases
//! operate on is read here.

use kube::ResourceExt;
use tracing::info;

use super::PhaseContext;
use crate::crd::{PatroniPostgresStatus, UpgradePhase};
use crate::resources::common::MAINTENANCE_PORT;
use crate::upgrade::dcs;
use crate::upgrade::error::Result;
use crate::upgrade::jobs::WorkerJob;
use crate::upgrade::platform::{Platform, Propagation};
use crate::upgrade::result::parse_sync_result;
use crate::upgrade::store::{LATEST_CHECKPOINT_LOCATION, SYNC_LEADER_INDEX};
use crate::worker::WorkerMode;

const PHASE: UpgradePhase = UpgradePhase::ReplicaSync;

/// Checkpoint rounds the worker runs before giving up
pub const MAX_SYNC_ROUNDS: u32 = 600;

pub(super) async fn handle<P: Platform>(
    ctx: &PhaseContext<'_, P>,
    _status: &mut PatroniPostgresStatus,
) -> Result<bool> {
    // No replicas to wait for
    if ctx.members() <= 1 {
        return Ok(true);
    }

    let job = WorkerJob::new(PHASE, WorkerMode::ReplicaSync, MAINTENANCE_PORT)
        .with_env("PAUSE", "true")
        .with_env("SYNC_MAX_ROUNDS", MAX_SYNC_ROUNDS.to_string())
        .build(ctx.cluster, ctx.members(), ctx.config);

    let Some(job) = ctx.run_job(PHASE, job).await? else {
        return Ok(false);
    };
    let name = job.name_any();

    let line = ctx.jobs().read_result(&job).await?;
    let synced = parse_sync_result(&name, &line)?;
    info!(lsn = %synced.lsn, rounds = synced.rounds, "replicas synchronized");

    let leader = dcs::sync_leader_index(ctx.platform, ctx.cluster, ctx.members()).await?;
    info!(leader, "leader frozen");

    let store = ctx.store();
    store.set(LATEST_CHECKPOINT_LOCATION, synced.lsn).await?;
    store.set(SYNC_LEADER_INDEX, leader.to_string()).await?;
    ctx.jobs().remove(&name, Propagation::Background).await?;

    Ok(true)
}
