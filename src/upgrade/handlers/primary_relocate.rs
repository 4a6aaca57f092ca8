//! Swap the upgraded data directory into place on the leader's volume

use kube::ResourceExt;
use tracing::info;

use super::PhaseContext;
use crate::crd::{PatroniPostgresStatus, UpgradePhase};
use crate::upgrade::error::Result;
use crate::upgrade::jobs::{DataPlaneJob, job_name};
use crate::upgrade::platform::{Platform, Propagation};

const PHASE: UpgradePhase = UpgradePhase::PrimaryRelocate;

const SCRIPT: &str = include_str!("../scripts/primary-relocate.sh");

pub(super) async fn handle<P: Platform>(
    ctx: &PhaseContext<'_, P>,
    status: &mut PatroniPostgresStatus,
) -> Result<bool> {
    let leader = ctx.store().sync_leader_index().await?;

    let job = DataPlaneJob {
        name: job_name(&ctx.cluster_name(), PHASE),
        phase: PHASE,
        image: ctx.upgrade_image(status)?,
        script: SCRIPT,
        claim_name: ctx.claim(status, leader)?,
        env: Vec::new(),
    }
    .with_env("OLD", status.version.to_string())
    .with_env("NEW", status.upgrade_version.to_string())
    .build(ctx.cluster);

    let Some(job) = ctx.run_job(PHASE, job).await? else {
        return Ok(false);
    };

    // Data files are in the new format from here on
    status.version = status.upgrade_version;
    info!(version = status.version, "primary data directory relocated");

    ctx.jobs()
        .remove(&job.name_any(), Propagation::Background)
        .await?;
    Ok(true)
}
