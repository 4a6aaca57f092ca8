//! Run pg_upgrade on the leader's volume
//!
//! The upgraded cluster is written to `data.new` next to the old data
//! directory; the old one stays untouched until primary-relocate.
//!
//! The phase is complete once the new system identifier is in the store and
//! no job is left; pg_upgrade never runs twice on the same volume.

use kube::ResourceExt;
use tracing::info;

use super::PhaseContext;
use crate::crd::{PatroniPostgresStatus, UpgradePhase};
use crate::upgrade::dcs;
use crate::upgrade::error::Result;
use crate::upgrade::jobs::{DataPlaneJob, job_name};
use crate::upgrade::platform::{Platform, Propagation};
use crate::upgrade::result::parse_system_identifier;
use crate::upgrade::store::{PRIMARY_INIT_ARGS, SOURCE_SYSTEM_IDENTIFIER, SYSTEM_IDENTIFIER};

const PHASE: UpgradePhase = UpgradePhase::PrimaryUpgrade;

const SCRIPT: &str = include_str!("../scripts/primary-upgrade.sh");

pub(super) async fn handle<P: Platform>(
    ctx: &PhaseContext<'_, P>,
    status: &mut PatroniPostgresStatus,
) -> Result<bool> {
    let store = ctx.store();
    let name = job_name(&ctx.cluster_name(), PHASE);

    if let Some(system_id) = store.get(SYSTEM_IDENTIFIER).await? {
        if ctx.jobs().get(&name).await?.is_none() {
            dcs::publish_system_identifier(ctx.platform, ctx.cluster, &system_id).await?;
            info!(system_id = %system_id, "primary already upgraded");
            return Ok(true);
        }
    }

    let leader = store.sync_leader_index().await?;
    let job = DataPlaneJob {
        name,
        phase: PHASE,
        image: ctx.upgrade_image(status)?,
        script: SCRIPT,
        claim_name: ctx.claim(status, leader)?,
        env: Vec::new(),
    }
    .with_env("DB_SYSTEM_ID", store.require(SOURCE_SYSTEM_IDENTIFIER).await?)
    .with_env("OLD", status.version.to_string())
    .with_env("NEW", status.upgrade_version.to_string())
    .with_env("INITDB_ARGS", store.require(PRIMARY_INIT_ARGS).await?)
    .build(ctx.cluster);

    let Some(job) = ctx.run_job(PHASE, job).await? else {
        return Ok(false);
    };
    let name = job.name_any();

    let line = ctx.jobs().read_result(&job).await?;
    let system_id = parse_system_identifier(&name, &line)?;
    info!(system_id = %system_id, leader, "primary upgraded");

    store.set(SYSTEM_IDENTIFIER, system_id.clone()).await?;
    dcs::publish_system_identifier(ctx.platform, ctx.cluster, &system_id).await?;
    ctx.jobs().remove(&name, Propagation::Background).await?;

    Ok(true)
}
