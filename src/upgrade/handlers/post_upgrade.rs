//! Bring the upgraded cluster back into service
//!
//! Patroni is resumed through its dynamic configuration before the members
//! start, so the restored StatefulSet comes up managed. Extension updates and
//! statistics collection run once every member is ready.

use kube::ResourceExt;
use tracing::{debug, info};

use super::{PhaseContext, ready_replicas};
use crate::crd::{PatroniPostgresStatus, UpgradePhase};
use crate::resources::common::POSTGRES_PORT;
use crate::resources::patroni::{PodOptions, generate_statefulset, node_count};
use crate::resources::service::{ServiceOptions, generate_main_service};
use crate::upgrade::dcs;
use crate::upgrade::error::Result;
use crate::upgrade::jobs::WorkerJob;
use crate::upgrade::platform::{Platform, Propagation};
use crate::worker::WorkerMode;

const PHASE: UpgradePhase = UpgradePhase::PostUpgrade;

pub(super) async fn handle<P: Platform>(
    ctx: &PhaseContext<'_, P>,
    status: &mut PatroniPostgresStatus,
) -> Result<bool> {
    if dcs::resume_patroni(ctx.platform, ctx.cluster).await? {
        info!("patroni resumed");
    }

    let image = ctx.image_for(status.version)?;
    let sts = generate_statefulset(
        ctx.cluster,
        status.version,
        &image,
        &PodOptions::steady(ctx.cluster),
    );
    let applied = ctx.platform.apply_statefulset(&sts).await?;
    ctx.platform
        .apply_service(&generate_main_service(ctx.cluster, ServiceOptions::steady()))
        .await?;

    let nodes = node_count(ctx.cluster);
    status.ready = ready_replicas(&applied);
    if status.ready != nodes {
        debug!(ready = status.ready, nodes, "waiting for upgraded members");
        return Ok(false);
    }

    let job = WorkerJob::new(PHASE, WorkerMode::PostUpgrade, POSTGRES_PORT).build(
        ctx.cluster,
        ctx.members(),
        ctx.config,
    );
    let Some(job) = ctx.run_job(PHASE, job).await? else {
        return Ok(false);
    };

    ctx.jobs()
        .remove(&job.name_any(), Propagation::Foreground)
        .await?;
    Ok(true)
}
