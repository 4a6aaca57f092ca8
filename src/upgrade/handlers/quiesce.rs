//! Move the database to the maintenance port
//!
//! Clients reach the cluster on the regular port only, so switching ports
//! stops application traffic while the members keep replicating.

use tracing::debug;

use super::{PhaseContext, observed, ready_replicas};
use crate::crd::PatroniPostgresStatus;
use crate::resources::common::MAINTENANCE_PORT;
use crate::resources::patroni::{PodOptions, generate_statefulset, node_count};
use crate::resources::service::{ServiceOptions, generate_main_service};
use crate::upgrade::error::Result;
use crate::upgrade::platform::Platform;

pub(super) async fn handle<P: Platform>(
    ctx: &PhaseContext<'_, P>,
    status: &mut PatroniPostgresStatus,
) -> Result<bool> {
    let image = ctx.image_for(status.version)?;
    let sts = generate_statefulset(
        ctx.cluster,
        status.version,
        &image,
        &PodOptions::maintenance(ctx.cluster),
    );
    let applied = ctx.platform.apply_statefulset(&sts).await?;

    ctx.platform
        .apply_service(&generate_main_service(
            ctx.cluster,
            ServiceOptions::maintenance(MAINTENANCE_PORT),
        ))
        .await?;

    let nodes = node_count(ctx.cluster);
    let ready = ready_replicas(&applied);
    let updated = applied
        .status
        .as_ref()
        .and_then(|s| s.updated_replicas)
        .unwrap_or(0);
    status.ready = ready;

    debug!(ready, updated, nodes, "waiting for members on maintenance port");
    Ok(observed(&applied) && ready == nodes && updated == nodes)
}
