//! Stop every member before the data files are touched
//!
//! Clients are already on the maintenance port, so the primary's shutdown
//! checkpoint is the only WAL written after replica-sync. Replicas stop after
//! the primary and replay it; the recorded checkpoint location stays a lower
//! bound of what every replica has replayed.

use tracing::debug;

use super::{PhaseContext, observed, ready_replicas};
use crate::crd::PatroniPostgresStatus;
use crate::resources::patroni::{PodOptions, generate_statefulset};
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
        &PodOptions::scaled_down(),
    );
    let applied = ctx.platform.apply_statefulset(&sts).await?;

    let sts_status = applied.status.clone().unwrap_or_default();
    let available = sts_status.available_replicas.unwrap_or(0);
    // Terminating pods still hold the data files open
    let remaining = sts_status.replicas;
    status.ready = ready_replicas(&applied);

    debug!(available, remaining, "waiting for members to stop");
    Ok(observed(&applied) && available == 0 && remaining == 0)
}
