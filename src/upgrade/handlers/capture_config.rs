//! Capture the settings the new data directory must be initialized with

use kube::ResourceExt;
use tracing::info;

use super::PhaseContext;
use crate::crd::{PatroniPostgresStatus, UpgradePhase};
use crate::resources::common::POSTGRES_PORT;
use crate::upgrade::dcs;
use crate::upgrade::error::{Result, UpgradeError};
use crate::upgrade::jobs::WorkerJob;
use crate::upgrade::platform::{Platform, Propagation};
use crate::upgrade::result::parse_captured_config;
use crate::upgrade::store::{PRIMARY_INIT_ARGS, SOURCE_SYSTEM_IDENTIFIER};
use crate::worker::WorkerMode;

const PHASE: UpgradePhase = UpgradePhase::CaptureConfig;

pub(super) async fn handle<P: Platform>(
    ctx: &PhaseContext<'_, P>,
    _status: &mut PatroniPostgresStatus,
) -> Result<bool> {
    let job = WorkerJob::new(PHASE, WorkerMode::CaptureConfig, POSTGRES_PORT).build(
        ctx.cluster,
        ctx.members(),
        ctx.config,
    );

    let Some(job) = ctx.run_job(PHASE, job).await? else {
        return Ok(false);
    };
    let name = job.name_any();

    let line = ctx.jobs().read_result(&job).await?;
    let captured = parse_captured_config(&name, &line)?;

    if captured.max_prepared_transactions != 0 {
        // Checked again by a fresh job once the setting has been changed
        ctx.jobs().remove(&name, Propagation::Background).await?;
        return Err(UpgradeError::PreparedTransactions(
            captured.max_prepared_transactions,
        ));
    }

    let init_args = captured.init_args();
    let source_id = dcs::system_identifier(ctx.platform, ctx.cluster).await?;
    info!(init_args = %init_args, system_id = %source_id, "captured primary configuration");

    let store = ctx.store();
    store.set(PRIMARY_INIT_ARGS, init_args).await?;
    store.set(SOURCE_SYSTEM_IDENTIFIER, source_id).await?;
    ctx.jobs().remove(&name, Propagation::Background).await?;

    Ok(true)
}
