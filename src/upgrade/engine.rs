//! Upgrade pipeline engine
//!
//! The pipeline is the fixed chain of [`UpgradePhase::ALL`]. It holds no
//! state of its own: each call to [`Pipeline::advance`] reads the current
//! phase from `status.state`, runs that phase's handler once and moves the
//! state forward when the handler reports completion.
//!
//! ```text
//! ready ─begin─▶ capture-config → quiesce → replica-sync → scale-down →
//!                primary-upgrade → secondary-upgrade → primary-relocate →
//!                post-upgrade ─▶ ready
//! ```

use std::time::Duration;

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{info, warn};

use super::dcs;
use super::error::{Result, UpgradeError};
use super::handlers::{self, PhaseContext};
use super::platform::Platform;
use super::store::{CoordinationStore, SYNC_LEADER_INDEX};
use crate::config::OperatorConfig;
use crate::crd::{ClusterState, PatroniPostgres, PatroniPostgresStatus, UpgradePhase};

/// Requeue delay while a phase waits on jobs or workloads
pub const PHASE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Outcome of one engine pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advance {
    /// The current phase has work outstanding
    Pending(UpgradePhase),
    /// The previous phase finished; `status.state` now names this one
    Advanced(UpgradePhase),
    /// The last phase finished; the cluster is ready again
    Completed,
    /// `status.state` named no phase and was reset to the first one
    Reset,
}

impl Advance {
    /// Whether the next pass should run without waiting for an event
    pub fn requeue_now(&self) -> bool {
        !matches!(self, Advance::Pending(_))
    }

    pub fn action(&self) -> Action {
        if self.requeue_now() {
            Action::requeue(Duration::ZERO)
        } else {
            Action::requeue(PHASE_POLL_INTERVAL)
        }
    }
}

pub struct Pipeline<'a, P> {
    platform: &'a P,
    config: &'a OperatorConfig,
}

impl<'a, P: Platform> Pipeline<'a, P> {
    pub fn new(platform: &'a P, config: &'a OperatorConfig) -> Self {
        Self { platform, config }
    }

    /// Start an upgrade of a ready cluster to `spec.version`
    ///
    /// Records the current synchronous leader, which every data-plane phase
    /// operates on, and positions the pipeline at its first phase.
    pub async fn begin(
        &self,
        cluster: &PatroniPostgres,
        status: &mut PatroniPostgresStatus,
    ) -> Result<()> {
        let (from, to) = (status.version, cluster.spec.version);
        if self.config.images.for_upgrade(from, to).is_none() {
            return Err(UpgradeError::UnsupportedUpgrade { from, to });
        }

        let members = cluster.spec.nodes.len();
        let leader = dcs::sync_leader_index(self.platform, cluster, members).await?;

        // Leftovers of an abandoned attempt must not leak into this one
        let store = CoordinationStore::new(self.platform, cluster);
        store.clear().await?;
        store.set(SYNC_LEADER_INDEX, leader.to_string()).await?;

        status.upgrade_version = to;
        status.set_state(ClusterState::Upgrade(UpgradePhase::first()));
        info!(
            name = %cluster.name_any(),
            from,
            to,
            leader,
            "starting major version upgrade"
        );
        Ok(())
    }

    /// Run the current phase once
    ///
    /// Handler errors are returned unchanged and leave `status.state` where
    /// it was, so the same phase runs again on the next pass.
    pub async fn advance(
        &self,
        cluster: &PatroniPostgres,
        status: &mut PatroniPostgresStatus,
    ) -> Result<Advance> {
        let phase = match status.cluster_state() {
            Some(ClusterState::Upgrade(phase)) => phase,
            _ => {
                warn!(
                    name = %cluster.name_any(),
                    state = %status.state,
                    "no upgrade phase for state, restarting pipeline"
                );
                status.set_state(ClusterState::Upgrade(UpgradePhase::first()));
                return Ok(Advance::Reset);
            }
        };

        let ctx = PhaseContext {
            platform: self.platform,
            config: self.config,
            cluster,
        };
        if !handlers::handle(&ctx, phase, status).await? {
            return Ok(Advance::Pending(phase));
        }

        match phase.next() {
            Some(next) => {
                info!(name = %cluster.name_any(), from = %phase, to = %next, "upgrade phase complete");
                status.set_state(ClusterState::Upgrade(next));
                Ok(Advance::Advanced(next))
            }
            None => {
                ctx.store().clear().await?;
                status.upgrade_version = 0;
                status.set_state(ClusterState::Ready);
                info!(
                    name = %cluster.name_any(),
                    version = status.version,
                    "major version upgrade complete"
                );
                Ok(Advance::Completed)
            }
        }
    }
}
