//! Reconciliation logic for PatroniPostgres resources
//!
//! Every pass starts from the stored status and ends by writing it back:
//!
//! ```text
//! empty state ─▶ initialize ─▶ steady pass (scaling ⇄ ready)
//! ready, spec.version ≠ status.version ─▶ begin upgrade
//! upgrade in flight ─▶ one pipeline step per pass ─▶ ready
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::status::{
    condition_status, condition_types, find_condition, patch_status, update_conditions,
};
use crate::controller::validation::{validate_spec, validate_version_upgrade};
use crate::crd::{ClusterState, PatroniPostgres, PatroniPostgresSpec, PatroniPostgresStatus};
use crate::resources::patroni::{self, PodOptions};
use crate::resources::service::{self, ServiceOptions};
use crate::resources::{FIELD_MANAGER, network_policy, pdb, pvc, secret};
use crate::upgrade::{Advance, KubePlatform, Pipeline, UpgradeError};

/// Requeue delay once every member is ready
pub const READY_REQUEUE: Duration = Duration::from_secs(60);

/// Requeue delay while members are still coming up
pub const SCALING_REQUEUE: Duration = Duration::from_secs(10);

/// What a pass does, decided from the stored status alone
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// No state recorded yet
    Initialize,
    /// Converge steady-state resources
    Steady,
    /// Ready with a different version requested
    BeginUpgrade,
    /// Upgrade in flight, hand over to the pipeline
    Upgrade,
}

pub fn next_step(spec: &PatroniPostgresSpec, status: &PatroniPostgresStatus) -> Step {
    if status.state.is_empty() {
        return Step::Initialize;
    }
    // A non-zero target is what marks an upgrade; the pipeline repairs the
    // state string itself when it names no phase
    if status.upgrade_in_progress() {
        return Step::Upgrade;
    }
    if status.cluster_state() == Some(ClusterState::Ready) && spec.version != status.version {
        return Step::BeginUpgrade;
    }
    Step::Steady
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<PatroniPostgres>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    // Owned objects are garbage collected through their owner references
    if cluster.metadata.deletion_timestamp.is_some() {
        ctx.retries.reset(&retry_key(&ns, &name));
        if let Some(health) = &ctx.health_state {
            health.metrics.forget_cluster(&ns, &name);
        }
        return Ok(Action::await_change());
    }

    if cluster.spec.ignore {
        debug!("ignore is set, skipping reconciliation");
        return Ok(Action::await_change());
    }

    let original = cluster.status.clone().unwrap_or_default();
    let mut status = original.clone();

    let result = reconcile_cluster(&cluster, &ctx, &ns, &mut status).await;

    status.observed_generation = cluster.metadata.generation;
    if status != original {
        let api: Api<PatroniPostgres> = Api::namespaced(ctx.client.clone(), &ns);
        if let Err(e) = patch_status(&api, &cluster, &status).await {
            // The pass error is the more useful one to surface
            if result.is_ok() {
                return Err(e);
            }
            warn!(error = %e, "failed to record status");
        }
    }

    if let Some(health) = &ctx.health_state {
        health.metrics.observe_cluster(
            &ns,
            &name,
            &status.state,
            i64::try_from(cluster.spec.nodes.len()).unwrap_or(i64::MAX),
            i64::from(status.ready),
        );
        if result.is_ok() {
            health
                .metrics
                .record_reconcile(&ns, &name, start.elapsed().as_secs_f64());
            health.touch();
        }
    }

    if result.is_ok() {
        ctx.retries.reset(&retry_key(&ns, &name));
    }
    result
}

fn retry_key(ns: &str, name: &str) -> String {
    format!("{}/{}", ns, name)
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<PatroniPostgres>, error: &Error, ctx: Arc<Context>) -> Action {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    if error.is_not_found() {
        debug!(%name, "object gone, waiting for the next change");
        return Action::await_change();
    }
    if let Some(health) = &ctx.health_state {
        health.metrics.record_error(&ns, &name);
    }

    let attempt = ctx.retries.next_attempt(&retry_key(&ns, &name));
    let delay = ctx.backoff.delay_for_error(error, attempt);
    if error.is_retryable() {
        warn!(%name, %error, attempt, ?delay, "retryable error, requeuing");
    } else {
        error!(%name, %error, ?delay, "non-retryable error, waiting for the cluster to be corrected");
    }
    Action::requeue(delay)
}

async fn reconcile_cluster(
    cluster: &PatroniPostgres,
    ctx: &Context,
    ns: &str,
    status: &mut PatroniPostgresStatus,
) -> Result<Action> {
    match next_step(&cluster.spec, status) {
        Step::Initialize => {
            validate(cluster, ctx, status)?;
            status.version = cluster.spec.version;
            status.set_state(ClusterState::Scaling);
            info!(version = status.version, "initializing cluster");
            apply_steady(cluster, ctx, ns, status).await
        }
        Step::Steady => {
            validate(cluster, ctx, status)?;
            apply_steady(cluster, ctx, ns, status).await
        }
        Step::BeginUpgrade => {
            validate(cluster, ctx, status)?;
            let (from, to) = (status.version, cluster.spec.version);
            if let Err(e) = validate_version_upgrade(from, to, &ctx.config.images) {
                warn!(from, to, error = %e, "requested version change rejected");
                let message = e.to_string();
                update_conditions(status, cluster.metadata.generation, |c| {
                    c.config_valid(false, "UnsupportedVersionChange", &message)
                });
                return apply_steady(cluster, ctx, ns, status).await;
            }
            begin_upgrade(cluster, ctx, ns, status).await
        }
        Step::Upgrade => continue_upgrade(cluster, ctx, ns, status).await,
    }
}

/// Record the spec validation outcome as the ConfigurationValid condition
fn validate(cluster: &PatroniPostgres, ctx: &Context, status: &mut PatroniPostgresStatus) -> Result<()> {
    let generation = cluster.metadata.generation;
    match validate_spec(cluster, &ctx.config.images) {
        Ok(()) => {
            update_conditions(status, generation, |c| {
                c.config_valid(true, "Valid", "Spec is valid")
            });
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            update_conditions(status, generation, |c| {
                c.config_valid(false, "InvalidSpec", &message)
            });
            Err(e)
        }
    }
}

async fn begin_upgrade(
    cluster: &PatroniPostgres,
    ctx: &Context,
    ns: &str,
    status: &mut PatroniPostgresStatus,
) -> Result<Action> {
    let platform = KubePlatform::new(ctx.client.clone(), ns);
    let pipeline = Pipeline::new(&platform, &ctx.config);

    if let Err(e) = pipeline.begin(cluster, status).await {
        record_upgrade_error(cluster, status, &e);
        return Err(e.into());
    }

    let message = format!(
        "Upgrading from {} to {}",
        status.version, status.upgrade_version
    );
    update_conditions(status, cluster.metadata.generation, |c| {
        c.progressing(true, "Upgrading", &message)
            .upgrade_blocked(false, "NotBlocked", "")
    });
    if let Some(health) = &ctx.health_state {
        health.metrics.record_phase_transition(&status.state);
    }
    Ok(Action::requeue(Duration::ZERO))
}

async fn continue_upgrade(
    cluster: &PatroniPostgres,
    ctx: &Context,
    ns: &str,
    status: &mut PatroniPostgresStatus,
) -> Result<Action> {
    let platform = KubePlatform::new(ctx.client.clone(), ns);
    let pipeline = Pipeline::new(&platform, &ctx.config);
    let generation = cluster.metadata.generation;

    let advance = match pipeline.advance(cluster, status).await {
        Ok(advance) => advance,
        Err(e) => {
            record_upgrade_error(cluster, status, &e);
            return Err(e.into());
        }
    };

    let blocked = find_condition(status, condition_types::UPGRADE_BLOCKED)
        .is_some_and(|c| c.status == condition_status::TRUE);
    if blocked {
        update_conditions(status, generation, |c| {
            c.upgrade_blocked(false, "Resumed", "")
        });
    }

    match advance {
        Advance::Pending(_) => {}
        Advance::Advanced(_) | Advance::Reset => {
            if let Some(health) = &ctx.health_state {
                health.metrics.record_phase_transition(&status.state);
            }
        }
        Advance::Completed => {
            let message = format!("Running PostgreSQL {}", status.version);
            update_conditions(status, generation, |c| {
                c.progressing(false, "UpgradeComplete", &message)
            });
            if let Some(health) = &ctx.health_state {
                health.metrics.record_phase_transition(&status.state);
            }
        }
    }
    Ok(advance.action())
}

/// Surface errors that stop the upgrade until the cluster is changed
fn record_upgrade_error(cluster: &PatroniPostgres, status: &mut PatroniPostgresStatus, error: &UpgradeError) {
    if !error.is_permanent() {
        return;
    }
    let message = error.to_string();
    update_conditions(status, cluster.metadata.generation, |c| {
        c.upgrade_blocked(true, error.reason(), &message)
    });
}

/// Converge the steady-state objects and derive `ready` and the state
async fn apply_steady(
    cluster: &PatroniPostgres,
    ctx: &Context,
    ns: &str,
    status: &mut PatroniPostgresStatus,
) -> Result<Action> {
    let claims: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), ns);
    let mut volume_statuses = Vec::with_capacity(cluster.spec.nodes.len());
    for index in 0..cluster.spec.nodes.len() {
        let desired = pvc::generate_claim(cluster, index);
        let claim = match claims.get_opt(&desired.name_any()).await? {
            Some(existing) => existing,
            None => {
                info!(claim = %desired.name_any(), "creating data volume claim");
                claims.create(&PostParams::default(), &desired).await?
            }
        };
        volume_statuses.push(pvc::volume_status(&claim));
    }
    status.volume_statuses = volume_statuses;

    // Passwords are random, an existing Secret is never touched
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), ns);
    let credentials = secret::generate_credentials_secret(cluster);
    if secrets.get_opt(&credentials.name_any()).await?.is_none() {
        info!(secret = %credentials.name_any(), "creating credentials secret");
        secrets.create(&PostParams::default(), &credentials).await?;
    }

    for cm in patroni::generate_dcs_configmaps(cluster) {
        apply_resource(ctx, ns, &cm).await?;
    }
    apply_resource(ctx, ns, &patroni::generate_service_account(cluster)).await?;
    apply_resource(ctx, ns, &patroni::generate_role(cluster)).await?;
    apply_resource(ctx, ns, &patroni::generate_role_binding(cluster)).await?;

    let image = ctx
        .config
        .images
        .for_version(status.version)
        .ok_or_else(|| {
            Error::InvalidConfig(format!("no image ships PostgreSQL {}", status.version))
        })?;
    let sts = apply_resource(
        ctx,
        ns,
        &patroni::generate_statefulset(
            cluster,
            status.version,
            image,
            &PodOptions::steady(cluster),
        ),
    )
    .await?;

    apply_resource(
        ctx,
        ns,
        &service::generate_main_service(cluster, ServiceOptions::steady()),
    )
    .await?;
    apply_resource(ctx, ns, &service::generate_headless_service(cluster)).await?;
    apply_resource(ctx, ns, &network_policy::generate_network_policy(cluster)).await?;
    apply_resource(ctx, ns, &pdb::generate_pdb(cluster)).await?;

    let nodes = patroni::node_count(cluster);
    status.ready = sts
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);

    let generation = cluster.metadata.generation;
    let message = format!("{}/{} members ready", status.ready, nodes);
    if status.ready == nodes {
        status.set_state(ClusterState::Ready);
        update_conditions(status, generation, |c| {
            c.ready(true, "AllMembersReady", &message)
                .progressing(false, "Stable", "Cluster is stable")
        });
        Ok(Action::requeue(READY_REQUEUE))
    } else {
        status.set_state(ClusterState::Scaling);
        update_conditions(status, generation, |c| {
            c.ready(false, "Scaling", &message)
                .progressing(true, "Scaling", &message)
        });
        Ok(Action::requeue(SCALING_REQUEUE))
    }
}

/// Apply a namespaced object with server-side apply, returning the result
async fn apply_resource<T>(ctx: &Context, ns: &str, resource: &T) -> Result<T>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Serialize
        + DeserializeOwned
        + Clone
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(ctx.client.clone(), ns);
    let name = resource.name_any();

    let applied = api
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(resource),
        )
        .await?;
    debug!(%name, "applied resource");
    Ok(applied)
}
