pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod upgrade;
pub mod worker;

pub use config::{ConfigError, ImageRegistry, OperatorConfig};
pub use controller::{BackoffConfig, Context, Error, Result, error_policy, reconcile};
pub use crd::{ClusterState, PatroniPostgres, UpgradePhase};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

/// Namespaced API when `namespace` is set, cluster-wide otherwise
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Run the PatroniPostgres controller until its stream ends.
///
/// When `namespace` is `Some(ns)`, only resources in that namespace are
/// watched. Metrics are recorded when `health_state` is provided.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    tracing::info!(
        scope = namespace.unwrap_or("cluster-wide"),
        worker_image = %config.worker_image,
        "Starting controller for PatroniPostgres resources"
    );

    let mut ctx = Context::new(client.clone(), config);
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
        ctx = ctx.with_health_state(state.clone());
    }
    let ctx = Arc::new(ctx);

    let clusters: Api<PatroniPostgres> = scoped_api(client.clone(), namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    // Owned objects, including upgrade jobs and the coordination ConfigMap,
    // trigger a pass of their cluster when they change
    Controller::new(clusters, watcher_config.clone())
        .owns(
            scoped_api::<StatefulSet>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<Service>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<ConfigMap>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<Secret>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<PersistentVolumeClaim>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<PodDisruptionBudget>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(scoped_api::<Job>(client, namespace), watcher_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // Watch events of owned objects can outlive their cluster
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists: {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    tracing::error!("Controller stream ended unexpectedly");
}
