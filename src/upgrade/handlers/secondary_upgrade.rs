//! Rebuild every replica from the upgraded primary
//!
//! A single-pod streamer serves the leader's `data.new` over the replication
//! protocol. One clone job per replica runs pg_basebackup against it and
//! swaps the copy in. All jobs have to succeed before the streamer is torn
//! down.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, Probe, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{info, warn};

use super::PhaseContext;
use crate::crd::{PatroniPostgres, PatroniPostgresStatus, UpgradePhase};
use crate::resources::common::{
    DATA_MOUNT_PATH, DATA_VOLUME, child_meta, container_security_context,
    credentials_secret_name, database_pod_security_context, image_pull_secrets, node_selector,
    standard_labels, tolerations,
};
use crate::resources::patroni::{resource_requests, secret_env};
use crate::resources::secret::SUPERUSER_PASSWORD_KEY;
use crate::resources::service::generate_internal_service;
use crate::upgrade::error::{Result, UpgradeError};
use crate::upgrade::jobs::{DataPlaneJob, JobProgress, member_job_name};
use crate::upgrade::platform::{Platform, Propagation};
use crate::upgrade::store::{LATEST_CHECKPOINT_LOCATION, SYSTEM_IDENTIFIER};

const PHASE: UpgradePhase = UpgradePhase::SecondaryUpgrade;

const STREAM_SCRIPT: &str = include_str!("../scripts/primary-stream.sh");
const CLONE_SCRIPT: &str = include_str!("../scripts/secondary-clone.sh");

/// Port the streamer accepts replication connections on
pub const STREAM_PORT: i32 = 5873;

pub fn streamer_name(cluster_name: &str) -> String {
    format!("{}-pstream", cluster_name)
}

fn streamer_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert("kwebs.cloud/upgrade".to_string(), "pstream".to_string());
    labels
}

/// Single-replica workload serving the upgraded leader volume
pub fn generate_streamer(
    cluster: &PatroniPostgres,
    claim_name: &str,
    image: &str,
    new_version: i32,
) -> StatefulSet {
    let cluster_name = cluster.name_any();
    let name = streamer_name(&cluster_name);
    let labels = streamer_labels(&cluster_name);

    let container = Container {
        name: "pstream".to_string(),
        image: Some(image.to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            STREAM_SCRIPT.to_string(),
        ]),
        env: Some(vec![
            EnvVar {
                name: "NEW".to_string(),
                value: Some(new_version.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "STREAM_PORT".to_string(),
                value: Some(STREAM_PORT.to_string()),
                ..Default::default()
            },
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("pstream".to_string()),
            container_port: STREAM_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::String("pstream".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        resources: resource_requests(cluster),
        security_context: Some(container_security_context()),
        ..Default::default()
    };

    StatefulSet {
        metadata: child_meta(cluster, name.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            service_name: Some(name),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(kube::core::ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: DATA_VOLUME.to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: claim_name.to_string(),
                            read_only: None,
                        }),
                        ..Default::default()
                    }]),
                    enable_service_links: Some(false),
                    security_context: Some(database_pod_security_context()),
                    image_pull_secrets: image_pull_secrets(cluster),
                    node_selector: node_selector(cluster),
                    tolerations: tolerations(cluster),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(super) async fn handle<P: Platform>(
    ctx: &PhaseContext<'_, P>,
    status: &mut PatroniPostgresStatus,
) -> Result<bool> {
    let members = ctx.members();
    if members <= 1 {
        return Ok(true);
    }

    let cluster_name = ctx.cluster_name();
    let store = ctx.store();
    let leader = store.sync_leader_index().await?;
    let checkpoint = store.require(LATEST_CHECKPOINT_LOCATION).await?;
    let system_id = store.require(SYSTEM_IDENTIFIER).await?;
    let image = ctx.upgrade_image(status)?;

    let stream = streamer_name(&cluster_name);
    ctx.platform
        .apply_statefulset(&generate_streamer(
            ctx.cluster,
            &ctx.claim(status, leader)?,
            &image,
            status.upgrade_version,
        ))
        .await?;
    ctx.platform
        .apply_service(&generate_internal_service(
            ctx.cluster,
            stream.clone(),
            streamer_labels(&cluster_name),
            STREAM_PORT,
        ))
        .await?;

    let jobs = ctx.jobs();
    let mut names = Vec::with_capacity(members - 1);
    let mut failed = Vec::new();
    let mut succeeded = 0;

    for index in (0..members).filter(|i| *i != leader) {
        let name = member_job_name(&cluster_name, PHASE, index);
        let job = DataPlaneJob {
            name: name.clone(),
            phase: PHASE,
            image: image.clone(),
            script: CLONE_SCRIPT,
            claim_name: ctx.claim(status, index)?,
            env: Vec::new(),
        }
        .with_env("PRIMARY_ADDRESS", stream.clone())
        .with_env("PRIMARY_PORT", STREAM_PORT.to_string())
        .with_env("DB_CHECKPOINT", checkpoint.clone())
        .with_env("OLD", status.version.to_string())
        .with_env("NEW", status.upgrade_version.to_string())
        .with_env("NEW_DB_SYSTEM_ID", system_id.clone())
        .with_secret_env(secret_env(
            "PGPASSWORD",
            &credentials_secret_name(&cluster_name),
            SUPERUSER_PASSWORD_KEY,
        ))
        .build(ctx.cluster);

        match jobs.ensure(job).await? {
            JobProgress::Succeeded(_) => succeeded += 1,
            JobProgress::Failed(_) => {
                warn!(job = %name, member = index, "replica clone failed");
                jobs.remove(&name, Propagation::Foreground).await?;
                failed.push(name.clone());
            }
            JobProgress::Created | JobProgress::Running => {}
        }
        names.push(name);
    }

    if let Some(job) = failed.into_iter().next() {
        return Err(UpgradeError::JobFailed { phase: PHASE, job });
    }

    if succeeded < names.len() {
        return Ok(false);
    }

    info!(replicas = names.len(), "all replicas cloned");
    ctx.platform
        .delete_statefulset(&stream, Propagation::Background)
        .await?;
    ctx.platform.delete_service(&stream).await?;
    for name in &names {
        jobs.remove(name, Propagation::Background).await?;
    }

    Ok(true)
}
