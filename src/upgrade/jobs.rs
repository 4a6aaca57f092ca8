//! Ephemeral worker job management
//!
//! Each (cluster, phase) pair, or (cluster, phase, member) for per-member
//! work, maps to exactly one deterministic Job name. [`JobManager::ensure`]
//! creates the Job only when that name is free, so repeated passes never
//! start a second copy. Finished Jobs are deleted once their result has been
//! consumed.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{PatroniPostgres, UpgradePhase};
use crate::resources::common::{
    DATA_MOUNT_PATH, DATA_VOLUME, SUPERUSER, child_meta, container_security_context,
    credentials_secret_name, database_pod_security_context, image_pull_secrets, node_selector,
    standard_labels, tolerations,
};
use crate::resources::patroni::{resource_requests, secret_env};
use crate::resources::secret::SUPERUSER_PASSWORD_KEY;
use crate::upgrade::error::{Result, UpgradeError};
use crate::upgrade::platform::{Platform, Propagation};
use crate::worker::WorkerMode;

/// Deadline of jobs running the upgrade worker
pub const WORKER_DEADLINE_SECONDS: i64 = 300;

/// Deadline of jobs operating on data volumes
pub const DATA_PLANE_DEADLINE_SECONDS: i64 = 600;

/// Label carrying the upgrade phase a job belongs to
pub const PHASE_LABEL: &str = "kwebs.cloud/upgrade-phase";

/// Name of the job running `phase` for the whole cluster
pub fn job_name(cluster_name: &str, phase: UpgradePhase) -> String {
    format!("{}-{}", cluster_name, phase)
}

/// Name of the job running `phase` for one member
pub fn member_job_name(cluster_name: &str, phase: UpgradePhase, index: usize) -> String {
    format!("{}-{}-{}", cluster_name, phase, index)
}

/// Observed state of a phase job
#[derive(Clone, Debug)]
pub enum JobProgress {
    /// Created during this pass
    Created,
    /// Exists without a terminal count
    Running,
    Succeeded(Job),
    Failed(Job),
}

impl JobProgress {
    /// Classify an existing job by its terminal counts
    pub fn of(job: Job) -> Self {
        let status = job.status.clone().unwrap_or_default();
        if status.failed.unwrap_or(0) > 0 {
            JobProgress::Failed(job)
        } else if status.succeeded.unwrap_or(0) > 0 {
            JobProgress::Succeeded(job)
        } else {
            JobProgress::Running
        }
    }
}

pub struct JobManager<'a, P> {
    platform: &'a P,
}

impl<'a, P: Platform> JobManager<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        Self { platform }
    }

    /// Create `job` unless a job with its name already exists
    pub async fn ensure(&self, job: Job) -> Result<JobProgress> {
        let name = job.name_any();
        if let Some(existing) = self.platform.get_job(&name).await? {
            return Ok(JobProgress::of(existing));
        }

        match self.platform.create_job(&job).await {
            Ok(_) => {
                info!(job = %name, "created upgrade job");
                Ok(JobProgress::Created)
            }
            // Created by a pass that raced with this one
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(JobProgress::Running),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<JobProgress>> {
        Ok(self.platform.get_job(name).await?.map(JobProgress::of))
    }

    /// Result line of a succeeded job
    pub async fn read_result(&self, job: &Job) -> Result<String> {
        self.platform
            .job_output(job)
            .await?
            .ok_or_else(|| UpgradeError::MissingResult {
                job: job.name_any(),
            })
    }

    pub async fn remove(&self, name: &str, propagation: Propagation) -> Result<()> {
        debug!(job = %name, ?propagation, "deleting upgrade job");
        self.platform.delete_job(name, propagation).await?;
        Ok(())
    }

    /// Delete a failed job and report the failure against `phase`
    pub async fn fail(&self, phase: UpgradePhase, job: &Job) -> UpgradeError {
        let name = job.name_any();
        warn!(job = %name, %phase, "upgrade job failed");
        if let Err(e) = self.remove(&name, Propagation::Background).await {
            return e;
        }
        UpgradeError::JobFailed { phase, job: name }
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn job_labels(cluster: &PatroniPostgres, phase: UpgradePhase) -> BTreeMap<String, String> {
    let mut labels = standard_labels(&cluster.name_any());
    labels.insert(PHASE_LABEL.to_string(), phase.to_string());
    labels
}

fn job_metadata(
    cluster: &PatroniPostgres,
    name: String,
    phase: UpgradePhase,
) -> kube::core::ObjectMeta {
    let mut metadata = child_meta(cluster, name);
    metadata.labels = Some(job_labels(cluster, phase));
    metadata
}

/// A job running the upgrade worker against the cluster's main Service
pub struct WorkerJob {
    pub phase: UpgradePhase,
    pub mode: WorkerMode,
    /// Port the database currently listens on
    pub port: i32,
    pub extra_env: Vec<EnvVar>,
}

impl WorkerJob {
    pub fn new(phase: UpgradePhase, mode: WorkerMode, port: i32) -> Self {
        Self {
            phase,
            mode,
            port,
            extra_env: Vec::new(),
        }
    }

    pub fn with_env(mut self, name: &str, value: impl Into<String>) -> Self {
        self.extra_env.push(env(name, value));
        self
    }

    pub fn build(self, cluster: &PatroniPostgres, members: usize, config: &OperatorConfig) -> Job {
        let cluster_name = cluster.name_any();
        let name = job_name(&cluster_name, self.phase);

        let mut env_vars = vec![
            env("DBHOST", cluster_name.clone()),
            env("DBPORT", self.port.to_string()),
            env("DBUSER", SUPERUSER),
            secret_env(
                "DBPASSWORD",
                &credentials_secret_name(&cluster_name),
                SUPERUSER_PASSWORD_KEY,
            ),
            env("DBNAME", "postgres"),
            env("MODE", self.mode.as_str()),
            env("CLUSTER_NAME", cluster_name.clone()),
            env("CLUSTER_SIZE", members.to_string()),
        ];
        env_vars.extend(self.extra_env);

        let container = Container {
            name: self.mode.as_str().to_string(),
            image: Some(config.worker_image.clone()),
            command: Some(vec!["/upgrade-worker".to_string()]),
            env: Some(env_vars),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity("10m".to_string())),
                    ("memory".to_string(), Quantity("64Mi".to_string())),
                ])),
                ..Default::default()
            }),
            security_context: Some(container_security_context()),
            ..Default::default()
        };

        Job {
            metadata: job_metadata(cluster, name, self.phase),
            spec: Some(JobSpec {
                active_deadline_seconds: Some(WORKER_DEADLINE_SECONDS),
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(kube::core::ObjectMeta {
                        labels: Some(job_labels(cluster, self.phase)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        restart_policy: Some("Never".to_string()),
                        enable_service_links: Some(false),
                        security_context: Some(database_pod_security_context()),
                        image_pull_secrets: image_pull_secrets(cluster),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// A job running a shell script in the database image on one member's volume
pub struct DataPlaneJob<'s> {
    pub name: String,
    pub phase: UpgradePhase,
    pub image: String,
    pub script: &'s str,
    pub claim_name: String,
    pub env: Vec<EnvVar>,
}

impl DataPlaneJob<'_> {
    pub fn with_env(mut self, name: &str, value: impl Into<String>) -> Self {
        self.env.push(env(name, value));
        self
    }

    pub fn with_secret_env(mut self, var: EnvVar) -> Self {
        self.env.push(var);
        self
    }

    pub fn build(self, cluster: &PatroniPostgres) -> Job {
        let container = Container {
            name: self.phase.to_string(),
            image: Some(self.image),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                self.script.to_string(),
            ]),
            env: (!self.env.is_empty()).then_some(self.env),
            volume_mounts: Some(vec![VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: DATA_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            resources: resource_requests(cluster),
            security_context: Some(container_security_context()),
            ..Default::default()
        };

        Job {
            metadata: job_metadata(cluster, self.name, self.phase),
            spec: Some(JobSpec {
                active_deadline_seconds: Some(DATA_PLANE_DEADLINE_SECONDS),
                completions: Some(1),
                template: PodTemplateSpec {
                    metadata: Some(kube::core::ObjectMeta {
                        labels: Some(job_labels(cluster, self.phase)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(vec![Volume {
                            name: DATA_VOLUME.to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: self.claim_name,
                                read_only: None,
                            }),
                            ..Default::default()
                        }]),
                        restart_policy: Some("OnFailure".to_string()),
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
}
