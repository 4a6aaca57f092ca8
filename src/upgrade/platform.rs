//! Object store access used by the upgrade pipeline
//!
//! [`Platform`] is the narrow set of namespaced operations the pipeline
//! performs. [`KubePlatform`] implements it against the API server; tests
//! substitute an in-memory implementation.

use std::future::Future;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use crate::resources::common::FIELD_MANAGER;

/// Upper bound on the job output read back from pod logs
pub const RESULT_WINDOW_BYTES: i64 = 2048;

/// How dependents of a deleted object are removed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Propagation {
    /// Return immediately, dependents are collected afterwards
    Background,
    /// Dependents are removed before the owner disappears
    Foreground,
}

impl Propagation {
    fn delete_params(self) -> DeleteParams {
        match self {
            Propagation::Background => DeleteParams::background(),
            Propagation::Foreground => DeleteParams::foreground(),
        }
    }
}

/// Namespaced operations needed by the upgrade pipeline
///
/// Getters return `Ok(None)` for absent objects and deletes of absent
/// objects succeed.
pub trait Platform: Send + Sync {
    fn get_job(&self, name: &str)
    -> impl Future<Output = Result<Option<Job>, kube::Error>> + Send;

    fn create_job(&self, job: &Job) -> impl Future<Output = Result<Job, kube::Error>> + Send;

    fn delete_job(
        &self,
        name: &str,
        propagation: Propagation,
    ) -> impl Future<Output = Result<(), kube::Error>> + Send;

    /// Last line written by the job's pod, `None` when there is nothing to read
    fn job_output(&self, job: &Job)
    -> impl Future<Output = Result<Option<String>, kube::Error>> + Send;

    fn apply_statefulset(
        &self,
        sts: &StatefulSet,
    ) -> impl Future<Output = Result<StatefulSet, kube::Error>> + Send;

    fn delete_statefulset(
        &self,
        name: &str,
        propagation: Propagation,
    ) -> impl Future<Output = Result<(), kube::Error>> + Send;

    fn apply_service(&self, svc: &Service) -> impl Future<Output = Result<(), kube::Error>> + Send;

    fn delete_service(&self, name: &str) -> impl Future<Output = Result<(), kube::Error>> + Send;

    fn get_configmap(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<ConfigMap>, kube::Error>> + Send;

    fn create_configmap(
        &self,
        cm: &ConfigMap,
    ) -> impl Future<Output = Result<ConfigMap, kube::Error>> + Send;

    /// Optimistic-concurrency update; fails with 409 when `cm` is stale
    fn replace_configmap(
        &self,
        cm: &ConfigMap,
    ) -> impl Future<Output = Result<ConfigMap, kube::Error>> + Send;
}

/// [`Platform`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
    namespace: String,
}

impl KubePlatform {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), kube::Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e),
    }
}

fn job_pod_selector(job: &Job) -> String {
    let labels = job
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .and_then(|s| s.match_labels.as_ref())
        .filter(|l| !l.is_empty());

    match labels {
        Some(labels) => labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(","),
        None => format!("job-name={}", job.name_any()),
    }
}

impl Platform for KubePlatform {
    async fn get_job(&self, name: &str) -> Result<Option<Job>, kube::Error> {
        self.api::<Job>().get_opt(name).await
    }

    async fn create_job(&self, job: &Job) -> Result<Job, kube::Error> {
        self.api::<Job>().create(&PostParams::default(), job).await
    }

    async fn delete_job(&self, name: &str, propagation: Propagation) -> Result<(), kube::Error> {
        ignore_not_found(
            self.api::<Job>()
                .delete(name, &propagation.delete_params())
                .await,
        )
    }

    async fn job_output(&self, job: &Job) -> Result<Option<String>, kube::Error> {
        let pods: Api<Pod> = self.api();
        let selector = job_pod_selector(job);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;

        // Prefer the pod that completed; restarted pods leave failed siblings
        let pod = list
            .items
            .iter()
            .find(|p| {
                p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Succeeded")
            })
            .or_else(|| list.items.first());

        let Some(pod) = pod else {
            debug!(job = %job.name_any(), "no pod found for job");
            return Ok(None);
        };

        let params = LogParams {
            tail_lines: Some(1),
            limit_bytes: Some(RESULT_WINDOW_BYTES),
            ..Default::default()
        };
        let logs = pods.logs(&pod.name_any(), &params).await?;

        Ok(logs
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }

    async fn apply_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet, kube::Error> {
        self.api::<StatefulSet>()
            .patch(
                &sts.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(sts),
            )
            .await
    }

    async fn delete_statefulset(
        &self,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), kube::Error> {
        ignore_not_found(
            self.api::<StatefulSet>()
                .delete(name, &propagation.delete_params())
                .await,
        )
    }

    async fn apply_service(&self, svc: &Service) -> Result<(), kube::Error> {
        self.api::<Service>()
            .patch(
                &svc.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(svc),
            )
            .await
            .map(|_| ())
    }

    async fn delete_service(&self, name: &str) -> Result<(), kube::Error> {
        ignore_not_found(
            self.api::<Service>()
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn get_configmap(&self, name: &str) -> Result<Option<ConfigMap>, kube::Error> {
        self.api::<ConfigMap>().get_opt(name).await
    }

    async fn create_configmap(&self, cm: &ConfigMap) -> Result<ConfigMap, kube::Error> {
        self.api::<ConfigMap>()
            .create(&PostParams::default(), cm)
            .await
    }

    async fn replace_configmap(&self, cm: &ConfigMap) -> Result<ConfigMap, kube::Error> {
        self.api::<ConfigMap>()
            .replace(&cm.name_any(), &PostParams::default(), cm)
            .await
    }
}
