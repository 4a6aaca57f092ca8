//! Common utilities for Kubernetes resource generation
//!
//! Names, labels, owner references and security contexts shared by the
//! steady-state generators and the upgrade jobs.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, LocalObjectReference, PodSecurityContext, SeccompProfile, SecurityContext,
    Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::PatroniPostgres;

/// API version for PatroniPostgres CRD
pub const API_VERSION: &str = "kwebs.cloud/v1alpha1";

/// Kind for PatroniPostgres CRD
pub const KIND: &str = "PatroniPostgres";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "patroni-operator";

/// Label carrying the owning cluster name
pub const CLUSTER_LABEL: &str = "kwebs.cloud/cluster";

/// PostgreSQL client port
pub const POSTGRES_PORT: i32 = 5432;

/// Port the database listens on while an upgrade keeps clients out
pub const MAINTENANCE_PORT: i32 = 55432;

/// Patroni REST API port
pub const PATRONI_PORT: i32 = 8008;

/// Where member data volumes are mounted; PGDATA lives in `data/` below it
pub const DATA_MOUNT_PATH: &str = "/var/lib/postgresql";

/// Name of the data volume in pod specs
pub const DATA_VOLUME: &str = "pgdata";

/// Superuser name used by Patroni and the upgrade worker
pub const SUPERUSER: &str = "postgres";

/// uid/gid of the postgres user inside the database image
pub const POSTGRES_UID: i64 = 15432;

/// Generate an owner reference for a PatroniPostgres
///
/// All child resources are garbage collected when the cluster is deleted.
pub fn owner_reference(cluster: &PatroniPostgres) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels shared by every object belonging to a cluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "patroni-postgres".to_string(),
        ),
        (
            "app.kubernetes.io/instance".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Labels of the database pods; also handed to Patroni as its member selector
pub fn database_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        "postgres".to_string(),
    );
    labels
}

/// Object metadata for a namespaced child owned by the cluster
pub fn child_meta(cluster: &PatroniPostgres, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(standard_labels(&cluster.name_any())),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}

/// Name of the Secret holding database credentials
pub fn credentials_secret_name(cluster_name: &str) -> String {
    format!("{}-credentials", cluster_name)
}

/// Name of the governing headless Service
pub fn headless_service_name(cluster_name: &str) -> String {
    format!("{}-headless", cluster_name)
}

/// Name of the ServiceAccount/Role/RoleBinding used by database pods
pub fn service_account_name(cluster_name: &str) -> String {
    format!("{}-patroni", cluster_name)
}

/// Name of the data claim of member `index`, as created by the StatefulSet
pub fn claim_name(cluster_name: &str, index: usize) -> String {
    format!("{}-{}-{}", DATA_VOLUME, cluster_name, index)
}

/// Patroni member (pod) name of member `index`
pub fn member_name(cluster_name: &str, index: usize) -> String {
    format!("{}-{}", cluster_name, index)
}

/// Pod security context shared by database and data-plane upgrade pods
pub fn database_pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_user: Some(POSTGRES_UID),
        run_as_group: Some(POSTGRES_UID),
        fs_group: Some(POSTGRES_UID),
        run_as_non_root: Some(true),
        fs_group_change_policy: Some("OnRootMismatch".to_string()),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Container security context with all capabilities dropped
pub fn container_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn image_pull_secrets(cluster: &PatroniPostgres) -> Option<Vec<LocalObjectReference>> {
    if cluster.spec.image_pull_secrets.is_empty() {
        return None;
    }
    Some(
        cluster
            .spec
            .image_pull_secrets
            .iter()
            .map(|name| LocalObjectReference { name: name.clone() })
            .collect(),
    )
}

pub fn tolerations(cluster: &PatroniPostgres) -> Option<Vec<Toleration>> {
    if cluster.spec.tolerations.is_empty() {
        return None;
    }
    Some(
        cluster
            .spec
            .tolerations
            .iter()
            .map(|t| Toleration {
                key: t.key.clone(),
                operator: t.operator.clone(),
                value: t.value.clone(),
                effect: t.effect.clone(),
                toleration_seconds: t.toleration_seconds,
            })
            .collect(),
    )
}

pub fn node_selector(cluster: &PatroniPostgres) -> Option<BTreeMap<String, String>> {
    if cluster.spec.node_selector.is_empty() {
        None
    } else {
        Some(cluster.spec.node_selector.clone())
    }
}
