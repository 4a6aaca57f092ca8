//! Patroni-managed PostgreSQL resources
//!
//! Patroni runs inside every database pod and uses the Kubernetes API as its
//! DCS: the `<cluster>-config`, `-leader`, `-sync` and `-failover` ConfigMaps
//! carry cluster state in their annotations. The operator only makes sure
//! those objects exist and are owned by the cluster; their contents belong to
//! Patroni.
//!
//! Reference: https://patroni.readthedocs.io/en/latest/kubernetes.html

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, Container, ContainerPort, EnvVar, EnvVarSource, ExecAction,
    HTTPGetAction, Lifecycle, LifecycleHandler, ObjectFieldSelector, PodAffinityTerm,
    PodAntiAffinity, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecretKeySelector,
    ServiceAccount, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{PatroniPostgres, ResourceList};
use crate::resources::common::{
    DATA_MOUNT_PATH, DATA_VOLUME, MAINTENANCE_PORT, PATRONI_PORT, POSTGRES_PORT, SUPERUSER,
    child_meta, container_security_context, database_labels, database_pod_security_context,
    headless_service_name, image_pull_secrets, node_selector, service_account_name, tolerations,
};
use crate::resources::secret::{REPLICATION_PASSWORD_KEY, SUPERUSER_PASSWORD_KEY};

/// Replication user created by Patroni
const REPLICATION_USER: &str = "standby";

/// Suffixes of the ConfigMaps Patroni uses as its DCS
pub const PATRONI_CONFIGMAPS: [&str; 4] = ["config", "leader", "sync", "failover"];

/// Annotation on `<cluster>-config` holding the database system identifier
pub const SYSTEM_ID_ANNOTATION: &str = "initialize";

/// Annotation on `<cluster>-sync` naming the current synchronous leader pod
pub const SYNC_LEADER_ANNOTATION: &str = "leader";

const PRE_STOP_PAUSED: &str = include_str!("scripts/pre-stop-paused.sh");

/// Name of one of Patroni's DCS ConfigMaps
pub fn dcs_configmap_name(cluster_name: &str, suffix: &str) -> String {
    format!("{}-{}", cluster_name, suffix)
}

/// Generate Patroni's DCS ConfigMaps (metadata only)
pub fn generate_dcs_configmaps(cluster: &PatroniPostgres) -> Vec<ConfigMap> {
    let cluster_name = cluster.name_any();
    PATRONI_CONFIGMAPS
        .iter()
        .map(|suffix| ConfigMap {
            metadata: child_meta(cluster, dcs_configmap_name(&cluster_name, suffix)),
            ..Default::default()
        })
        .collect()
}

/// Generate the ServiceAccount for database pods
pub fn generate_service_account(cluster: &PatroniPostgres) -> ServiceAccount {
    ServiceAccount {
        metadata: child_meta(cluster, service_account_name(&cluster.name_any())),
        ..Default::default()
    }
}

fn rule(resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec!["".to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// Generate the Role Patroni needs for its Kubernetes DCS
pub fn generate_role(cluster: &PatroniPostgres) -> Role {
    Role {
        metadata: child_meta(cluster, service_account_name(&cluster.name_any())),
        rules: Some(vec![
            rule(
                &["configmaps"],
                &["get", "list", "watch", "create", "update", "patch", "delete"],
            ),
            rule(
                &["endpoints"],
                &["get", "list", "watch", "create", "update", "patch", "delete"],
            ),
            rule(&["pods"], &["get", "list", "watch", "patch", "update"]),
            rule(&["services"], &["create"]),
        ]),
    }
}

/// Generate the RoleBinding for the database ServiceAccount
pub fn generate_role_binding(cluster: &PatroniPostgres) -> RoleBinding {
    let name = service_account_name(&cluster.name_any());

    RoleBinding {
        metadata: child_meta(cluster, name.clone()),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: cluster.namespace(),
            ..Default::default()
        }]),
    }
}

/// How the database pods are run
#[derive(Clone, Debug, PartialEq)]
pub struct PodOptions {
    pub replicas: i32,
    /// Port PostgreSQL listens on
    pub postgres_port: i32,
    /// Install the ordered shutdown hook needed while Patroni is paused
    pub paused: bool,
}

impl PodOptions {
    /// Regular operation: one pod per node on the client port
    pub fn steady(cluster: &PatroniPostgres) -> Self {
        Self {
            replicas: node_count(cluster),
            postgres_port: POSTGRES_PORT,
            paused: false,
        }
    }

    /// All members up, listening on the maintenance port only
    pub fn maintenance(cluster: &PatroniPostgres) -> Self {
        Self {
            postgres_port: MAINTENANCE_PORT,
            ..Self::steady(cluster)
        }
    }

    /// No pods, replicas stop after their primary
    pub fn scaled_down() -> Self {
        Self {
            replicas: 0,
            postgres_port: MAINTENANCE_PORT,
            paused: true,
        }
    }
}

pub fn node_count(cluster: &PatroniPostgres) -> i32 {
    i32::try_from(cluster.spec.nodes.len()).unwrap_or(i32::MAX)
}

fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

/// Container resources from the cluster spec
pub fn resource_requirements(cluster: &PatroniPostgres) -> Option<ResourceRequirements> {
    cluster
        .spec
        .resources
        .as_ref()
        .map(|r| ResourceRequirements {
            limits: r.limits.as_ref().map(quantities),
            requests: r.requests.as_ref().map(quantities),
            ..Default::default()
        })
}

/// Requests only, for upgrade pods that must not be throttled by limits
pub fn resource_requests(cluster: &PatroniPostgres) -> Option<ResourceRequirements> {
    let requests = cluster.spec.resources.as_ref()?.requests.as_ref()?;
    Some(ResourceRequirements {
        requests: Some(quantities(requests)),
        ..Default::default()
    })
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Environment variable sourced from the credentials Secret
pub fn secret_env(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Per-member Patroni tags, keyed by the member's pod name
pub fn node_tag_env(cluster: &PatroniPostgres) -> Vec<EnvVar> {
    let prefix = cluster.name_any().replace('-', "_");
    let mut envs = Vec::new();
    for (idx, node) in cluster.spec.nodes.iter().enumerate() {
        if node.tags.nosync {
            envs.push(env(
                &format!("PATRONI_NODE_{}_{}_TAG_nosync", prefix, idx),
                "true",
            ));
        }
        if node.tags.nofailover {
            envs.push(env(
                &format!("PATRONI_NODE_{}_{}_TAG_nofailover", prefix, idx),
                "true",
            ));
        }
    }
    envs
}

fn affinity(cluster: &PatroniPostgres) -> Option<Affinity> {
    let topology_key = cluster.spec.pod_anti_affinity_topology_key.as_ref()?;
    Some(Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                topology_key: topology_key.clone(),
                label_selector: Some(LabelSelector {
                    match_labels: Some(database_labels(&cluster.name_any())),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn patroni_probe(path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(PATRONI_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Labels Patroni puts on the pods and DCS objects it manages, as a JSON object
pub fn labels_json(labels: &BTreeMap<String, String>) -> String {
    serde_json::Value::Object(
        labels
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
    .to_string()
}

/// Generate the StatefulSet running the Patroni members
///
/// `version` selects `PG_VERSION` and must be served by `image`.
pub fn generate_statefulset(
    cluster: &PatroniPostgres,
    version: i32,
    image: &str,
    options: &PodOptions,
) -> StatefulSet {
    let name = cluster.name_any();
    let labels = database_labels(&name);
    let secret_name = crate::resources::common::credentials_secret_name(&name);

    let kubernetes_labels = labels_json(&labels);

    let mut env_vars = vec![
        env("PG_VERSION", version.to_string()),
        field_env("PATRONI_KUBERNETES_POD_IP", "status.podIP"),
        field_env("PATRONI_KUBERNETES_NAMESPACE", "metadata.namespace"),
        field_env("PATRONI_NAME", "metadata.name"),
        env("PATRONI_SCOPE", name.clone()),
        env("PATRONI_KUBERNETES_LABELS", kubernetes_labels),
        env("PATRONI_SUPERUSER_USERNAME", SUPERUSER),
        secret_env(
            "PATRONI_SUPERUSER_PASSWORD",
            &secret_name,
            SUPERUSER_PASSWORD_KEY,
        ),
        env("PATRONI_REPLICATION_USERNAME", REPLICATION_USER),
        secret_env(
            "PATRONI_REPLICATION_PASSWORD",
            &secret_name,
            REPLICATION_PASSWORD_KEY,
        ),
        env("PATRONI_INITIAL_SYNCHRONOUS_MODE", "true"),
    ];
    env_vars.extend(node_tag_env(cluster));

    if options.postgres_port != POSTGRES_PORT {
        env_vars.push(env("POSTGRESQL_PORT", options.postgres_port.to_string()));
    }

    let lifecycle = options.paused.then(|| {
        env_vars.push(env("PGDATA", format!("{}/data", DATA_MOUNT_PATH)));
        Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        PRE_STOP_PAUSED.to_string(),
                    ]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    });

    let readiness_probe = Probe {
        initial_delay_seconds: Some(5),
        success_threshold: Some(3),
        ..patroni_probe("/readiness")
    };

    let container = Container {
        name: "postgres".to_string(),
        image: Some(image.to_string()),
        env: Some(env_vars),
        ports: Some(vec![
            ContainerPort {
                container_port: options.postgres_port,
                name: Some("postgresql".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: PATRONI_PORT,
                name: Some("patroni".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        resources: resource_requirements(cluster),
        liveness_probe: Some(patroni_probe("/liveness")),
        readiness_probe: Some(readiness_probe),
        lifecycle,
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        security_context: Some(container_security_context()),
        ..Default::default()
    };

    // Claims are pre-created per node; the template only supplies the name
    let claim_template = k8s_openapi::api::core::v1::PersistentVolumeClaim {
        metadata: kube::core::ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(cluster.spec.volume_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut metadata = child_meta(cluster, name.clone());
    metadata.labels = Some(labels.clone());

    StatefulSet {
        metadata,
        spec: Some(StatefulSetSpec {
            replicas: Some(options.replicas),
            service_name: Some(headless_service_name(&name)),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            pod_management_policy: Some("Parallel".to_string()),
            min_ready_seconds: Some(60),
            template: PodTemplateSpec {
                metadata: Some(kube::core::ObjectMeta {
                    labels: Some(labels),
                    annotations: (!cluster.spec.annotations.is_empty())
                        .then(|| cluster.spec.annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(service_account_name(&name)),
                    enable_service_links: Some(false),
                    containers: vec![container],
                    affinity: affinity(cluster),
                    security_context: Some(database_pod_security_context()),
                    image_pull_secrets: image_pull_secrets(cluster),
                    node_selector: node_selector(cluster),
                    tolerations: tolerations(cluster),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![claim_template]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Parse the member index out of a Patroni member (pod) name
pub fn member_index(cluster_name: &str, member: &str) -> Option<usize> {
    member
        .strip_prefix(cluster_name)?
        .strip_prefix('-')?
        .parse()
        .ok()
}
