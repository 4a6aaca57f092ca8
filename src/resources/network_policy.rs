//! NetworkPolicy generation
//!
//! Members may talk to each other on any port (replication, Patroni API).
//! Everything else only reaches the PostgreSQL port, and only from the peers
//! listed in `spec.accessControl`.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{AccessControlPeer, PatroniPostgres};
use crate::resources::common::{POSTGRES_PORT, child_meta, standard_labels};

fn selector(labels: &BTreeMap<String, String>) -> LabelSelector {
    LabelSelector {
        match_labels: (!labels.is_empty()).then(|| labels.clone()),
        ..Default::default()
    }
}

fn peer(access: &AccessControlPeer) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(selector(&access.pod_selector)),
        namespace_selector: access.namespace_selector.as_ref().map(selector),
        ..Default::default()
    }
}

/// Generate the NetworkPolicy, named after the cluster
///
/// Pods of the cluster (database members and upgrade jobs) share the
/// standard labels, so the intra-cluster rule also admits the upgrade worker.
pub fn generate_network_policy(cluster: &PatroniPostgres) -> NetworkPolicy {
    let name = cluster.name_any();
    let members = selector(&standard_labels(&name));

    let ingress = vec![
        NetworkPolicyIngressRule {
            from: Some(vec![NetworkPolicyPeer {
                pod_selector: Some(members.clone()),
                ..Default::default()
            }]),
            ports: None,
        },
        NetworkPolicyIngressRule {
            from: Some(cluster.spec.access_control.iter().map(peer).collect()),
            ports: Some(vec![NetworkPolicyPort {
                port: Some(IntOrString::Int(POSTGRES_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
        },
    ];

    NetworkPolicy {
        metadata: child_meta(cluster, name),
        spec: Some(NetworkPolicySpec {
            pod_selector: members,
            ingress: Some(ingress),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        }),
    }
}
