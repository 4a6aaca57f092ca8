//! Service generation for Patroni-managed PostgreSQL clusters
//!
//! Patroni labels the current leader pod with `role=master`, so the main
//! Service always routes to the primary. While an upgrade is running the
//! Service is switched to the maintenance port and additionally exposes the
//! Patroni REST API for the upgrade worker.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::PatroniPostgres;
use crate::resources::common::{
    PATRONI_PORT, POSTGRES_PORT, child_meta, database_labels, headless_service_name,
};

/// Pod label Patroni maintains with the member's role
pub const ROLE_LABEL: &str = "role";

/// Role label value of the leader
pub const ROLE_MASTER: &str = "master";

/// Port exposure of the main Service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceOptions {
    pub postgres_port: i32,
    /// Also expose the Patroni REST API
    pub patroni_api: bool,
}

impl ServiceOptions {
    pub fn steady() -> Self {
        Self {
            postgres_port: POSTGRES_PORT,
            patroni_api: false,
        }
    }

    pub fn maintenance(port: i32) -> Self {
        Self {
            postgres_port: port,
            patroni_api: true,
        }
    }
}

fn tcp_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Selector matching the current leader pod
pub fn primary_selector(cluster_name: &str) -> BTreeMap<String, String> {
    let mut selector = database_labels(cluster_name);
    selector.insert(ROLE_LABEL.to_string(), ROLE_MASTER.to_string());
    selector
}

/// Generate the main (read-write) Service, named after the cluster
pub fn generate_main_service(cluster: &PatroniPostgres, options: ServiceOptions) -> Service {
    let name = cluster.name_any();

    let mut ports = vec![tcp_port("postgresql", options.postgres_port)];
    if options.patroni_api {
        ports.push(tcp_port("patroni", PATRONI_PORT));
    }

    Service {
        metadata: child_meta(cluster, name.clone()),
        spec: Some(ServiceSpec {
            type_: cluster.spec.service_type.clone(),
            selector: Some(primary_selector(&name)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the headless Service governing the StatefulSet
///
/// Gives every member a stable DNS name for replication.
pub fn generate_headless_service(cluster: &PatroniPostgres) -> Service {
    let cluster_name = cluster.name_any();

    Service {
        metadata: child_meta(cluster, headless_service_name(&cluster_name)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(database_labels(&cluster_name)),
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![
                tcp_port("postgresql", POSTGRES_PORT),
                tcp_port("patroni", PATRONI_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate a ClusterIP Service in front of pods carrying `selector`
///
/// Used for short-lived upgrade helpers such as the primary WAL streamer.
pub fn generate_internal_service(
    cluster: &PatroniPostgres,
    name: String,
    selector: BTreeMap<String, String>,
    port: i32,
) -> Service {
    Service {
        metadata: child_meta(cluster, name),
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![tcp_port("postgresql", port)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
