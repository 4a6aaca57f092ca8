//! PodDisruptionBudget generation
//!
//! Voluntary disruptions take down at most one member at a time, which keeps
//! a synchronous standby around while the leader is being evicted.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::PatroniPostgres;
use crate::resources::common::{child_meta, database_labels};

pub fn generate_pdb(cluster: &PatroniPostgres) -> PodDisruptionBudget {
    let name = cluster.name_any();

    PodDisruptionBudget {
        metadata: child_meta(cluster, name.clone()),
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(database_labels(&name)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
