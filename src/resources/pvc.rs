//! Data volume claims
//!
//! Claims are created ahead of the StatefulSet with the names its volume
//! claim template would produce, so each member can carry its own storage
//! class and access mode.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

use crate::crd::{PatroniPostgres, VolumeStatus};
use crate::resources::common::{child_meta, claim_name, database_labels};

/// Generate the claim of member `index`
pub fn generate_claim(cluster: &PatroniPostgres, index: usize) -> PersistentVolumeClaim {
    let cluster_name = cluster.name_any();
    let node = cluster.spec.nodes.get(index).cloned().unwrap_or_default();

    let mut metadata = child_meta(cluster, claim_name(&cluster_name, index));
    // The StatefulSet adopts claims whose labels match its selector
    metadata.labels = Some(database_labels(&cluster_name));

    PersistentVolumeClaim {
        metadata,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![node.access_mode]),
            storage_class_name: node.storage_class_name,
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(cluster.spec.volume_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Summarize an observed claim for `status.volumeStatuses`
pub fn volume_status(claim: &PersistentVolumeClaim) -> VolumeStatus {
    let status = claim.status.as_ref();
    VolumeStatus {
        claim_name: claim.name_any(),
        phase: status.and_then(|s| s.phase.clone()),
        capacity: status
            .and_then(|s| s.capacity.as_ref())
            .and_then(|c| c.get("storage"))
            .map(|q| q.0.clone()),
    }
}
