//! Reading and writing Patroni's Kubernetes DCS annotations

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;

use crate::crd::PatroniPostgres;
use crate::resources::common::child_meta;
use crate::resources::patroni::{
    SYNC_LEADER_ANNOTATION, SYSTEM_ID_ANNOTATION, dcs_configmap_name, member_index,
};
use crate::upgrade::error::{Result, UpgradeError, conflict_aware};
use crate::upgrade::platform::Platform;

/// Node index of the current Patroni leader
///
/// A single-member cluster has no sync state; its only member leads.
pub async fn sync_leader_index<P: Platform>(
    platform: &P,
    cluster: &PatroniPostgres,
    members: usize,
) -> Result<usize> {
    if members <= 1 {
        return Ok(0);
    }

    let cluster_name = cluster.name_any();
    let leader = platform
        .get_configmap(&dcs_configmap_name(&cluster_name, "sync"))
        .await?
        .and_then(|cm| cm.metadata.annotations)
        .and_then(|mut a| a.remove(SYNC_LEADER_ANNOTATION))
        .ok_or(UpgradeError::NoSyncLeader)?;

    match member_index(&cluster_name, &leader) {
        Some(index) if index < members => Ok(index),
        _ => Err(UpgradeError::SyncLeaderOutOfRange { member: leader }),
    }
}

/// System identifier Patroni has recorded for the cluster
pub async fn system_identifier<P: Platform>(
    platform: &P,
    cluster: &PatroniPostgres,
) -> Result<String> {
    platform
        .get_configmap(&dcs_configmap_name(&cluster.name_any(), "config"))
        .await?
        .and_then(|cm| cm.metadata.annotations)
        .and_then(|mut a| a.remove(SYSTEM_ID_ANNOTATION))
        .ok_or(UpgradeError::MissingCoordinationKey(SYSTEM_ID_ANNOTATION))
}

/// Make Patroni accept a data directory with a new system identifier
pub async fn publish_system_identifier<P: Platform>(
    platform: &P,
    cluster: &PatroniPostgres,
    system_id: &str,
) -> Result<()> {
    let name = dcs_configmap_name(&cluster.name_any(), "config");

    match platform.get_configmap(&name).await? {
        Some(mut cm) => {
            let annotations = cm.metadata.annotations.get_or_insert_with(BTreeMap::new);
            if annotations.get(SYSTEM_ID_ANNOTATION).map(String::as_str) == Some(system_id) {
                return Ok(());
            }
            annotations.insert(SYSTEM_ID_ANNOTATION.to_string(), system_id.to_string());
            platform
                .replace_configmap(&cm)
                .await
                .map_err(|e| conflict_aware(e, &name))?;
        }
        None => {
            let mut metadata = child_meta(cluster, name.clone());
            metadata.annotations = Some(BTreeMap::from([(
                SYSTEM_ID_ANNOTATION.to_string(),
                system_id.to_string(),
            )]));
            platform
                .create_configmap(&ConfigMap {
                    metadata,
                    ..Default::default()
                })
                .await
                .map_err(|e| conflict_aware(e, &name))?;
        }
    }
    Ok(())
}

/// Annotation on `<cluster>-config` holding Patroni's dynamic configuration
pub const DYNAMIC_CONFIG_ANNOTATION: &str = "config";

/// Clear Patroni's maintenance mode in the stored dynamic configuration
///
/// Members started afterwards come up with automatic failover enabled.
/// Returns whether the configuration changed.
pub async fn resume_patroni<P: Platform>(platform: &P, cluster: &PatroniPostgres) -> Result<bool> {
    let name = dcs_configmap_name(&cluster.name_any(), "config");
    let Some(mut cm) = platform.get_configmap(&name).await? else {
        return Ok(false);
    };
    let Some(raw) = cm
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DYNAMIC_CONFIG_ANNOTATION))
    else {
        return Ok(false);
    };

    let mut config: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw)?;
    if config.remove("pause").is_none() {
        return Ok(false);
    }

    let updated = serde_json::to_string(&config)?;
    cm.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(DYNAMIC_CONFIG_ANNOTATION.to_string(), updated);
    platform
        .replace_configmap(&cm)
        .await
        .map_err(|e| conflict_aware(e, &name))?;
    Ok(true)
}
