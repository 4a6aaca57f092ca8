//! Coordination store
//!
//! Values one phase hands to a later one live in the `<cluster>-upgrade`
//! ConfigMap, so an upgrade survives operator restarts. Writes are
//! read-modify-replace; a concurrent writer makes the replace fail with a
//! conflict and the caller retries on the next pass.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use tracing::debug;

use crate::crd::PatroniPostgres;
use crate::resources::common::child_meta;
use crate::upgrade::error::{Result, UpgradeError, conflict_aware};
use crate::upgrade::platform::Platform;

/// New database system identifier, written by primary-upgrade
pub const SYSTEM_IDENTIFIER: &str = "system-identifier";

/// System identifier of the data files before the upgrade, written by
/// capture-config
pub const SOURCE_SYSTEM_IDENTIFIER: &str = "source-system-identifier";

/// initdb arguments derived from the captured configuration
pub const PRIMARY_INIT_ARGS: &str = "primary-init-args";

/// WAL position all replicas reached before shutdown
pub const LATEST_CHECKPOINT_LOCATION: &str = "latest-checkpoint-location";

/// Node index of the Patroni leader
///
/// Snapshotted when the upgrade starts and refreshed once replica-sync has
/// paused Patroni, after which it no longer changes.
pub const SYNC_LEADER_INDEX: &str = "sync-leader-index";

pub fn store_name(cluster_name: &str) -> String {
    format!("{}-upgrade", cluster_name)
}

pub struct CoordinationStore<'a, P> {
    platform: &'a P,
    cluster: &'a PatroniPostgres,
    name: String,
}

impl<'a, P: Platform> CoordinationStore<'a, P> {
    pub fn new(platform: &'a P, cluster: &'a PatroniPostgres) -> Self {
        Self {
            platform,
            cluster,
            name: store_name(&cluster.name_any()),
        }
    }

    /// All entries; empty when the store has never been written
    pub async fn entries(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .platform
            .get_configmap(&self.name)
            .await?
            .and_then(|cm| cm.data)
            .unwrap_or_default())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().await?.remove(key))
    }

    /// Value of `key`, which an earlier phase must have written
    pub async fn require(&self, key: &'static str) -> Result<String> {
        self.get(key)
            .await?
            .ok_or(UpgradeError::MissingCoordinationKey(key))
    }

    pub async fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        self.update(|data| {
            data.insert(key.to_string(), value);
        })
        .await
    }

    pub async fn sync_leader_index(&self) -> Result<usize> {
        let raw = self.require(SYNC_LEADER_INDEX).await?;
        raw.parse()
            .map_err(|_| UpgradeError::SyncLeaderOutOfRange { member: raw })
    }

    /// Drop every entry
    pub async fn clear(&self) -> Result<()> {
        if self.platform.get_configmap(&self.name).await?.is_none() {
            return Ok(());
        }
        self.update(BTreeMap::clear).await
    }

    async fn update(&self, mutate: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        match self.platform.get_configmap(&self.name).await? {
            Some(mut cm) => {
                let mut data = cm.data.take().unwrap_or_default();
                let before = data.clone();
                mutate(&mut data);
                if data == before {
                    cm.data = Some(data);
                    return Ok(());
                }
                cm.data = Some(data);
                self.platform
                    .replace_configmap(&cm)
                    .await
                    .map_err(|e| conflict_aware(e, &self.name))?;
            }
            None => {
                let mut data = BTreeMap::new();
                mutate(&mut data);
                let cm = ConfigMap {
                    metadata: child_meta(self.cluster, self.name.clone()),
                    data: Some(data),
                    ..Default::default()
                };
                self.platform
                    .create_configmap(&cm)
                    .await
                    .map_err(|e| conflict_aware(e, &self.name))?;
            }
        }
        debug!(store = %self.name, "coordination store updated");
        Ok(())
    }
}
