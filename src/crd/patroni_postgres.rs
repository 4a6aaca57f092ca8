use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// PatroniPostgres is the Schema for the patronipostgres API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kwebs.cloud",
    version = "v1alpha1",
    kind = "PatroniPostgres",
    plural = "patronipostgres",
    shortname = "ppg",
    namespaced,
    status = "PatroniPostgresStatus",
    printcolumn = r#"{"name":"Version", "type":"integer", "jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Target", "type":"integer", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PatroniPostgresSpec {
    /// Skip reconciliation entirely while set
    #[serde(default)]
    pub ignore: bool,

    /// Desired PostgreSQL major version (e.g. 15, 17)
    pub version: i32,

    /// Cluster members, in pod ordinal order
    pub nodes: Vec<Node>,

    /// Size of each member's data volume (e.g. "10Gi")
    pub volume_size: String,

    /// Type of the main Service (ClusterIP, NodePort, LoadBalancer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// Extra annotations for database pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// When set, members are required to land on distinct values of this topology key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_anti_affinity_topology_key: Option<String>,

    /// Names of image pull secrets for database and upgrade pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Resource requirements for database pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Peers allowed to reach the PostgreSQL port
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_control: Vec<AccessControlPeer>,
}

/// One cluster member
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Storage class of the member's data volume (cluster default if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Access mode of the member's data volume
    #[serde(default = "default_access_mode")]
    pub access_mode: String,

    #[serde(default)]
    pub tags: NodeTags,
}

fn default_access_mode() -> String {
    "ReadWriteOnce".to_string()
}

/// Patroni member tags
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTags {
    /// Never promote this member to synchronous standby
    #[serde(default)]
    pub nosync: bool,

    /// Never promote this member to leader
    #[serde(default)]
    pub nofailover: bool,
}

/// Pod toleration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

/// Resource requirements for database pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// A NetworkPolicy peer allowed to connect to the database port
///
/// Both selectors empty means "any pod in this namespace".
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlPeer {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<BTreeMap<String, String>>,
}

/// Status of the PatroniPostgres
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatroniPostgresStatus {
    /// Per-member data volume status, in node order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_statuses: Vec<VolumeStatus>,

    /// Ready database pods
    #[serde(default)]
    pub ready: i32,

    /// Major version the data files are currently in
    #[serde(default)]
    pub version: i32,

    /// Lifecycle state, see [`ClusterState`]
    #[serde(default)]
    pub state: String,

    /// Target major version of the in-flight upgrade, 0 when none
    #[serde(default)]
    pub upgrade_version: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl PatroniPostgresStatus {
    /// Parsed lifecycle state, `None` when uninitialized or unrecognized
    pub fn cluster_state(&self) -> Option<ClusterState> {
        self.state.parse().ok()
    }

    pub fn set_state(&mut self, state: ClusterState) {
        self.state = state.to_string();
    }

    pub fn upgrade_in_progress(&self) -> bool {
        self.upgrade_version != 0
    }

    /// Claim name of the given member's data volume
    pub fn claim_name(&self, index: usize) -> Option<&str> {
        self.volume_statuses
            .get(index)
            .map(|v| v.claim_name.as_str())
    }
}

/// Observed state of one member's data volume
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    pub claim_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Ordered phases of a major-version upgrade
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpgradePhase {
    CaptureConfig,
    Quiesce,
    ReplicaSync,
    ScaleDown,
    PrimaryUpgrade,
    SecondaryUpgrade,
    PrimaryRelocate,
    PostUpgrade,
}

impl UpgradePhase {
    /// All phases in execution order
    pub const ALL: [UpgradePhase; 8] = [
        UpgradePhase::CaptureConfig,
        UpgradePhase::Quiesce,
        UpgradePhase::ReplicaSync,
        UpgradePhase::ScaleDown,
        UpgradePhase::PrimaryUpgrade,
        UpgradePhase::SecondaryUpgrade,
        UpgradePhase::PrimaryRelocate,
        UpgradePhase::PostUpgrade,
    ];

    /// Phase every upgrade starts in
    pub fn first() -> Self {
        UpgradePhase::CaptureConfig
    }

    /// Phase following this one, `None` after the last
    pub fn next(self) -> Option<Self> {
        let position = Self::ALL.iter().position(|p| *p == self)?;
        Self::ALL.get(position + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradePhase::CaptureConfig => "capture-config",
            UpgradePhase::Quiesce => "quiesce",
            UpgradePhase::ReplicaSync => "replica-sync",
            UpgradePhase::ScaleDown => "scale-down",
            UpgradePhase::PrimaryUpgrade => "primary-upgrade",
            UpgradePhase::SecondaryUpgrade => "secondary-upgrade",
            UpgradePhase::PrimaryRelocate => "primary-relocate",
            UpgradePhase::PostUpgrade => "post-upgrade",
        }
    }
}

impl fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradePhase {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UpgradePhase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

/// Cluster lifecycle state as stored in `status.state`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterState {
    /// Steady-state resources converging
    Scaling,
    /// All members ready, no upgrade in flight
    Ready,
    /// Upgrade in flight, positioned at the given phase
    Upgrade(UpgradePhase),
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::Scaling => f.write_str("scaling"),
            ClusterState::Ready => f.write_str("ready"),
            ClusterState::Upgrade(phase) => f.write_str(phase.as_str()),
        }
    }
}

impl FromStr for ClusterState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scaling" => Ok(ClusterState::Scaling),
            "ready" => Ok(ClusterState::Ready),
            other => other.parse().map(ClusterState::Upgrade),
        }
    }
}

/// A `status.state` value that names no known state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cluster state: {0:?}")]
pub struct UnknownState(pub String);
