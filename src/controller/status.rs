//! Status and conditions management for PatroniPostgres resources

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};

use crate::controller::error::Result;
use crate::crd::{Condition, PatroniPostgres, PatroniPostgresStatus};
use crate::resources::FIELD_MANAGER;

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// All members are ready
    pub const READY: &str = "Ready";
    /// Resources are converging or an upgrade is running
    pub const PROGRESSING: &str = "Progressing";
    /// The spec can be reconciled
    pub const CONFIG_VALID: &str = "ConfigurationValid";
    /// The upgrade cannot continue until the cluster is corrected
    pub const UPGRADE_BLOCKED: &str = "UpgradeBlocked";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

fn flag(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Start from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    ///
    /// The transition time only moves when the status changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, flag(is_ready), reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            flag(is_progressing),
            reason,
            message,
        )
    }

    pub fn config_valid(self, is_valid: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::CONFIG_VALID, flag(is_valid), reason, message)
    }

    pub fn upgrade_blocked(self, is_blocked: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::UPGRADE_BLOCKED,
            flag(is_blocked),
            reason,
            message,
        )
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Apply `update` to the conditions carried in `status`
pub fn update_conditions(
    status: &mut PatroniPostgresStatus,
    generation: Option<i64>,
    update: impl FnOnce(ConditionBuilder) -> ConditionBuilder,
) {
    let existing = std::mem::take(&mut status.conditions);
    status.conditions = update(ConditionBuilder::from_existing(existing, generation)).build();
}

/// Look up a condition by type
pub fn find_condition<'a>(status: &'a PatroniPostgresStatus, type_: &str) -> Option<&'a Condition> {
    status.conditions.iter().find(|c| c.type_ == type_)
}

/// Write `status` to the status subresource
pub async fn patch_status(
    api: &Api<PatroniPostgres>,
    cluster: &PatroniPostgres,
    status: &PatroniPostgresStatus,
) -> Result<()> {
    let patch = serde_json::json!({
        "status": status
    });
    api.patch_status(
        &cluster.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}
