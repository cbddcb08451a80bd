use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set by the external cluster agents while a restart is
/// required for pending configuration to take effect.
pub const CONDITION_PENDING_RESTART: &str = "PendingRestart";

/// Condition type written by the operator when a reconcile cycle fails.
pub const CONDITION_FAILED: &str = "Failed";

/// PostgresSpec selects the Postgres major/minor version to run.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresSpec {
    pub version: String,

    /// Postgres parameters pushed through the coordination layer.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub parameters: std::collections::BTreeMap<String, String>,
}

/// PersistentVolumeSpec sizes the data volume of each instance.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeSpec {
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// ResourcesSpec toggles how instance profile sizing is applied.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSpec {
    #[serde(default)]
    pub enable_cluster_limits_requirements: bool,
}

/// NonProductionOptions relax resource sizing for test environments.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NonProductionOptions {
    #[serde(default)]
    pub disable_cluster_resource_requirements: bool,
    #[serde(default)]
    pub enable_set_cluster_cpu_requests: bool,
    #[serde(default)]
    pub enable_set_cluster_memory_requests: bool,
}

/// Observed state shared by every managed workload kind.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_version: Option<String>,
}

impl WorkloadStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True when the `PendingRestart` condition is set to `True`.
    pub fn is_pending_restart(&self) -> bool {
        self.condition(CONDITION_PENDING_RESTART)
            .is_some_and(|c| c.status == "True")
    }
}
