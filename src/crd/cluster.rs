use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{
    NonProductionOptions, PersistentVolumeSpec, PostgresSpec, ResourcesSpec, WorkloadStatus,
};

// ── Spec sub-types ────────────────────────────────────────────────────────────

/// ReplicationMode selects how the primary waits on replicas.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationMode {
    #[default]
    Async,
    Sync,
    StrictSync,
}

impl ReplicationMode {
    pub fn is_synchronous(&self) -> bool {
        matches!(self, Self::Sync | Self::StrictSync)
    }
}

impl std::fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Async => "async",
            Self::Sync => "sync",
            Self::StrictSync => "strict-sync",
        };
        write!(f, "{s}")
    }
}

/// ReplicationRole says whether replicas may serve reads.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationRole {
    Ha,
    #[default]
    HaRead,
}

/// ReplicationSpec configures streaming replication between instances.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ReplicationMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ReplicationRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_instances: Option<i32>,
}

/// PodsSpec describes per-instance pod storage.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodsSpec {
    pub persistent_volume: PersistentVolumeSpec,
}

// ── CRD ───────────────────────────────────────────────────────────────────────

/// PgCluster is a highly available Postgres cluster of `instances` pods.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "pgstack.io",
    version = "v1",
    kind = "PgCluster",
    shortname = "pgc",
    namespaced,
    status = "WorkloadStatus",
    printcolumn = r#"{"name": "Instances", "type": "integer", "jsonPath": ".spec.instances"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.postgres.version"}"#,
    printcolumn = r#"{"name": "Profile", "type": "string", "jsonPath": ".spec.instanceProfile"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgClusterSpec {
    #[serde(default = "default_instances")]
    pub instances: i32,

    pub postgres: PostgresSpec,

    #[serde(default = "default_instance_profile")]
    pub instance_profile: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributed_logs: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationSpec>,

    pub pods: PodsSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_production_options: Option<NonProductionOptions>,
}

fn default_instances() -> i32 {
    1
}

pub fn default_instance_profile() -> String {
    "size-s".to_string()
}

impl PgCluster {
    pub fn replication_mode(&self) -> ReplicationMode {
        self.spec
            .replication
            .as_ref()
            .and_then(|r| r.mode)
            .unwrap_or_default()
    }
}
