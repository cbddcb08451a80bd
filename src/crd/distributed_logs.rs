use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{
    NonProductionOptions, PersistentVolumeSpec, PostgresSpec, ResourcesSpec, WorkloadStatus,
};

/// PgDistributedLogs is a single-purpose Postgres cluster that collects logs
/// shipped by the sidecars of other clusters.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "pgstack.io",
    version = "v1",
    kind = "PgDistributedLogs",
    shortname = "pgdl",
    namespaced,
    status = "WorkloadStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.persistentVolume.size"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgDistributedLogsSpec {
    pub persistent_volume: PersistentVolumeSpec,

    #[serde(default = "default_postgres")]
    pub postgres: PostgresSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_profile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_production_options: Option<NonProductionOptions>,
}

fn default_postgres() -> PostgresSpec {
    PostgresSpec {
        version: "16".to_string(),
        parameters: Default::default(),
    }
}
