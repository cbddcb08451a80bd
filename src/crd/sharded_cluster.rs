use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::{PersistentVolumeSpec, PostgresSpec, WorkloadStatus};

/// Script ids `0..=LAST_RESERVED_SCRIPT_ID` belong to the operator.
pub const LAST_RESERVED_SCRIPT_ID: i32 = 10;

/// CoordinatorSpec sizes the coordinator cluster of a sharded cluster.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorSpec {
    #[serde(default = "default_instances")]
    pub instances: i32,
    #[serde(default = "super::cluster::default_instance_profile")]
    pub instance_profile: String,
    pub persistent_volume: PersistentVolumeSpec,
}

/// ManagedSqlScript is one SQL script applied to every shard.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedSqlScript {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i32>,
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedSqlSpec {
    #[serde(default)]
    pub scripts: Vec<ManagedSqlScript>,
}

/// ShardsSpec sizes the shard clusters.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardsSpec {
    pub clusters: i32,
    #[serde(default = "default_instances")]
    pub instances_per_cluster: i32,
    #[serde(default = "super::cluster::default_instance_profile")]
    pub instance_profile: String,
    pub persistent_volume: PersistentVolumeSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_sql: Option<ManagedSqlSpec>,
}

/// PgShardedCluster is a coordinator cluster plus `shards.clusters` shard clusters.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "pgstack.io",
    version = "v1",
    kind = "PgShardedCluster",
    shortname = "pgsc",
    namespaced,
    status = "WorkloadStatus",
    printcolumn = r#"{"name": "Shards", "type": "integer", "jsonPath": ".spec.shards.clusters"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.postgres.version"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgShardedClusterSpec {
    pub postgres: PostgresSpec,
    pub coordinator: CoordinatorSpec,
    pub shards: ShardsSpec,
}

fn default_instances() -> i32 {
    1
}

/// Name of the coordinator PgCluster owned by a sharded cluster.
pub fn coordinator_cluster_name(sharded_cluster: &str) -> String {
    format!("{sharded_cluster}-coord")
}

/// Name of the `index`-th shard PgCluster owned by a sharded cluster.
pub fn shard_cluster_name(sharded_cluster: &str, index: i32) -> String {
    format!("{sharded_cluster}-shard{index}")
}
