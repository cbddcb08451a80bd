use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ContainerProfile sizes one sidecar or init container.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerProfile {
    pub cpu: String,
    pub memory: String,
}

/// PgInstanceProfile is a named size (cpu/memory) applied to every instance
/// pod of the clusters that reference it.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "pgstack.io",
    version = "v1",
    kind = "PgInstanceProfile",
    shortname = "pgprofile",
    namespaced,
    printcolumn = r#"{"name": "CPU", "type": "string", "jsonPath": ".spec.cpu"}"#,
    printcolumn = r#"{"name": "Memory", "type": "string", "jsonPath": ".spec.memory"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgInstanceProfileSpec {
    /// Sizing of the main Postgres container.
    pub cpu: String,
    pub memory: String,

    /// Sizing of the other containers, keyed by container name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub containers: BTreeMap<String, ContainerProfile>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub init_containers: BTreeMap<String, ContainerProfile>,
}
