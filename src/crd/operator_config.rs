use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PgOperatorConfig holds operator-wide settings. It configures the operator
/// itself and therefore never gets admission or conversion webhooks.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "pgstack.io",
    version = "v1",
    kind = "PgOperatorConfig",
    shortname = "pgconfig",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PgOperatorConfigSpec {
    /// Namespaces the operator is allowed to manage; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_namespaces: Vec<String>,

    /// Container image used for the Postgres pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_image: Option<String>,
}
