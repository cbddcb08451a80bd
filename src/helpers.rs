use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Field manager name used for server-side apply patches.
pub const FIELD_MANAGER: &str = "pgstack-operator";

/// Annotation carrying the operator version that produced an object.
pub const VERSION_ANNOTATION: &str = "pgstack.io/operator-version";

/// Annotation carrying a checksum of a ConfigMap's data.
pub const CHECKSUM_ANNOTATION: &str = "pgstack.io/checksum";

// ── Owner references ──────────────────────────────────────────────────────────

/// Build a controller OwnerReference for any kube-rs `Resource` whose
/// metadata is known at compile time.
pub fn controller_owner_ref<K: Resource<DynamicType = ()>>(obj: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.name_any(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

// ── Dynamic object conversion ─────────────────────────────────────────────────

/// Erase a typed object into the opaque (kind, metadata, payload) form the
/// reconciliation engine works on.
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Parse a dynamic object back into its typed form.
pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

// ── Naming helpers ────────────────────────────────────────────────────────────

/// Kubernetes object names are capped at 63 characters for labels/services.
pub fn resource_name(name: &str) -> String {
    if name.len() <= 63 {
        return name.to_string();
    }
    let digest = &sha256_hex(name)[..8];
    format!("{}-{digest}", &name[..54])
}

/// Service exposing the leader via the coordination layer.
pub fn primary_service_name(cluster: &str) -> String {
    resource_name(cluster)
}

/// Alias service kept for clients that address the primary as `-primary`.
pub fn read_write_service_name(cluster: &str) -> String {
    resource_name(&format!("{cluster}-primary"))
}

pub fn read_only_service_name(cluster: &str) -> String {
    resource_name(&format!("{cluster}-replicas"))
}

/// Endpoints object the coordination agent stores its dynamic config on.
pub fn config_endpoints_name(cluster: &str) -> String {
    resource_name(&format!("{cluster}-config"))
}

pub fn credentials_secret_name(cluster: &str) -> String {
    resource_name(cluster)
}

pub fn patroni_env_name(cluster: &str) -> String {
    resource_name(&format!("{cluster}-patroni-env"))
}

/// ConfigMap and Service of the log collector of a distributed logs cluster.
pub fn fluentd_name(distributed_logs: &str) -> String {
    resource_name(&format!("{distributed_logs}-fluentd"))
}

// ── Crypto helpers ────────────────────────────────────────────────────────────

/// Generate a cryptographically random 48-hex-char password.
pub fn generate_password() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 hash of a string, returned as hex.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable checksum of a string map; BTreeMap iteration order makes it
/// independent of insertion order.
pub fn data_checksum(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in data {
        hasher.update(k.as_bytes());
        hasher.update([0u8]);
        hasher.update(v.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}
