//! `Failed` condition bookkeeping on instance status.

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Map};
use tracing::debug;

use crate::conciliation::HasWorkloadStatus;
use crate::crd::shared::CONDITION_FAILED;
use crate::error::{Error, Result};
use crate::helpers::FIELD_MANAGER;
use crate::version::OperatorVersion;

pub fn failed_condition(error: &Error, generation: Option<i64>) -> Condition {
    Condition {
        type_: CONDITION_FAILED.to_string(),
        status: "True".to_string(),
        reason: error.reason().to_string(),
        message: error.to_string(),
        observed_generation: generation,
        last_transition_time: Time(chrono::Utc::now()),
    }
}

/// Conditions after a cycle that failed with `failed` (or succeeded when
/// `None`). Returns `None` when the current conditions already say so.
pub fn updated_conditions(current: &[Condition], failed: Option<Condition>) -> Option<Vec<Condition>> {
    let existing = current.iter().find(|c| c.type_ == CONDITION_FAILED);
    match (&failed, existing) {
        (None, None) => return None,
        (Some(new), Some(old))
            if old.status == new.status && old.reason == new.reason && old.message == new.message =>
        {
            return None
        }
        _ => {}
    }
    let mut conditions: Vec<Condition> = current
        .iter()
        .filter(|c| c.type_ != CONDITION_FAILED)
        .cloned()
        .collect();
    conditions.extend(failed);
    Some(conditions)
}

/// Write the outcome of a cycle to the resource status. Successful cycles
/// also record the operator version that reconciled the resource.
pub async fn report<K>(
    client: &Client,
    resource: &K,
    version: OperatorVersion,
    failure: Option<&Error>,
) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + HasWorkloadStatus
        + Clone
        + DeserializeOwned
        + Debug,
{
    let status = resource.workload_status();
    let current = status.map(|s| s.conditions.as_slice()).unwrap_or_default();
    let conditions = updated_conditions(
        current,
        failure.map(|e| failed_condition(e, resource.meta().generation)),
    );
    let version = version.to_string();
    let version_changed = failure.is_none()
        && status.and_then(|s| s.operator_version.as_deref()) != Some(version.as_str());

    let mut patch = Map::new();
    if let Some(conditions) = conditions {
        patch.insert("conditions".to_string(), json!(conditions));
    }
    if version_changed {
        patch.insert("operatorVersion".to_string(), json!(version));
    }
    if patch.is_empty() {
        return Ok(());
    }

    let name = resource.name_any();
    let api: Api<K> = Api::namespaced(client.clone(), &resource.namespace().unwrap_or_default());
    debug!(%name, failed = failure.is_some(), "patching status");
    api.patch_status(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&json!({ "status": patch })),
    )
    .await?;
    Ok(())
}
