//! Equality of a required object against its deployed counterpart, ignoring
//! what the API server owns.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use serde_json::Value;

use super::merge::COORDINATION_CONFIG_ANNOTATION;
use crate::labels::{ROLE_KEY, SCOPE_KEY};

/// Label prefix owned by the operator. Deployed labels under it that the
/// required object does not carry are stale.
const OWNED_LABEL_PREFIX: &str = "pgstack.io/";

/// Labels under the owned prefix that the coordination agent writes.
const AGENT_LABELS: &[&str] = &[SCOPE_KEY, ROLE_KEY];

fn is_operator_label(key: &str) -> bool {
    key.starts_with(OWNED_LABEL_PREFIX) && !AGENT_LABELS.contains(&key)
}

/// True when `deployed` already satisfies `required`.
pub fn is_up_to_date(required: &DynamicObject, deployed: &DynamicObject) -> bool {
    labels_match(
        required.metadata.labels.as_ref(),
        deployed.metadata.labels.as_ref(),
    ) && annotations_match(
        required.metadata.annotations.as_ref(),
        deployed.metadata.annotations.as_ref(),
    ) && payload_matches(&required.data, &deployed.data)
}

fn labels_match(
    required: Option<&BTreeMap<String, String>>,
    deployed: Option<&BTreeMap<String, String>>,
) -> bool {
    let empty = BTreeMap::new();
    let required = required.unwrap_or(&empty);
    let deployed = deployed.unwrap_or(&empty);
    required.iter().all(|(k, v)| deployed.get(k) == Some(v))
        && deployed
            .keys()
            .filter(|k| is_operator_label(k))
            .all(|k| required.contains_key(k))
}

fn annotations_match(
    required: Option<&BTreeMap<String, String>>,
    deployed: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(required) = required else {
        return true;
    };
    required.iter().all(|(k, v)| {
        let Some(found) = deployed.and_then(|d| d.get(k)) else {
            return false;
        };
        if k == COORDINATION_CONFIG_ANNOTATION {
            // The coordination agent rewrites this document with its own keys.
            match (
                serde_json::from_str::<Value>(v),
                serde_json::from_str::<Value>(found),
            ) {
                (Ok(req), Ok(dep)) => is_subset(&req, &dep),
                _ => v == found,
            }
        } else {
            v == found
        }
    })
}

fn payload_matches(required: &Value, deployed: &Value) -> bool {
    match (required, deployed) {
        (Value::Object(req), Value::Object(dep)) => req
            .iter()
            .filter(|(k, _)| k.as_str() != "status")
            .all(|(k, v)| field_matches(v, dep.get(k))),
        _ => is_subset(required, deployed),
    }
}

fn field_matches(required: &Value, deployed: Option<&Value>) -> bool {
    match deployed {
        Some(dep) => is_subset(required, dep),
        None => is_empty(required),
    }
}

/// Every value set in `required` is present and equal in `deployed`. Arrays
/// compare element-wise and must have the same length.
pub fn is_subset(required: &Value, deployed: &Value) -> bool {
    match (required, deployed) {
        (Value::Object(req), Value::Object(dep)) => {
            req.iter().all(|(k, v)| field_matches(v, dep.get(k)))
        }
        (Value::Array(req), Value::Array(dep)) => {
            req.len() == dep.len() && req.iter().zip(dep).all(|(r, d)| is_subset(r, d))
        }
        _ => required == deployed,
    }
}

/// Values the API server drops on write.
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
