//! Three-way merge for objects that an external agent writes to at runtime.
//!
//! The coordination agent stores its live state in the annotations of the
//! config Endpoints (leader, failover history) and keeps a JSON document in the
//! `config` annotation that it extends with keys of its own. Updating such an
//! object starts from the live copy so none of that state is lost.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use serde_json::Value;

use crate::error::Result;

/// Annotation holding the serialized coordination document.
pub const COORDINATION_CONFIG_ANNOTATION: &str = "config";

/// Live-only keys survive; required keys win on conflicts.
pub fn merge_string_maps(
    live: Option<&BTreeMap<String, String>>,
    required: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut merged = live.cloned().unwrap_or_default();
    if let Some(required) = required {
        merged.extend(required.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// Recursively merge `required` into `live`. Nested objects merge key by key;
/// any other required value replaces the live one.
pub fn merge_json(live: &mut Value, required: &Value) {
    match (live, required) {
        (Value::Object(live), Value::Object(required)) => {
            for (key, value) in required {
                let nested = value.is_object() && live.get(key).is_some_and(Value::is_object);
                if !nested {
                    live.insert(key.clone(), value.clone());
                } else if let Some(existing) = live.get_mut(key) {
                    merge_json(existing, value);
                }
            }
        }
        (live, required) => *live = required.clone(),
    }
}

/// Merge annotations, deep-merging the coordination document when both sides
/// carry it.
pub fn merge_annotations(
    live: Option<&BTreeMap<String, String>>,
    required: Option<&BTreeMap<String, String>>,
) -> Result<BTreeMap<String, String>> {
    let mut merged = merge_string_maps(live, required);
    let live_doc = live.and_then(|a| a.get(COORDINATION_CONFIG_ANNOTATION));
    let required_doc = required.and_then(|a| a.get(COORDINATION_CONFIG_ANNOTATION));
    if let (Some(live_doc), Some(required_doc)) = (live_doc, required_doc) {
        let mut doc: Value = serde_json::from_str(live_doc)?;
        merge_json(&mut doc, &serde_json::from_str(required_doc)?);
        merged.insert(
            COORDINATION_CONFIG_ANNOTATION.to_string(),
            serde_json::to_string(&doc)?,
        );
    }
    Ok(merged)
}

/// Build the object to write back: the live object with required labels,
/// annotations and top-level payload fields applied. The live
/// `resourceVersion` is kept so the write is conditional on it.
pub fn three_way_merge(live: &DynamicObject, required: &DynamicObject) -> Result<DynamicObject> {
    let mut merged = live.clone();
    merged.metadata.labels = Some(merge_string_maps(
        live.metadata.labels.as_ref(),
        required.metadata.labels.as_ref(),
    ));
    merged.metadata.annotations = Some(merge_annotations(
        live.metadata.annotations.as_ref(),
        required.metadata.annotations.as_ref(),
    )?);
    if let (Some(payload), Value::Object(fields)) = (merged.data.as_object_mut(), &required.data) {
        for (key, value) in fields {
            payload.insert(key.clone(), value.clone());
        }
    }
    Ok(merged)
}
