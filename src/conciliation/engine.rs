//! The diff engine: required objects plus deployed objects in, plan out.

use std::collections::{BTreeMap, BTreeSet};

use kube::api::DynamicObject;

use super::comparator;
use crate::store::ObjectKey;

/// Annotation suspending divergence handling of a deployed object while its
/// owner is pending a restart.
pub const PAUSE_ANNOTATION: &str = "pgstack.io/reconciliation-pause-until-restart";

/// Changes needed to bring the deployed objects in line with the required
/// ones.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconciliationPlan {
    /// Required objects with no deployed counterpart, in required order.
    pub creations: Vec<DynamicObject>,
    /// `(required, deployed)` pairs that differ, in required order.
    pub patches: Vec<(DynamicObject, DynamicObject)>,
    /// Deployed objects no longer required, in deployed order.
    pub deletions: Vec<DynamicObject>,
}

impl ReconciliationPlan {
    /// Creations do not count: a missing object is not a divergence.
    pub fn is_up_to_date(&self) -> bool {
        self.patches.is_empty() && self.deletions.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.creations.is_empty() && self.is_up_to_date()
    }
}

/// True when the object carries the pause marker.
pub fn is_paused(object: &DynamicObject) -> bool {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(PAUSE_ANNOTATION))
        .is_some_and(|v| v == "true")
}

/// Compute the plan turning `deployed` into `required`.
///
/// Creations are never held back. When `pending_restart` is set, paused
/// objects are left out of patches and deletions.
pub fn conciliate(
    required: &[DynamicObject],
    deployed: &[DynamicObject],
    pending_restart: bool,
) -> ReconciliationPlan {
    let deployed_by_key: BTreeMap<ObjectKey, &DynamicObject> =
        deployed.iter().map(|d| (ObjectKey::of(d), d)).collect();
    let required_keys: BTreeSet<ObjectKey> = required.iter().map(ObjectKey::of).collect();
    let held = |object: &DynamicObject| pending_restart && is_paused(object);

    let mut plan = ReconciliationPlan::default();
    for req in required {
        match deployed_by_key.get(&ObjectKey::of(req)) {
            None => plan.creations.push(req.clone()),
            Some(dep) if !comparator::is_up_to_date(req, dep) && !held(dep) => {
                plan.patches.push((req.clone(), (*dep).clone()));
            }
            Some(_) => {}
        }
    }
    plan.deletions = deployed
        .iter()
        .filter(|d| !required_keys.contains(&ObjectKey::of(d)))
        .filter(|d| !held(d))
        .cloned()
        .collect();
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_map(name: &str, value: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "db"},
            "data": {"value": value},
        }))
        .unwrap()
    }

    #[test]
    fn test_identity_join() {
        let required = vec![config_map("a", "1"), config_map("b", "2")];
        let deployed = vec![config_map("b", "changed"), config_map("c", "3")];
        let plan = conciliate(&required, &deployed, false);

        assert_eq!(plan.creations, vec![config_map("a", "1")]);
        assert_eq!(plan.patches.len(), 1);
        assert_eq!(plan.patches[0].0, config_map("b", "2"));
        assert_eq!(plan.patches[0].1, config_map("b", "changed"));
        assert_eq!(plan.deletions, vec![config_map("c", "3")]);
        assert!(!plan.is_up_to_date());
    }

    #[test]
    fn test_creations_alone_leave_plan_up_to_date() {
        let plan = conciliate(&[config_map("a", "1")], &[], true);
        assert_eq!(plan.creations.len(), 1);
        assert!(plan.is_up_to_date());
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_pause_marker_requires_true() {
        let mut obj = config_map("a", "1");
        assert!(!is_paused(&obj));
        obj.metadata.annotations = Some(
            [(PAUSE_ANNOTATION.to_string(), "false".to_string())].into(),
        );
        assert!(!is_paused(&obj));
        obj.metadata.annotations = Some(
            [(PAUSE_ANNOTATION.to_string(), "true".to_string())].into(),
        );
        assert!(is_paused(&obj));
    }

    #[test]
    fn test_paused_orphan_waits_for_restart() {
        let required: Vec<DynamicObject> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|n| config_map(n, "1"))
            .collect();
        let mut deployed = required.clone();
        let mut orphan = config_map("gone", "1");
        orphan.metadata.annotations = Some(
            [(PAUSE_ANNOTATION.to_string(), "true".to_string())].into(),
        );
        deployed.push(orphan.clone());

        let held = conciliate(&required, &deployed, true);
        assert!(held.deletions.is_empty());
        assert!(held.is_up_to_date());
        assert!(held.is_empty());

        let released = conciliate(&required, &deployed, false);
        assert_eq!(released.deletions, vec![orphan]);
        assert!(released.patches.is_empty());
        assert!(!released.is_up_to_date());
    }
}
