//! Ownership and selector labels stamped on every managed object.

use std::collections::BTreeMap;

use kube::{Resource, ResourceExt};

pub const MANAGED_BY_KEY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "pgstack-operator";
pub const OWNER_KIND_KEY: &str = "pgstack.io/owner-kind";
pub const OWNER_NAME_KEY: &str = "pgstack.io/owner-name";
/// Set on pods by the coordination agent: `primary` or `replica`.
pub const ROLE_KEY: &str = "pgstack.io/role";
/// Identifies the members of one coordination scope. The agent labels the
/// objects it creates with this key only, which keeps them out of the
/// ownership selector.
pub const SCOPE_KEY: &str = "pgstack.io/cluster-scope";

/// Labels identifying every object owned by `owner`. Used both when
/// generating objects and as the selector when scanning deployed ones.
pub fn ownership_labels<K: Resource<DynamicType = ()>>(owner: &K) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_KEY.to_string(), MANAGED_BY_VALUE.to_string()),
        (
            OWNER_KIND_KEY.to_string(),
            K::kind(&()).to_ascii_lowercase(),
        ),
        (OWNER_NAME_KEY.to_string(), owner.name_any()),
    ])
}

/// Labels the coordination agent stamps on everything it creates.
pub fn scope_labels(scope: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(SCOPE_KEY.to_string(), scope.to_string())])
}

/// Labels of the pods of one scope: ownership plus scope.
pub fn pod_labels<K: Resource<DynamicType = ()>>(owner: &K) -> BTreeMap<String, String> {
    let mut labels = ownership_labels(owner);
    labels.extend(scope_labels(&owner.name_any()));
    labels
}

/// Selector for the pods holding `role` within a scope.
pub fn role_selector(scope: &str, role: &str) -> BTreeMap<String, String> {
    let mut labels = scope_labels(scope);
    labels.insert(ROLE_KEY.to_string(), role.to_string());
    labels
}

/// Render labels as a `k=v,k=v` selector string.
pub fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// True when `labels` carries every key/value of `selector_labels`.
pub fn matches(
    labels: Option<&BTreeMap<String, String>>,
    selector_labels: &BTreeMap<String, String>,
) -> bool {
    let Some(labels) = labels else {
        return selector_labels.is_empty();
    };
    selector_labels
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|found| found == v))
}
