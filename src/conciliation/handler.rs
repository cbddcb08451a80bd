//! Per-kind strategies for applying a plan to the object store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use tracing::debug;

use super::merge;
use crate::error::{Error, Result};
use crate::store::{ObjectKey, ObjectStore};

/// One method per verb. The provided methods are the default strategy; a
/// kind-specific handler overrides only the verbs it needs.
#[async_trait]
pub trait ReconciliationHandler: Send + Sync {
    async fn create(&self, store: &dyn ObjectStore, required: &DynamicObject) -> Result<DynamicObject> {
        store.create(required).await
    }

    /// Bring `deployed` in line with `required`. The write is conditional on
    /// the deployed version.
    async fn patch(
        &self,
        store: &dyn ObjectStore,
        required: &DynamicObject,
        deployed: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut object = required.clone();
        object.metadata.resource_version = deployed.metadata.resource_version.clone();
        store.patch(&object).await
    }

    async fn replace(&self, store: &dyn ObjectStore, object: &DynamicObject) -> Result<DynamicObject> {
        store.replace(object).await
    }

    async fn delete(&self, store: &dyn ObjectStore, deployed: &DynamicObject) -> Result<()> {
        store.delete(&ObjectKey::of(deployed)).await
    }
}

/// Direct create, version-guarded apply and direct delete.
pub struct DefaultHandler;

impl ReconciliationHandler for DefaultHandler {}

/// Handler for objects the coordination agent writes to: updates are a
/// three-way merge onto the live object followed by a version-guarded
/// replace.
pub struct CoordinationConfigHandler;

#[async_trait]
impl ReconciliationHandler for CoordinationConfigHandler {
    async fn patch(
        &self,
        store: &dyn ObjectStore,
        required: &DynamicObject,
        _deployed: &DynamicObject,
    ) -> Result<DynamicObject> {
        let key = ObjectKey::of(required);
        let live = store
            .get(&key)
            .await?
            .ok_or_else(|| Error::ResourceMissing(key.to_string()))?;
        let merged = merge::three_way_merge(&live, required)?;
        debug!(%key, version = ?merged.metadata.resource_version, "replacing merged object");
        self.replace(store, &merged).await
    }
}

/// Handler table keyed by object kind.
pub struct HandlerDispatch {
    default: Arc<dyn ReconciliationHandler>,
    by_kind: BTreeMap<String, Arc<dyn ReconciliationHandler>>,
}

impl Default for HandlerDispatch {
    fn default() -> Self {
        Self {
            default: Arc::new(DefaultHandler),
            by_kind: BTreeMap::new(),
        }
    }
}

impl HandlerDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table used by every workload controller: Endpoints carry the
    /// coordination document and go through the merging handler.
    pub fn standard() -> Self {
        Self::new().with("Endpoints", CoordinationConfigHandler)
    }

    pub fn with(mut self, kind: &str, handler: impl ReconciliationHandler + 'static) -> Self {
        self.by_kind.insert(kind.to_string(), Arc::new(handler));
        self
    }

    pub fn for_kind(&self, kind: &str) -> &dyn ReconciliationHandler {
        self.by_kind
            .get(kind)
            .unwrap_or(&self.default)
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryObjectStore;
    use serde_json::json;

    fn endpoints(annotations: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": {"name": "pg-config", "namespace": "db", "annotations": annotations},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_default_patch_uses_deployed_version() {
        let store = InMemoryObjectStore::new();
        let deployed = store.put(endpoints(json!({"a": "1"})));
        store.put(endpoints(json!({"a": "external"})));

        let err = DefaultHandler
            .patch(&store, &endpoints(json!({"a": "2"})), &deployed)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_coordination_patch_of_missing_object_is_hard_failure() {
        let store = InMemoryObjectStore::new();
        let required = endpoints(json!({}));
        let err = CoordinationConfigHandler
            .patch(&store, &required, &required)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceMissing(_)));
        assert_eq!(err.reason(), "ResourceMissingUnexpectedly");
    }

    #[test]
    fn test_dispatch_falls_back_to_default() {
        let dispatch = HandlerDispatch::standard();
        let endpoints = dispatch.for_kind("Endpoints") as *const dyn ReconciliationHandler;
        let service = dispatch.for_kind("Service") as *const dyn ReconciliationHandler;
        let secret = dispatch.for_kind("Secret") as *const dyn ReconciliationHandler;
        assert!(!std::ptr::addr_eq(endpoints, service));
        assert!(std::ptr::addr_eq(service, secret));
    }
}
