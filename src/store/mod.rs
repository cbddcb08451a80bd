//! Typed CRUD over arbitrary managed object kinds.
//!
//! The reconciliation engine only ever sees `DynamicObject`s: identity
//! (kind, namespace, name), metadata and an opaque payload.  Every write that
//! modifies an existing object is conditional on its `resourceVersion`.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret, Service};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::Client;
use tracing::debug;

use crate::crd::PgCluster;
use crate::error::{Error, Result};
use crate::helpers::FIELD_MANAGER;
use crate::labels;

mod memory;

pub use memory::InMemoryObjectStore;

// ── Identity ──────────────────────────────────────────────────────────────────

/// Identity of a managed object. Never changes across a reconcile cycle.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn of(obj: &DynamicObject) -> Self {
        Self {
            kind: kind_of(obj).to_string(),
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Kind of a dynamic object, empty when the type metadata is missing.
pub fn kind_of(obj: &DynamicObject) -> &str {
    obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("")
}

// ── Store trait ───────────────────────────────────────────────────────────────

/// Object store abstraction so tests can substitute an in-memory store.
///
/// Error mapping shared by every implementation:
/// - a lost optimistic-concurrency race is `Error::ConcurrentModification`
/// - `patch`, `replace` and `delete` of an absent object is `Error::ResourceMissing`
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// Objects of `kind` in `namespace` carrying every label of `selector`.
    async fn list(
        &self,
        kind: &str,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Server-side apply. Conditional when `obj` carries a resourceVersion.
    async fn patch(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Full replacement conditional on `obj`'s resourceVersion.
    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

// ── Kubernetes implementation ─────────────────────────────────────────────────

/// Production implementation backed by the Kubernetes API.
pub struct KubeObjectStore {
    client: Client,
    resources: BTreeMap<String, ApiResource>,
}

impl KubeObjectStore {
    /// Store able to handle every kind the generators produce.
    pub fn new(client: Client) -> Self {
        let resources = [
            ApiResource::erase::<StatefulSet>(&()),
            ApiResource::erase::<Service>(&()),
            ApiResource::erase::<ConfigMap>(&()),
            ApiResource::erase::<Endpoints>(&()),
            ApiResource::erase::<Secret>(&()),
            ApiResource::erase::<PgCluster>(&()),
        ]
        .into_iter()
        .map(|ar| (ar.kind.clone(), ar))
        .collect();
        Self { client, resources }
    }

    /// Kinds this store can list, in a stable order.
    pub fn kinds(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }

    fn api(&self, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let ar = self
            .resources
            .get(kind)
            .ok_or_else(|| Error::config(format!("unmanaged object kind {kind:?}")))?;
        Ok(match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        })
    }
}

/// Translate API status codes into the reconciliation error taxonomy.
fn map_write_error(err: kube::Error, key: &ObjectKey) -> Error {
    match &err {
        kube::Error::Api(e) if e.code == 409 => Error::ConcurrentModification(key.to_string()),
        kube::Error::Api(e) if e.code == 404 => Error::ResourceMissing(key.to_string()),
        _ => Error::Kube(err),
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let api = self.api(&key.kind, key.namespace.as_deref())?;
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list(
        &self,
        kind: &str,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.api(kind, Some(namespace))?;
        let params = ListParams::default().labels(&labels::selector(selector));
        let ar = &self.resources[kind];
        let items = api
            .list(&params)
            .await?
            .items
            .into_iter()
            .map(|mut obj| {
                // List items come back without type metadata.
                if obj.types.is_none() {
                    obj.types = Some(kube::api::TypeMeta {
                        api_version: ar.api_version.clone(),
                        kind: ar.kind.clone(),
                    });
                }
                obj
            })
            .collect();
        Ok(items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        debug!(%key, "creating object");
        let api = self.api(&key.kind, key.namespace.as_deref())?;
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(e, &key))
    }

    async fn patch(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        debug!(%key, "patching object");
        let api = self.api(&key.kind, key.namespace.as_deref())?;
        // Server-side apply creates missing objects, so existence is checked first.
        if api
            .get_metadata_opt(&key.name)
            .await
            .map_err(|e| map_write_error(e, &key))?
            .is_none()
        {
            return Err(Error::ResourceMissing(key.to_string()));
        }
        api.patch(
            &key.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await
        .map_err(|e| map_write_error(e, &key))
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj);
        debug!(%key, version = ?obj.metadata.resource_version, "replacing object");
        let api = self.api(&key.kind, key.namespace.as_deref())?;
        api.replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(e, &key))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        debug!(%key, "deleting object");
        let api = self.api(&key.kind, key.namespace.as_deref())?;
        api.delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| map_write_error(e, key))?;
        Ok(())
    }
}
