//! Named lookups of related custom resources (profiles, clusters, log
//! clusters) used while assembling contexts and validating admissions.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Finds custom resources of kind `K` by namespace and name.
#[async_trait]
pub trait CustomResourceFinder<K>: Send + Sync
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    async fn find(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Every resource of the kind in `namespace`.
    async fn list(&self, namespace: &str) -> Result<Vec<K>>;

    /// Like `find` but an absent resource is a `ReferenceNotFound` error.
    async fn require(&self, namespace: &str, name: &str) -> Result<K> {
        self.find(namespace, name)
            .await?
            .ok_or_else(|| Error::reference_not_found(K::kind(&()), namespace, name))
    }
}

// ── Kubernetes implementation ─────────────────────────────────────────────────

/// Finder backed by the Kubernetes API.
pub struct KubeFinder<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeFinder<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K> CustomResourceFinder<K> for KubeFinder<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn find(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

// ── Static implementation ─────────────────────────────────────────────────────

/// Finder over a fixed set of resources. Used by tests and by callers that
/// already hold the referenced objects.
pub struct StaticFinder<K> {
    items: BTreeMap<(String, String), K>,
}

impl<K> Default for StaticFinder<K> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<K: Resource<DynamicType = ()>> StaticFinder<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, item: K) -> Self {
        let key = (item.namespace().unwrap_or_default(), item.name_any());
        self.items.insert(key, item);
        self
    }
}

#[async_trait]
impl<K> CustomResourceFinder<K> for StaticFinder<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn find(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self
            .items
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>> {
        Ok(self
            .items
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, item)| item.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::instance_profile::{PgInstanceProfile, PgInstanceProfileSpec};

    fn profile(ns: &str, name: &str) -> PgInstanceProfile {
        let mut p = PgInstanceProfile::new(
            name,
            PgInstanceProfileSpec {
                cpu: "1".to_string(),
                memory: "2Gi".to_string(),
                containers: Default::default(),
                init_containers: Default::default(),
            },
        );
        p.metadata.namespace = Some(ns.to_string());
        p
    }

    #[tokio::test]
    async fn test_static_finder_is_namespace_scoped() {
        let finder = StaticFinder::new().with(profile("db", "size-s"));
        assert!(finder.find("db", "size-s").await.unwrap().is_some());
        assert!(finder.find("other", "size-s").await.unwrap().is_none());
        assert_eq!(finder.list("db").await.unwrap().len(), 1);
        assert!(finder.list("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_require_reports_reference_not_found() {
        let finder: StaticFinder<PgInstanceProfile> = StaticFinder::new();
        let err = finder.require("db", "size-xl").await.unwrap_err();
        assert_eq!(err.to_string(), "PgInstanceProfile db/size-xl not found");
    }
}
