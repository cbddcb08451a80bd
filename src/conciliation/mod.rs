//! Declarative reconciliation: generate the required objects of a custom
//! resource, scan the deployed ones, diff them and apply the plan.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::shared::WorkloadStatus;
use crate::crd::{PgCluster, PgDistributedLogs, PgShardedCluster};
use crate::error::{Error, Result};
use crate::labels;
use crate::store::{kind_of, ObjectStore};

pub mod comparator;
pub mod engine;
pub mod handler;
pub mod merge;
pub mod registry;

pub use engine::{conciliate, ReconciliationPlan, PAUSE_ANNOTATION};
pub use handler::{HandlerDispatch, ReconciliationHandler};
pub use registry::{RegistryBuilder, ResourceDecorator, ResourceGenerator, ResourceRegistry};

// ── Collaborator seams ────────────────────────────────────────────────────────

/// Produces the full required set for one custom resource.
#[async_trait]
pub trait RequiredResourceGenerator<K>: Send + Sync {
    async fn required(&self, resource: &K) -> Result<Vec<DynamicObject>>;
}

/// Lists the live objects owned by one custom resource.
#[async_trait]
pub trait DeployedResourcesScanner<K>: Send + Sync {
    async fn deployed(&self, resource: &K) -> Result<Vec<DynamicObject>>;
}

/// Coarse predicates over a custom resource's observed state.
pub trait StatusOracle<K>: Send + Sync {
    fn is_pending_restart(&self, resource: &K) -> bool;
}

// ── Status oracle ─────────────────────────────────────────────────────────────

/// Custom resources carrying the shared workload status.
pub trait HasWorkloadStatus {
    fn workload_status(&self) -> Option<&WorkloadStatus>;
}

impl HasWorkloadStatus for PgCluster {
    fn workload_status(&self) -> Option<&WorkloadStatus> {
        self.status.as_ref()
    }
}

impl HasWorkloadStatus for PgDistributedLogs {
    fn workload_status(&self) -> Option<&WorkloadStatus> {
        self.status.as_ref()
    }
}

impl HasWorkloadStatus for PgShardedCluster {
    fn workload_status(&self) -> Option<&WorkloadStatus> {
        self.status.as_ref()
    }
}

/// Reads the `PendingRestart` condition written by the cluster agents.
pub struct ConditionStatusOracle;

impl<K: HasWorkloadStatus + Send + Sync> StatusOracle<K> for ConditionStatusOracle {
    fn is_pending_restart(&self, resource: &K) -> bool {
        resource
            .workload_status()
            .is_some_and(WorkloadStatus::is_pending_restart)
    }
}

// ── Deployed-state scanner ────────────────────────────────────────────────────

/// Lists every managed kind in the resource's namespace by ownership labels.
pub struct LabelScanner<K> {
    store: Arc<dyn ObjectStore>,
    kinds: Vec<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> LabelScanner<K> {
    pub fn new(store: Arc<dyn ObjectStore>, kinds: &[&str]) -> Self {
        Self {
            store,
            kinds: kinds.iter().map(|k| k.to_string()).collect(),
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K> DeployedResourcesScanner<K> for LabelScanner<K>
where
    K: Resource<DynamicType = ()> + Send + Sync,
{
    async fn deployed(&self, resource: &K) -> Result<Vec<DynamicObject>> {
        let namespace = resource.namespace().unwrap_or_default();
        let selector = labels::ownership_labels(resource);
        let mut deployed = Vec::new();
        for kind in &self.kinds {
            deployed.extend(self.store.list(kind, &namespace, &selector).await?);
        }
        Ok(deployed)
    }
}

// ── Conciliator ───────────────────────────────────────────────────────────────

/// Counts of what one reconcile cycle did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub created: usize,
    pub patched: usize,
    pub deleted: usize,
    /// Writes that lost an optimistic-concurrency race; retried next cycle.
    pub deferred: usize,
    /// The plan had neither patches nor deletions.
    pub up_to_date: bool,
}

/// Runs reconcile cycles for one custom resource kind.
pub struct Conciliator<K> {
    generator: Arc<dyn RequiredResourceGenerator<K>>,
    scanner: Arc<dyn DeployedResourcesScanner<K>>,
    oracle: Arc<dyn StatusOracle<K>>,
    store: Arc<dyn ObjectStore>,
    handlers: HandlerDispatch,
}

impl<K> Conciliator<K>
where
    K: Resource<DynamicType = ()> + Send + Sync,
{
    pub fn new(
        generator: Arc<dyn RequiredResourceGenerator<K>>,
        scanner: Arc<dyn DeployedResourcesScanner<K>>,
        oracle: Arc<dyn StatusOracle<K>>,
        store: Arc<dyn ObjectStore>,
        handlers: HandlerDispatch,
    ) -> Self {
        Self {
            generator,
            scanner,
            oracle,
            store,
            handlers,
        }
    }

    /// Compute the plan for `resource` without touching anything.
    pub async fn evaluate(&self, resource: &K) -> Result<ReconciliationPlan> {
        let required = self.generator.required(resource).await?;
        let deployed = self.scanner.deployed(resource).await?;
        let pending_restart = self.oracle.is_pending_restart(resource);
        let plan = conciliate(&required, &deployed, pending_restart);
        debug!(
            name = %resource.name_any(),
            required = required.len(),
            deployed = deployed.len(),
            pending_restart,
            creations = plan.creations.len(),
            patches = plan.patches.len(),
            deletions = plan.deletions.len(),
            "plan computed"
        );
        Ok(plan)
    }

    /// One full reconcile cycle.
    pub async fn reconcile(&self, resource: &K) -> Result<ReconcileOutcome> {
        let plan = self.evaluate(resource).await?;
        let outcome = self.apply(&plan).await?;
        info!(
            kind = %K::kind(&()),
            name = %resource.name_any(),
            namespace = %resource.namespace().unwrap_or_default(),
            created = outcome.created,
            patched = outcome.patched,
            deleted = outcome.deleted,
            deferred = outcome.deferred,
            up_to_date = outcome.up_to_date,
            "reconciled"
        );
        Ok(outcome)
    }

    /// Apply creations, then patches, then deletions. A lost concurrency
    /// race defers that one object; any other error aborts the cycle.
    pub async fn apply(&self, plan: &ReconciliationPlan) -> Result<ReconcileOutcome> {
        let store = self.store.as_ref();
        let mut outcome = ReconcileOutcome {
            up_to_date: plan.is_up_to_date(),
            ..Default::default()
        };

        for required in &plan.creations {
            let handler = self.handlers.for_kind(kind_of(required));
            if applied(handler.create(store, required).await, required, &mut outcome)? {
                outcome.created += 1;
            }
        }
        for (required, deployed) in &plan.patches {
            let handler = self.handlers.for_kind(kind_of(required));
            if applied(handler.patch(store, required, deployed).await, required, &mut outcome)? {
                outcome.patched += 1;
            }
        }
        for deployed in &plan.deletions {
            let handler = self.handlers.for_kind(kind_of(deployed));
            if applied(handler.delete(store, deployed).await, deployed, &mut outcome)? {
                outcome.deleted += 1;
            }
        }
        Ok(outcome)
    }
}

/// `Ok(true)` when the write went through, `Ok(false)` when it lost a
/// concurrency race and was deferred.
fn applied<T>(
    result: Result<T>,
    object: &DynamicObject,
    outcome: &mut ReconcileOutcome,
) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(Error::ConcurrentModification(key)) => {
            warn!(%key, kind = kind_of(object), "concurrent modification, retrying next cycle");
            outcome.deferred += 1;
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

// ── Registry-backed required generator ────────────────────────────────────────

/// Builds the context of one custom resource. This is where every I/O of
/// the generation stage happens: reference resolution and secret reuse.
#[async_trait]
pub trait ContextBuilder<K, C>: Send + Sync {
    async fn build(&self, resource: &K) -> Result<C>;
}

/// Required generator that assembles a context and runs a registry over it.
pub struct RegistryGenerator<K, C> {
    context: Arc<dyn ContextBuilder<K, C>>,
    registry: Arc<ResourceRegistry<C>>,
}

impl<K, C> RegistryGenerator<K, C> {
    pub fn new(context: Arc<dyn ContextBuilder<K, C>>, registry: Arc<ResourceRegistry<C>>) -> Self {
        Self { context, registry }
    }
}

#[async_trait]
impl<K, C> RequiredResourceGenerator<K> for RegistryGenerator<K, C>
where
    K: Send + Sync,
    C: Send + Sync,
{
    async fn required(&self, resource: &K) -> Result<Vec<DynamicObject>> {
        let context = self.context.build(resource).await?;
        self.registry.generate(&context)
    }
}
