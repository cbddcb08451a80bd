//! Required state of a `PgShardedCluster`: one coordinator `PgCluster`, the
//! shard `PgCluster`s and the entry service in front of the coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DynamicObject, ObjectMeta};
use kube::ResourceExt;

use super::decorators::VersionAnnotationDecorator;
use super::patroni::POSTGRES_PORT;
use crate::conciliation::{ContextBuilder, RegistryBuilder, ResourceGenerator, ResourceRegistry};
use crate::crd::cluster::{PgClusterSpec, PodsSpec};
use crate::crd::shared::{PersistentVolumeSpec, PostgresSpec};
use crate::crd::sharded_cluster::{coordinator_cluster_name, shard_cluster_name};
use crate::crd::{PgCluster, PgInstanceProfile, PgShardedCluster};
use crate::error::Result;
use crate::helpers::{controller_owner_ref, resource_name, to_dynamic};
use crate::labels;
use crate::resolver::CustomResourceFinder;
use crate::version::{OperatorVersion, VersionRange};

pub const MANAGED_KINDS: &[&str] = &["PgCluster", "Service"];

#[derive(Clone, Debug)]
pub struct ShardedClusterContext {
    pub sharded_cluster: PgShardedCluster,
    pub coordinator_profile: PgInstanceProfile,
    pub shards_profile: PgInstanceProfile,
    /// Child clusters that already exist, by name.
    pub clusters: BTreeMap<String, PgCluster>,
}

impl ShardedClusterContext {
    fn metadata(&self, name: String) -> ObjectMeta {
        let sharded = &self.sharded_cluster;
        ObjectMeta {
            name: Some(name),
            namespace: sharded.namespace(),
            labels: Some(labels::ownership_labels(sharded)),
            owner_references: Some(vec![controller_owner_ref(sharded)]),
            ..Default::default()
        }
    }

    /// Postgres settings of a child cluster. A child that already exists
    /// keeps its version: version changes go through a major upgrade, not
    /// through the parent.
    fn postgres(&self, cluster: &str, parameters: BTreeMap<String, String>) -> PostgresSpec {
        let version = self
            .clusters
            .get(cluster)
            .map(|c| c.spec.postgres.version.clone())
            .unwrap_or_else(|| self.sharded_cluster.spec.postgres.version.clone());
        let mut merged = self.sharded_cluster.spec.postgres.parameters.clone();
        merged.extend(parameters);
        PostgresSpec {
            version,
            parameters: merged,
        }
    }

    fn child_cluster(
        &self,
        name: String,
        instances: i32,
        profile: &str,
        volume: &PersistentVolumeSpec,
        parameters: BTreeMap<String, String>,
    ) -> Result<DynamicObject> {
        let mut cluster = PgCluster::new(
            &name,
            PgClusterSpec {
                instances,
                postgres: self.postgres(&name, parameters),
                instance_profile: profile.to_string(),
                distributed_logs: None,
                replication: None,
                pods: PodsSpec {
                    persistent_volume: volume.clone(),
                },
                resources: None,
                non_production_options: None,
            },
        );
        cluster.metadata = self.metadata(name);
        to_dynamic(&cluster)
    }
}

fn sharding_parameters() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "shared_preload_libraries".to_string(),
        "citus".to_string(),
    )])
}

// ── Context assembly ──────────────────────────────────────────────────────────

/// Resolves sharded cluster → child clusters → instance profiles. Child
/// clusters are optional; the profiles they will use are required.
pub struct ShardedClusterContextBuilder {
    clusters: Arc<dyn CustomResourceFinder<PgCluster>>,
    profiles: Arc<dyn CustomResourceFinder<PgInstanceProfile>>,
}

impl ShardedClusterContextBuilder {
    pub fn new(
        clusters: Arc<dyn CustomResourceFinder<PgCluster>>,
        profiles: Arc<dyn CustomResourceFinder<PgInstanceProfile>>,
    ) -> Self {
        Self { clusters, profiles }
    }
}

#[async_trait]
impl ContextBuilder<PgShardedCluster, ShardedClusterContext> for ShardedClusterContextBuilder {
    async fn build(&self, sharded: &PgShardedCluster) -> Result<ShardedClusterContext> {
        let namespace = sharded.namespace().unwrap_or_default();
        let name = sharded.name_any();

        let mut names = vec![coordinator_cluster_name(&name)];
        names.extend((0..sharded.spec.shards.clusters).map(|i| shard_cluster_name(&name, i)));
        let mut clusters = BTreeMap::new();
        for cluster_name in names {
            if let Some(cluster) = self.clusters.find(&namespace, &cluster_name).await? {
                clusters.insert(cluster_name, cluster);
            }
        }

        // Resolved through the live coordinator when it exists: that is the
        // profile its pods currently run with.
        let coordinator_profile_name = clusters
            .get(&coordinator_cluster_name(&name))
            .map(|c| c.spec.instance_profile.clone())
            .unwrap_or_else(|| sharded.spec.coordinator.instance_profile.clone());
        let coordinator_profile = self
            .profiles
            .require(&namespace, &coordinator_profile_name)
            .await?;
        let shards_profile = self
            .profiles
            .require(&namespace, &sharded.spec.shards.instance_profile)
            .await?;

        Ok(ShardedClusterContext {
            sharded_cluster: sharded.clone(),
            coordinator_profile,
            shards_profile,
            clusters,
        })
    }
}

// ── Generators ────────────────────────────────────────────────────────────────

struct CoordinatorGenerator;

impl ResourceGenerator<ShardedClusterContext> for CoordinatorGenerator {
    fn generate(&self, ctx: &ShardedClusterContext) -> Result<Vec<DynamicObject>> {
        let spec = &ctx.sharded_cluster.spec.coordinator;
        Ok(vec![ctx.child_cluster(
            coordinator_cluster_name(&ctx.sharded_cluster.name_any()),
            spec.instances,
            &ctx.sharded_cluster.spec.coordinator.instance_profile,
            &spec.persistent_volume,
            sharding_parameters(),
        )?])
    }
}

struct ShardsGenerator;

impl ResourceGenerator<ShardedClusterContext> for ShardsGenerator {
    fn generate(&self, ctx: &ShardedClusterContext) -> Result<Vec<DynamicObject>> {
        let name = ctx.sharded_cluster.name_any();
        let spec = &ctx.sharded_cluster.spec.shards;
        (0..spec.clusters)
            .map(|index| {
                ctx.child_cluster(
                    shard_cluster_name(&name, index),
                    spec.instances_per_cluster,
                    &spec.instance_profile,
                    &spec.persistent_volume,
                    sharding_parameters(),
                )
            })
            .collect()
    }
}

/// Service named after the sharded cluster, routed to the coordinator leader.
struct CoordinatorEntryGenerator;

impl ResourceGenerator<ShardedClusterContext> for CoordinatorEntryGenerator {
    fn generate(&self, ctx: &ShardedClusterContext) -> Result<Vec<DynamicObject>> {
        let name = ctx.sharded_cluster.name_any();
        let service = Service {
            metadata: ctx.metadata(resource_name(&name)),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(labels::role_selector(
                    &coordinator_cluster_name(&name),
                    "primary",
                )),
                ports: Some(vec![ServicePort {
                    name: Some("pgport".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: POSTGRES_PORT,
                    target_port: Some(IntOrString::String("pgport".to_string())),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        Ok(vec![to_dynamic(&service)?])
    }
}

pub fn registry(version: OperatorVersion) -> Result<ResourceRegistry<ShardedClusterContext>> {
    RegistryBuilder::new()
        .generator("coordinator", VersionRange::all(), CoordinatorGenerator)
        .generator("shards", VersionRange::all(), ShardsGenerator)
        .generator(
            "coordinator-entry",
            VersionRange::all(),
            CoordinatorEntryGenerator,
        )
        .decorator(
            "operator-version",
            VersionRange::all(),
            VersionAnnotationDecorator::new(version),
        )
        .build(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::instance_profile::PgInstanceProfileSpec;
    use crate::crd::sharded_cluster::{CoordinatorSpec, PgShardedClusterSpec, ShardsSpec};
    use crate::error::Error;
    use crate::resolver::StaticFinder;
    use crate::store::kind_of;

    fn volume() -> PersistentVolumeSpec {
        PersistentVolumeSpec {
            size: "10Gi".to_string(),
            storage_class: None,
        }
    }

    fn sharded(version: &str) -> PgShardedCluster {
        let mut sharded = PgShardedCluster::new(
            "sc",
            PgShardedClusterSpec {
                postgres: PostgresSpec {
                    version: version.to_string(),
                    parameters: BTreeMap::new(),
                },
                coordinator: CoordinatorSpec {
                    instances: 2,
                    instance_profile: "size-m".to_string(),
                    persistent_volume: volume(),
                },
                shards: ShardsSpec {
                    clusters: 3,
                    instances_per_cluster: 2,
                    instance_profile: "size-s".to_string(),
                    persistent_volume: volume(),
                    managed_sql: None,
                },
            },
        );
        sharded.metadata.namespace = Some("db".to_string());
        sharded
    }

    fn profile(name: &str) -> PgInstanceProfile {
        let mut profile = PgInstanceProfile::new(
            name,
            PgInstanceProfileSpec {
                cpu: "1".to_string(),
                memory: "1Gi".to_string(),
                containers: BTreeMap::new(),
                init_containers: BTreeMap::new(),
            },
        );
        profile.metadata.namespace = Some("db".to_string());
        profile
    }

    fn builder(clusters: StaticFinder<PgCluster>) -> ShardedClusterContextBuilder {
        ShardedClusterContextBuilder::new(
            Arc::new(clusters),
            Arc::new(
                StaticFinder::new()
                    .with(profile("size-s"))
                    .with(profile("size-m")),
            ),
        )
    }

    #[tokio::test]
    async fn test_children_and_entry_service() {
        let ctx = builder(StaticFinder::new())
            .build(&sharded("16"))
            .await
            .unwrap();
        let objects = registry(OperatorVersion::V1_3).unwrap().generate(&ctx).unwrap();
        let names: Vec<String> = objects.iter().map(|o| o.name_any()).collect();
        assert_eq!(
            names,
            vec!["sc-coord", "sc-shard0", "sc-shard1", "sc-shard2", "sc"]
        );
        assert_eq!(objects[0].data["spec"]["instanceProfile"], "size-m");
        assert_eq!(objects[1].data["spec"]["instances"], 2);
        assert_eq!(
            objects[4].data["spec"]["selector"][labels::SCOPE_KEY],
            "sc-coord"
        );
        assert_eq!(kind_of(&objects[4]), "Service");
    }

    #[tokio::test]
    async fn test_existing_children_keep_their_postgres_version() {
        let ctx = builder(StaticFinder::new())
            .build(&sharded("15"))
            .await
            .unwrap();
        let existing = registry(OperatorVersion::V1_3).unwrap().generate(&ctx).unwrap();
        let mut coordinator: PgCluster = crate::helpers::from_dynamic(&existing[0]).unwrap();
        coordinator.metadata.namespace = Some("db".to_string());

        let ctx = builder(StaticFinder::new().with(coordinator))
            .build(&sharded("16"))
            .await
            .unwrap();
        let objects = registry(OperatorVersion::V1_3).unwrap().generate(&ctx).unwrap();
        assert_eq!(objects[0].data["spec"]["postgres"]["version"], "15");
        assert_eq!(objects[1].data["spec"]["postgres"]["version"], "16");
    }

    #[tokio::test]
    async fn test_missing_profile_aborts_generation() {
        let builder = ShardedClusterContextBuilder::new(
            Arc::new(StaticFinder::new()),
            Arc::new(StaticFinder::new().with(profile("size-s"))),
        );
        let err = builder.build(&sharded("16")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ReferenceNotFound { ref name, .. } if name == "size-m"
        ));
    }
}
