//! Required state of a `PgCluster`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;

use super::decorators::{ProfileDecorator, SizingContext, VersionAnnotationDecorator};
use super::patroni::{
    coordination_document, log_collector_parameters, log_volume, log_volume_mount, Credentials,
    Workload, PG_LOG_PATH,
};
use super::{env, sidecar, FLUENTD_PORT, FLUENT_BIT_CONTAINER, FLUENT_BIT_IMAGE};
use crate::conciliation::{ContextBuilder, RegistryBuilder, ResourceGenerator, ResourceRegistry};
use crate::crd::cluster::ReplicationRole;
use crate::crd::instance_profile::PgInstanceProfileSpec;
use crate::crd::shared::{NonProductionOptions, ResourcesSpec};
use crate::crd::{PgCluster, PgDistributedLogs, PgInstanceProfile};
use crate::error::Result;
use crate::helpers::{
    controller_owner_ref, credentials_secret_name, data_checksum, fluentd_name,
    read_write_service_name, to_dynamic,
};
use crate::labels;
use crate::resolver::CustomResourceFinder;
use crate::store::{ObjectKey, ObjectStore};
use crate::version::{OperatorVersion, VersionRange};

/// Kinds a cluster's required set is made of.
pub const MANAGED_KINDS: &[&str] = &["StatefulSet", "Service", "ConfigMap", "Endpoints", "Secret"];

/// Everything the cluster generators read. Assembled once per cycle.
#[derive(Clone, Debug)]
pub struct ClusterContext {
    pub cluster: PgCluster,
    pub profile: PgInstanceProfile,
    pub distributed_logs: Option<PgDistributedLogs>,
    pub credentials: Credentials,
    pub image: String,
}

impl ClusterContext {
    fn workload(&self) -> Workload<'_> {
        let cluster = &self.cluster;
        Workload {
            name: cluster.metadata.name.as_deref().unwrap_or_default(),
            namespace: cluster.metadata.namespace.as_deref().unwrap_or_default(),
            labels: labels::ownership_labels(cluster),
            pod_labels: labels::pod_labels(cluster),
            owner: controller_owner_ref(cluster),
            instances: cluster.spec.instances,
            postgres: &cluster.spec.postgres,
            volume: &cluster.spec.pods.persistent_volume,
            image: &self.image,
        }
    }

    fn serves_reads(&self) -> bool {
        self.cluster
            .spec
            .replication
            .as_ref()
            .and_then(|r| r.role)
            .unwrap_or_default()
            == ReplicationRole::HaRead
    }

    fn patroni_env(&self) -> Result<BTreeMap<String, String>> {
        let mut env = self.workload().patroni_env()?;
        if self.distributed_logs.is_some() {
            env.insert("PATRONI_LOG_DIR".to_string(), PG_LOG_PATH.to_string());
        }
        Ok(env)
    }
}

impl SizingContext for ClusterContext {
    fn profile(&self) -> Option<&PgInstanceProfileSpec> {
        Some(&self.profile.spec)
    }

    fn resources(&self) -> Option<&ResourcesSpec> {
        self.cluster.spec.resources.as_ref()
    }

    fn non_production_options(&self) -> Option<&NonProductionOptions> {
        self.cluster.spec.non_production_options.as_ref()
    }
}

// ── Context assembly ──────────────────────────────────────────────────────────

/// Resolves the references of a cluster and reuses its live credentials.
pub struct ClusterContextBuilder {
    profiles: Arc<dyn CustomResourceFinder<PgInstanceProfile>>,
    distributed_logs: Arc<dyn CustomResourceFinder<PgDistributedLogs>>,
    store: Arc<dyn ObjectStore>,
    image: String,
}

impl ClusterContextBuilder {
    pub fn new(
        profiles: Arc<dyn CustomResourceFinder<PgInstanceProfile>>,
        distributed_logs: Arc<dyn CustomResourceFinder<PgDistributedLogs>>,
        store: Arc<dyn ObjectStore>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            profiles,
            distributed_logs,
            store,
            image: image.into(),
        }
    }
}

#[async_trait]
impl ContextBuilder<PgCluster, ClusterContext> for ClusterContextBuilder {
    async fn build(&self, cluster: &PgCluster) -> Result<ClusterContext> {
        let namespace = cluster.namespace().unwrap_or_default();
        let profile = self
            .profiles
            .require(&namespace, &cluster.spec.instance_profile)
            .await?;
        let distributed_logs = match &cluster.spec.distributed_logs {
            Some(name) => self.distributed_logs.find(&namespace, name).await?,
            None => None,
        };
        let secret = ObjectKey::new(
            "Secret",
            Some(&namespace),
            &credentials_secret_name(&cluster.name_any()),
        );
        let credentials = match self.store.get(&secret).await? {
            Some(live) => Credentials::from_secret(&live)?,
            None => Credentials::generate(),
        };
        Ok(ClusterContext {
            cluster: cluster.clone(),
            profile,
            distributed_logs,
            credentials,
            image: self.image.clone(),
        })
    }
}

// ── Generators ────────────────────────────────────────────────────────────────

struct StatefulSetGenerator;

impl ResourceGenerator<ClusterContext> for StatefulSetGenerator {
    fn generate(&self, ctx: &ClusterContext) -> Result<Vec<DynamicObject>> {
        let workload = ctx.workload();
        let mut patroni = workload.patroni_container();
        let mut sidecars = Vec::new();
        let mut volumes = Vec::new();
        if let Some(logs) = &ctx.distributed_logs {
            patroni
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .push(log_volume_mount());
            let host = format!(
                "{}.{}",
                fluentd_name(&logs.name_any()),
                logs.namespace().unwrap_or_default()
            );
            sidecars.push(sidecar(
                FLUENT_BIT_CONTAINER,
                FLUENT_BIT_IMAGE,
                vec![
                    env("FLUENTD_HOST", host),
                    env("FLUENTD_PORT", FLUENTD_PORT.to_string()),
                    env("CLUSTER_NAME", workload.name),
                ],
                None,
                vec![log_volume_mount()],
            ));
            volumes.push(log_volume());
        }
        let checksum = data_checksum(&ctx.patroni_env()?);
        Ok(vec![workload.statefulset(patroni, sidecars, volumes, &checksum)?])
    }
}

/// Service names before 1.2: the leader is addressed as `-primary`.
struct LegacyServicesGenerator;

impl ResourceGenerator<ClusterContext> for LegacyServicesGenerator {
    fn generate(&self, ctx: &ClusterContext) -> Result<Vec<DynamicObject>> {
        let workload = ctx.workload();
        let mut services = vec![
            to_dynamic(&workload.config_service())?,
            to_dynamic(&workload.leader_service(read_write_service_name(workload.name)))?,
        ];
        if ctx.serves_reads() {
            services.push(to_dynamic(&workload.replicas_service())?);
        }
        Ok(services)
    }
}

/// Service names from 1.2: the leader owns the cluster name and `-primary`
/// becomes an alias.
struct ServicesGenerator;

impl ResourceGenerator<ClusterContext> for ServicesGenerator {
    fn generate(&self, ctx: &ClusterContext) -> Result<Vec<DynamicObject>> {
        let workload = ctx.workload();
        let mut services = vec![
            to_dynamic(&workload.config_service())?,
            to_dynamic(&workload.leader_service(workload.name.to_string()))?,
            to_dynamic(&workload.primary_alias_service())?,
        ];
        if ctx.serves_reads() {
            services.push(to_dynamic(&workload.replicas_service())?);
        }
        Ok(services)
    }
}

struct PatroniEnvGenerator;

impl ResourceGenerator<ClusterContext> for PatroniEnvGenerator {
    fn generate(&self, ctx: &ClusterContext) -> Result<Vec<DynamicObject>> {
        let config_map = ctx.workload().patroni_env_config_map(ctx.patroni_env()?);
        Ok(vec![to_dynamic(&config_map)?])
    }
}

struct PatroniConfigGenerator;

impl ResourceGenerator<ClusterContext> for PatroniConfigGenerator {
    fn generate(&self, ctx: &ClusterContext) -> Result<Vec<DynamicObject>> {
        let extra = if ctx.distributed_logs.is_some() {
            log_collector_parameters()
        } else {
            BTreeMap::new()
        };
        let document = coordination_document(
            &ctx.cluster.spec.postgres,
            ctx.cluster.spec.replication.as_ref(),
            &extra,
        );
        Ok(vec![to_dynamic(&ctx.workload().config_endpoints(&document)?)?])
    }
}

struct CredentialsGenerator;

impl ResourceGenerator<ClusterContext> for CredentialsGenerator {
    fn generate(&self, ctx: &ClusterContext) -> Result<Vec<DynamicObject>> {
        let secret = ctx.workload().credentials_secret(&ctx.credentials);
        Ok(vec![to_dynamic(&secret)?])
    }
}

/// Registry of the cluster generators and decorators active for `version`.
pub fn registry(version: OperatorVersion) -> Result<ResourceRegistry<ClusterContext>> {
    RegistryBuilder::new()
        .generator("statefulset", VersionRange::all(), StatefulSetGenerator)
        .generator(
            "services",
            VersionRange::between(OperatorVersion::V1_0, OperatorVersion::V1_2),
            LegacyServicesGenerator,
        )
        .generator(
            "services",
            VersionRange::from(OperatorVersion::V1_2),
            ServicesGenerator,
        )
        .generator("patroni-env", VersionRange::all(), PatroniEnvGenerator)
        .generator("patroni-config", VersionRange::all(), PatroniConfigGenerator)
        .generator("credentials", VersionRange::all(), CredentialsGenerator)
        .decorator("instance-profile", VersionRange::all(), ProfileDecorator)
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
    use crate::crd::cluster::{PgClusterSpec, PodsSpec, ReplicationSpec};
    use crate::crd::distributed_logs::PgDistributedLogsSpec;
    use crate::crd::shared::{PersistentVolumeSpec, PostgresSpec};
    use crate::store::kind_of;

    fn context(role: ReplicationRole, logs: bool) -> ClusterContext {
        let mut cluster = PgCluster::new(
            "pg",
            PgClusterSpec {
                instances: 2,
                postgres: PostgresSpec {
                    version: "16".to_string(),
                    parameters: BTreeMap::new(),
                },
                instance_profile: "size-s".to_string(),
                distributed_logs: logs.then(|| "logs".to_string()),
                replication: Some(ReplicationSpec {
                    role: Some(role),
                    ..Default::default()
                }),
                pods: PodsSpec {
                    persistent_volume: PersistentVolumeSpec {
                        size: "5Gi".to_string(),
                        storage_class: None,
                    },
                },
                resources: None,
                non_production_options: None,
            },
        );
        cluster.metadata.namespace = Some("db".to_string());
        cluster.metadata.uid = Some("uid-1".to_string());

        let mut profile = PgInstanceProfile::new(
            "size-s",
            PgInstanceProfileSpec {
                cpu: "1".to_string(),
                memory: "2Gi".to_string(),
                containers: BTreeMap::new(),
                init_containers: BTreeMap::new(),
            },
        );
        profile.metadata.namespace = Some("db".to_string());

        let distributed_logs = logs.then(|| {
            let mut dl = PgDistributedLogs::new(
                "logs",
                PgDistributedLogsSpec {
                    persistent_volume: PersistentVolumeSpec {
                        size: "1Gi".to_string(),
                        storage_class: None,
                    },
                    postgres: PostgresSpec {
                        version: "16".to_string(),
                        parameters: BTreeMap::new(),
                    },
                    instance_profile: None,
                    resources: None,
                    non_production_options: None,
                },
            );
            dl.metadata.namespace = Some("db".to_string());
            dl
        });

        ClusterContext {
            cluster,
            profile,
            distributed_logs,
            credentials: Credentials {
                superuser_password: "s".to_string(),
                replication_password: "r".to_string(),
            },
            image: "postgres".to_string(),
        }
    }

    fn names(objects: &[DynamicObject], kind: &str) -> Vec<String> {
        objects
            .iter()
            .filter(|o| kind_of(o) == kind)
            .map(|o| o.name_any())
            .collect()
    }

    #[test]
    fn test_current_services() {
        let registry = registry(OperatorVersion::V1_3).unwrap();
        let objects = registry
            .generate(&context(ReplicationRole::HaRead, false))
            .unwrap();
        assert_eq!(
            names(&objects, "Service"),
            vec!["pg-config", "pg", "pg-primary", "pg-replicas"]
        );
        assert_eq!(names(&objects, "Endpoints"), vec!["pg-config"]);
        assert_eq!(names(&objects, "ConfigMap"), vec!["pg-patroni-env"]);
        assert_eq!(names(&objects, "Secret"), vec!["pg"]);
    }

    #[test]
    fn test_legacy_services_without_read_replicas() {
        let registry = registry(OperatorVersion::V1_1).unwrap();
        let objects = registry.generate(&context(ReplicationRole::Ha, false)).unwrap();
        assert_eq!(names(&objects, "Service"), vec!["pg-config", "pg-primary"]);
    }

    #[test]
    fn test_every_object_is_owned_and_annotated() {
        let registry = registry(OperatorVersion::V1_3).unwrap();
        for object in registry
            .generate(&context(ReplicationRole::HaRead, true))
            .unwrap()
        {
            let labels = object.metadata.labels.as_ref().unwrap();
            assert_eq!(labels[labels::OWNER_NAME_KEY], "pg");
            assert_eq!(object.metadata.owner_references.as_ref().unwrap()[0].uid, "uid-1");
            assert_eq!(
                object.metadata.annotations.as_ref().unwrap()[crate::helpers::VERSION_ANNOTATION],
                "1.3"
            );
        }
    }

    #[test]
    fn test_distributed_logs_adds_log_shipper() {
        let registry = registry(OperatorVersion::V1_3).unwrap();
        let objects = registry
            .generate(&context(ReplicationRole::HaRead, true))
            .unwrap();
        let statefulset = objects.iter().find(|o| kind_of(o) == "StatefulSet").unwrap();
        let containers = &statefulset.data["spec"]["template"]["spec"]["containers"];
        assert_eq!(containers[1]["name"], FLUENT_BIT_CONTAINER);
        assert_eq!(containers[1]["env"][0]["value"], "logs-fluentd.db");
        // The profile decorator sized the Patroni container.
        assert_eq!(containers[0]["resources"]["limits"]["memory"], "2Gi");

        let endpoints = objects.iter().find(|o| kind_of(o) == "Endpoints").unwrap();
        let config = &endpoints.metadata.annotations.as_ref().unwrap()["config"];
        let document: serde_json::Value = serde_json::from_str(config).unwrap();
        assert_eq!(document["postgresql"]["parameters"]["logging_collector"], "on");
    }

    #[test]
    fn test_env_change_changes_pod_template_checksum() {
        let registry = registry(OperatorVersion::V1_3).unwrap();
        let checksum = |ctx: &ClusterContext| {
            let objects = registry.generate(ctx).unwrap();
            let statefulset = objects.iter().find(|o| kind_of(o) == "StatefulSet").unwrap();
            statefulset.data["spec"]["template"]["metadata"]["annotations"]
                [crate::helpers::CHECKSUM_ANNOTATION]
                .clone()
        };
        assert_ne!(
            checksum(&context(ReplicationRole::HaRead, false)),
            checksum(&context(ReplicationRole::HaRead, true))
        );
    }
}
