//! Required state of a `PgDistributedLogs`: a single-instance Patroni scope
//! with a fluentd collector in front of it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use kube::ResourceExt;

use super::decorators::{ProfileDecorator, SizingContext, VersionAnnotationDecorator};
use super::patroni::{
    coordination_document, Credentials, Workload, POSTGRES_PORT, SUPERUSER,
};
use super::{env, sidecar, FLUENTD_CONTAINER, FLUENTD_IMAGE, FLUENTD_PORT};
use crate::conciliation::{ContextBuilder, RegistryBuilder, ResourceGenerator, ResourceRegistry};
use crate::crd::instance_profile::PgInstanceProfileSpec;
use crate::crd::shared::{NonProductionOptions, ResourcesSpec};
use crate::crd::{PgDistributedLogs, PgInstanceProfile};
use crate::error::Result;
use crate::helpers::{
    controller_owner_ref, credentials_secret_name, data_checksum, fluentd_name, to_dynamic,
};
use crate::labels;
use crate::resolver::CustomResourceFinder;
use crate::store::{ObjectKey, ObjectStore};
use crate::version::{OperatorVersion, VersionRange};

pub const MANAGED_KINDS: &[&str] = &["StatefulSet", "Service", "ConfigMap", "Endpoints", "Secret"];

const FLUENTD_CONFIG_PATH: &str = "/etc/fluentd";
const FLUENTD_CONFIG_VOLUME: &str = "fluentd-config";

#[derive(Clone, Debug)]
pub struct DistributedLogsContext {
    pub distributed_logs: PgDistributedLogs,
    pub profile: Option<PgInstanceProfile>,
    pub credentials: Credentials,
    pub image: String,
}

impl DistributedLogsContext {
    fn workload(&self) -> Workload<'_> {
        let logs = &self.distributed_logs;
        Workload {
            name: logs.metadata.name.as_deref().unwrap_or_default(),
            namespace: logs.metadata.namespace.as_deref().unwrap_or_default(),
            labels: labels::ownership_labels(logs),
            pod_labels: labels::pod_labels(logs),
            owner: controller_owner_ref(logs),
            instances: 1,
            postgres: &logs.spec.postgres,
            volume: &logs.spec.persistent_volume,
            image: &self.image,
        }
    }

    /// fluentd configuration: accept forwarded records and insert them into
    /// the log database over localhost.
    fn fluentd_config(&self) -> BTreeMap<String, String> {
        let conf = format!(
            r##"<source>
  @type forward
  bind 0.0.0.0
  port {FLUENTD_PORT}
</source>

<match **>
  @type sql
  host 127.0.0.1
  port {POSTGRES_PORT}
  database postgres
  adapter postgresql
  username {SUPERUSER}
  password "#{{ENV['SUPERUSER_PASSWORD']}}"
  <table>
    table log_postgres
    column_mapping 'log_time,user_name,database_name,process_id,connection_from,session_id,error_severity,message,detail,hint,query,cluster_name'
  </table>
</match>
"##
        );
        BTreeMap::from([("fluentd.conf".to_string(), conf)])
    }
}

impl SizingContext for DistributedLogsContext {
    fn profile(&self) -> Option<&PgInstanceProfileSpec> {
        self.profile.as_ref().map(|p| &p.spec)
    }

    fn resources(&self) -> Option<&ResourcesSpec> {
        self.distributed_logs.spec.resources.as_ref()
    }

    fn non_production_options(&self) -> Option<&NonProductionOptions> {
        self.distributed_logs.spec.non_production_options.as_ref()
    }
}

// ── Context assembly ──────────────────────────────────────────────────────────

pub struct DistributedLogsContextBuilder {
    profiles: Arc<dyn CustomResourceFinder<PgInstanceProfile>>,
    store: Arc<dyn ObjectStore>,
    image: String,
}

impl DistributedLogsContextBuilder {
    pub fn new(
        profiles: Arc<dyn CustomResourceFinder<PgInstanceProfile>>,
        store: Arc<dyn ObjectStore>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            profiles,
            store,
            image: image.into(),
        }
    }
}

#[async_trait]
impl ContextBuilder<PgDistributedLogs, DistributedLogsContext> for DistributedLogsContextBuilder {
    async fn build(&self, logs: &PgDistributedLogs) -> Result<DistributedLogsContext> {
        let namespace = logs.namespace().unwrap_or_default();
        let profile = match &logs.spec.instance_profile {
            Some(name) => self.profiles.find(&namespace, name).await?,
            None => None,
        };
        let secret = ObjectKey::new(
            "Secret",
            Some(&namespace),
            &credentials_secret_name(&logs.name_any()),
        );
        let credentials = match self.store.get(&secret).await? {
            Some(live) => Credentials::from_secret(&live)?,
            None => Credentials::generate(),
        };
        Ok(DistributedLogsContext {
            distributed_logs: logs.clone(),
            profile,
            credentials,
            image: self.image.clone(),
        })
    }
}

// ── Generators ────────────────────────────────────────────────────────────────

struct StatefulSetGenerator;

impl ResourceGenerator<DistributedLogsContext> for StatefulSetGenerator {
    fn generate(&self, ctx: &DistributedLogsContext) -> Result<Vec<DynamicObject>> {
        let workload = ctx.workload();
        let mut fluentd = sidecar(
            FLUENTD_CONTAINER,
            FLUENTD_IMAGE,
            vec![env("FLUENTD_CONF", "fluentd.conf")],
            Some(FLUENTD_PORT),
            vec![VolumeMount {
                name: FLUENTD_CONFIG_VOLUME.to_string(),
                mount_path: FLUENTD_CONFIG_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            }],
        );
        if let Some(patroni_env) = workload.patroni_container().env {
            // Reuse the secret reference of the superuser password.
            fluentd.env.get_or_insert_with(Vec::new).extend(
                patroni_env
                    .into_iter()
                    .filter(|e| e.name == "PATRONI_SUPERUSER_PASSWORD")
                    .map(|mut e| {
                        e.name = "SUPERUSER_PASSWORD".to_string();
                        e
                    }),
            );
        }
        let volumes = vec![Volume {
            name: FLUENTD_CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: fluentd_name(workload.name),
                ..Default::default()
            }),
            ..Default::default()
        }];
        // Both the environment and the collector config roll the pods.
        let mut inputs = workload.patroni_env()?;
        inputs.extend(ctx.fluentd_config());
        let checksum = data_checksum(&inputs);
        Ok(vec![workload.statefulset(
            workload.patroni_container(),
            vec![fluentd],
            volumes,
            &checksum,
        )?])
    }
}

struct ServicesGenerator;

impl ResourceGenerator<DistributedLogsContext> for ServicesGenerator {
    fn generate(&self, ctx: &DistributedLogsContext) -> Result<Vec<DynamicObject>> {
        let workload = ctx.workload();
        let fluentd = Service {
            metadata: workload.metadata(fluentd_name(workload.name)),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(labels::role_selector(workload.name, "primary")),
                ports: Some(vec![ServicePort {
                    name: Some(FLUENTD_CONTAINER.to_string()),
                    protocol: Some("TCP".to_string()),
                    port: FLUENTD_PORT,
                    target_port: Some(IntOrString::Int(FLUENTD_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        Ok(vec![
            to_dynamic(&workload.config_service())?,
            to_dynamic(&workload.leader_service(workload.name.to_string()))?,
            to_dynamic(&workload.primary_alias_service())?,
            to_dynamic(&fluentd)?,
        ])
    }
}

struct PatroniEnvGenerator;

impl ResourceGenerator<DistributedLogsContext> for PatroniEnvGenerator {
    fn generate(&self, ctx: &DistributedLogsContext) -> Result<Vec<DynamicObject>> {
        let workload = ctx.workload();
        Ok(vec![to_dynamic(
            &workload.patroni_env_config_map(workload.patroni_env()?),
        )?])
    }
}

struct FluentdConfigGenerator;

impl ResourceGenerator<DistributedLogsContext> for FluentdConfigGenerator {
    fn generate(&self, ctx: &DistributedLogsContext) -> Result<Vec<DynamicObject>> {
        let workload = ctx.workload();
        let config_map = ConfigMap {
            metadata: workload.metadata(fluentd_name(workload.name)),
            data: Some(ctx.fluentd_config()),
            ..Default::default()
        };
        Ok(vec![to_dynamic(&config_map)?])
    }
}

struct PatroniConfigGenerator;

impl ResourceGenerator<DistributedLogsContext> for PatroniConfigGenerator {
    fn generate(&self, ctx: &DistributedLogsContext) -> Result<Vec<DynamicObject>> {
        let document = coordination_document(
            &ctx.distributed_logs.spec.postgres,
            None,
            &BTreeMap::new(),
        );
        Ok(vec![to_dynamic(&ctx.workload().config_endpoints(&document)?)?])
    }
}

struct CredentialsGenerator;

impl ResourceGenerator<DistributedLogsContext> for CredentialsGenerator {
    fn generate(&self, ctx: &DistributedLogsContext) -> Result<Vec<DynamicObject>> {
        Ok(vec![to_dynamic(
            &ctx.workload().credentials_secret(&ctx.credentials),
        )?])
    }
}

pub fn registry(version: OperatorVersion) -> Result<ResourceRegistry<DistributedLogsContext>> {
    RegistryBuilder::new()
        .generator("statefulset", VersionRange::all(), StatefulSetGenerator)
        .generator("services", VersionRange::all(), ServicesGenerator)
        .generator("patroni-env", VersionRange::all(), PatroniEnvGenerator)
        .generator("fluentd-config", VersionRange::all(), FluentdConfigGenerator)
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
