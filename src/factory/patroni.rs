//! Building blocks shared by every Patroni-managed workload: the StatefulSet,
//! its services, the environment ConfigMap and the config Endpoints.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EmptyDirVolumeSource, Endpoints,
    EnvFromSource, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, Secret,
    SecretKeySelector, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::ByteString;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DynamicObject, ObjectMeta};
use serde_json::{json, Value};

use crate::conciliation::merge::COORDINATION_CONFIG_ANNOTATION;
use crate::crd::cluster::{ReplicationMode, ReplicationSpec};
use crate::crd::shared::{PersistentVolumeSpec, PostgresSpec};
use crate::error::Result;
use crate::helpers::{
    config_endpoints_name, credentials_secret_name, data_checksum, from_dynamic,
    generate_password, patroni_env_name, primary_service_name, read_only_service_name,
    read_write_service_name, to_dynamic, CHECKSUM_ANNOTATION,
};
use crate::labels::{self, ROLE_KEY};

pub const PATRONI_CONTAINER: &str = "patroni";
pub const POSTGRES_PORT: i32 = 5432;
pub const REPLICATION_PORT: i32 = 5433;
pub const PATRONI_PORT: i32 = 8008;
pub const PG_DATA_PATH: &str = "/var/lib/postgresql/data";
pub const PG_LOG_PATH: &str = "/var/log/postgresql";
pub const SUPERUSER: &str = "postgres";
pub const REPLICATION_USER: &str = "replicator";
pub const SUPERUSER_PASSWORD_KEY: &str = "superuser-password";
pub const REPLICATION_PASSWORD_KEY: &str = "replication-password";

const DATA_VOLUME: &str = "data";
const LOG_VOLUME: &str = "log";

/// Passwords of the Postgres system users of one scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub superuser_password: String,
    pub replication_password: String,
}

impl Credentials {
    pub fn generate() -> Self {
        Self {
            superuser_password: generate_password(),
            replication_password: generate_password(),
        }
    }

    /// Reuse the passwords stored in a live Secret. Keys missing from the
    /// Secret are generated afresh.
    pub fn from_secret(secret: &DynamicObject) -> Result<Self> {
        let secret: Secret = from_dynamic(secret)?;
        let data = secret.data.unwrap_or_default();
        let read = |key: &str| {
            data.get(key)
                .and_then(|b| String::from_utf8(b.0.clone()).ok())
                .unwrap_or_else(generate_password)
        };
        Ok(Self {
            superuser_password: read(SUPERUSER_PASSWORD_KEY),
            replication_password: read(REPLICATION_PASSWORD_KEY),
        })
    }
}

/// Scratch volume the Postgres log files are written to.
pub fn log_volume() -> Volume {
    Volume {
        name: LOG_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

pub fn log_volume_mount() -> VolumeMount {
    VolumeMount {
        name: LOG_VOLUME.to_string(),
        mount_path: PG_LOG_PATH.to_string(),
        ..Default::default()
    }
}

/// Postgres parameters writing csv logs where a log shipper can tail them.
pub fn log_collector_parameters() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("logging_collector".to_string(), "on".to_string()),
        ("log_destination".to_string(), "csvlog".to_string()),
        ("log_directory".to_string(), PG_LOG_PATH.to_string()),
        ("log_filename".to_string(), "postgres-%M.log".to_string()),
        ("log_rotation_age".to_string(), "5min".to_string()),
        ("log_truncate_on_rotation".to_string(), "on".to_string()),
    ])
}

/// Everything the builders need to know about one Patroni scope.
pub struct Workload<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    /// Ownership labels stamped on every generated object.
    pub labels: BTreeMap<String, String>,
    /// Labels of the pods: ownership plus scope.
    pub pod_labels: BTreeMap<String, String>,
    pub owner: OwnerReference,
    pub instances: i32,
    pub postgres: &'a PostgresSpec,
    pub volume: &'a PersistentVolumeSpec,
    pub image: &'a str,
}

impl Workload<'_> {
    pub fn metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.to_string()),
            labels: Some(self.labels.clone()),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }

    // ── StatefulSet ───────────────────────────────────────────────────────────

    /// The Patroni container. Sizing is left to the profile decorator.
    pub fn patroni_container(&self) -> Container {
        let secret = credentials_secret_name(self.name);
        let secret_env = |name: &str, key: &str| EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.clone(),
                    key: key.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let field_env = |name: &str, path: &str| EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    api_version: Some("v1".to_string()),
                    field_path: path.to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        Container {
            name: PATRONI_CONTAINER.to_string(),
            image: Some(format!("{}:{}", self.image, self.postgres.version)),
            env_from: Some(vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: patroni_env_name(self.name),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            env: Some(vec![
                field_env("PATRONI_NAME", "metadata.name"),
                field_env("POD_IP", "status.podIP"),
                secret_env("PATRONI_SUPERUSER_PASSWORD", SUPERUSER_PASSWORD_KEY),
                secret_env("PATRONI_REPLICATION_PASSWORD", REPLICATION_PASSWORD_KEY),
            ]),
            ports: Some(vec![
                ContainerPort {
                    name: Some("pgport".to_string()),
                    container_port: POSTGRES_PORT,
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("pgreplication".to_string()),
                    container_port: REPLICATION_PORT,
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("patroniport".to_string()),
                    container_port: PATRONI_PORT,
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: PG_DATA_PATH.to_string(),
                ..Default::default()
            }]),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/readiness".to_string()),
                    port: IntOrString::Int(PATRONI_PORT),
                    ..Default::default()
                }),
                period_seconds: Some(10),
                timeout_seconds: Some(5),
                ..Default::default()
            }),
            liveness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/liveness".to_string()),
                    port: IntOrString::Int(PATRONI_PORT),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(15),
                period_seconds: Some(20),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// StatefulSet running `patroni` plus `sidecars`. The pod template
    /// carries `env_checksum` so an environment change rolls pods.
    pub fn statefulset(
        &self,
        patroni: Container,
        sidecars: Vec<Container>,
        volumes: Vec<Volume>,
        env_checksum: &str,
    ) -> Result<DynamicObject> {
        let mut containers = vec![patroni];
        containers.extend(sidecars);

        let statefulset = StatefulSet {
            metadata: self.metadata(self.name.to_string()),
            spec: Some(StatefulSetSpec {
                replicas: Some(self.instances),
                selector: LabelSelector {
                    match_labels: Some(self.pod_labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.pod_labels.clone()),
                        annotations: Some(BTreeMap::from([(
                            CHECKSUM_ANNOTATION.to_string(),
                            env_checksum.to_string(),
                        )])),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers,
                        volumes: (!volumes.is_empty()).then_some(volumes),
                        termination_grace_period_seconds: Some(60),
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(vec![PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(DATA_VOLUME.to_string()),
                        ..Default::default()
                    },
                    spec: Some(PersistentVolumeClaimSpec {
                        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                        storage_class_name: self.volume.storage_class.clone(),
                        resources: Some(VolumeResourceRequirements {
                            requests: Some(BTreeMap::from([(
                                "storage".to_string(),
                                Quantity(self.volume.size.clone()),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        // serviceName is required by older API servers and optional in newer
        // typed bindings, so it is set on the erased form.
        let mut object = to_dynamic(&statefulset)?;
        object.data["spec"]["serviceName"] = json!(primary_service_name(self.name));
        Ok(object)
    }

    // ── Services ──────────────────────────────────────────────────────────────

    fn postgres_ports(&self) -> Vec<ServicePort> {
        vec![
            ServicePort {
                name: Some("pgport".to_string()),
                protocol: Some("TCP".to_string()),
                port: POSTGRES_PORT,
                target_port: Some(IntOrString::String("pgport".to_string())),
                ..Default::default()
            },
            ServicePort {
                name: Some("pgreplication".to_string()),
                protocol: Some("TCP".to_string()),
                port: REPLICATION_PORT,
                target_port: Some(IntOrString::String("pgreplication".to_string())),
                ..Default::default()
            },
        ]
    }

    /// Headless service backing the config Endpoints.
    pub fn config_service(&self) -> Service {
        Service {
            metadata: self.metadata(config_endpoints_name(self.name)),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Selector-less service named `name`; the agent points its Endpoints at
    /// the current leader.
    pub fn leader_service(&self, name: String) -> Service {
        Service {
            metadata: self.metadata(name),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ports: Some(self.postgres_ports()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// `-primary` alias resolving to the leader service.
    pub fn primary_alias_service(&self) -> Service {
        Service {
            metadata: self.metadata(read_write_service_name(self.name)),
            spec: Some(ServiceSpec {
                type_: Some("ExternalName".to_string()),
                external_name: Some(format!(
                    "{}.{}.svc.cluster.local",
                    primary_service_name(self.name),
                    self.namespace
                )),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Service balancing over the replicas of the scope.
    pub fn replicas_service(&self) -> Service {
        Service {
            metadata: self.metadata(read_only_service_name(self.name)),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(labels::role_selector(self.name, "replica")),
                ports: Some(self.postgres_ports()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // ── Environment and coordination ──────────────────────────────────────────

    /// Environment of the Patroni container, before any kind-specific extras.
    pub fn patroni_env(&self) -> Result<BTreeMap<String, String>> {
        let scope_labels = serde_json::to_string(&labels::scope_labels(self.name))?;
        Ok(BTreeMap::from([
            ("PATRONI_SCOPE".to_string(), self.name.to_string()),
            (
                "PATRONI_KUBERNETES_NAMESPACE".to_string(),
                self.namespace.to_string(),
            ),
            ("PATRONI_KUBERNETES_LABELS".to_string(), scope_labels),
            ("PATRONI_KUBERNETES_ROLE_LABEL".to_string(), ROLE_KEY.to_string()),
            ("PATRONI_KUBERNETES_USE_ENDPOINTS".to_string(), "true".to_string()),
            (
                "PATRONI_KUBERNETES_POD_IP".to_string(),
                "$(POD_IP)".to_string(),
            ),
            (
                "PATRONI_POSTGRESQL_LISTEN".to_string(),
                format!("0.0.0.0:{POSTGRES_PORT}"),
            ),
            (
                "PATRONI_POSTGRESQL_CONNECT_ADDRESS".to_string(),
                format!("$(POD_IP):{POSTGRES_PORT}"),
            ),
            (
                "PATRONI_RESTAPI_LISTEN".to_string(),
                format!("0.0.0.0:{PATRONI_PORT}"),
            ),
            (
                "PATRONI_POSTGRESQL_DATA_DIR".to_string(),
                PG_DATA_PATH.to_string(),
            ),
            (
                "PATRONI_POSTGRESQL_BIN_DIR".to_string(),
                format!("/usr/lib/postgresql/{}/bin", self.postgres.version),
            ),
            ("PATRONI_SUPERUSER_USERNAME".to_string(), SUPERUSER.to_string()),
            (
                "PATRONI_REPLICATION_USERNAME".to_string(),
                REPLICATION_USER.to_string(),
            ),
        ]))
    }

    /// The environment ConfigMap, annotated with the checksum of its data.
    pub fn patroni_env_config_map(&self, data: BTreeMap<String, String>) -> ConfigMap {
        let mut metadata = self.metadata(patroni_env_name(self.name));
        metadata.annotations = Some(BTreeMap::from([(
            CHECKSUM_ANNOTATION.to_string(),
            data_checksum(&data),
        )]));
        ConfigMap {
            metadata,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn credentials_secret(&self, credentials: &Credentials) -> Secret {
        let bytes = |s: &str| ByteString(s.as_bytes().to_vec());
        Secret {
            metadata: self.metadata(credentials_secret_name(self.name)),
            type_: Some("Opaque".to_string()),
            data: Some(BTreeMap::from([
                (
                    SUPERUSER_PASSWORD_KEY.to_string(),
                    bytes(&credentials.superuser_password),
                ),
                (
                    REPLICATION_PASSWORD_KEY.to_string(),
                    bytes(&credentials.replication_password),
                ),
            ])),
            ..Default::default()
        }
    }

    /// Config Endpoints carrying the serialized coordination document. The
    /// agent adds its own keys to the document and its own annotations.
    pub fn config_endpoints(&self, document: &Value) -> Result<Endpoints> {
        let mut metadata = self.metadata(config_endpoints_name(self.name));
        metadata.annotations = Some(BTreeMap::from([(
            COORDINATION_CONFIG_ANNOTATION.to_string(),
            serde_json::to_string(document)?,
        )]));
        Ok(Endpoints {
            metadata,
            ..Default::default()
        })
    }
}

/// Postgres parameters every scope starts from; user parameters override them.
fn default_parameters() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("max_connections".to_string(), "100".to_string()),
        ("wal_level".to_string(), "logical".to_string()),
        ("hot_standby".to_string(), "on".to_string()),
        ("max_wal_senders".to_string(), "20".to_string()),
        ("max_replication_slots".to_string(), "20".to_string()),
        ("wal_log_hints".to_string(), "on".to_string()),
    ])
}

/// The dynamic configuration document the coordination agent reads.
pub fn coordination_document(
    postgres: &PostgresSpec,
    replication: Option<&ReplicationSpec>,
    extra_parameters: &BTreeMap<String, String>,
) -> Value {
    let mut parameters = default_parameters();
    parameters.extend(extra_parameters.clone());
    parameters.extend(postgres.parameters.clone());

    let mode = replication.and_then(|r| r.mode).unwrap_or_default();
    let mut document = json!({
        "ttl": 30,
        "loop_wait": 10,
        "retry_timeout": 10,
        "synchronous_mode": mode.is_synchronous(),
        "synchronous_mode_strict": mode == ReplicationMode::StrictSync,
        "postgresql": {
            "use_pg_rewind": true,
            "use_slots": true,
            "parameters": parameters,
        },
    });
    if mode.is_synchronous() {
        document["synchronous_node_count"] =
            json!(replication.and_then(|r| r.sync_instances).unwrap_or(1));
    }
    document
}
