//! Desired-state factories: one context type and one registry per managed
//! workload kind.

use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, VolumeMount};

pub mod cluster;
pub mod decorators;
pub mod distributed_logs;
pub mod patroni;
pub mod sharded_cluster;

pub use cluster::{ClusterContext, ClusterContextBuilder};
pub use decorators::{ProfileDecorator, SizingContext, VersionAnnotationDecorator};
pub use distributed_logs::{DistributedLogsContext, DistributedLogsContextBuilder};
pub use sharded_cluster::{ShardedClusterContext, ShardedClusterContextBuilder};

/// Image of the Patroni/Postgres container; the tag is the Postgres version.
pub const DEFAULT_POSTGRES_IMAGE: &str = "ghcr.io/pgstack/patroni";

pub const FLUENT_BIT_CONTAINER: &str = "fluent-bit";
pub const FLUENT_BIT_IMAGE: &str = "fluent/fluent-bit:3.1";
pub const FLUENTD_CONTAINER: &str = "fluentd";
pub const FLUENTD_IMAGE: &str = "fluent/fluentd:v1.17";
pub const FLUENTD_PORT: i32 = 24224;

/// Plain `name=value` environment variable.
pub(crate) fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Sidecar container with a single named port and the given mounts.
pub(crate) fn sidecar(
    name: &str,
    image: &str,
    env: Vec<EnvVar>,
    port: Option<i32>,
    mounts: Vec<VolumeMount>,
) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        env: (!env.is_empty()).then_some(env),
        ports: port.map(|p| {
            vec![ContainerPort {
                name: Some(name.to_string()),
                container_port: p,
                ..Default::default()
            }]
        }),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    }
}
