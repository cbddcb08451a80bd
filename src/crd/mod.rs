//! Custom resource definitions served by the operator.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub mod cluster;
pub mod distributed_logs;
pub mod instance_profile;
pub mod operator_config;
pub mod shared;
pub mod sharded_cluster;

pub use cluster::PgCluster;
pub use distributed_logs::PgDistributedLogs;
pub use instance_profile::PgInstanceProfile;
pub use operator_config::PgOperatorConfig;
pub use sharded_cluster::PgShardedCluster;

/// API group shared by every custom resource of the operator.
pub const GROUP: &str = "pgstack.io";

/// Every CRD the operator installs, in a stable order.
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        PgCluster::crd(),
        PgShardedCluster::crd(),
        PgDistributedLogs::crd(),
        PgInstanceProfile::crd(),
        PgOperatorConfig::crd(),
    ]
}
