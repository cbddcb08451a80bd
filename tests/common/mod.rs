//! Fixtures shared by the integration suites.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use pgstack_operator::conciliation::{
    ConditionStatusOracle, Conciliator, HandlerDispatch, LabelScanner, RegistryGenerator,
};
use pgstack_operator::crd::cluster::{PgClusterSpec, PodsSpec};
use pgstack_operator::crd::instance_profile::PgInstanceProfileSpec;
use pgstack_operator::crd::shared::{PersistentVolumeSpec, PostgresSpec};
use pgstack_operator::crd::{PgCluster, PgDistributedLogs, PgInstanceProfile};
use pgstack_operator::factory::cluster::{registry, ClusterContextBuilder, MANAGED_KINDS};
use pgstack_operator::resolver::StaticFinder;
use pgstack_operator::store::{InMemoryObjectStore, ObjectStore};
use pgstack_operator::version::OperatorVersion;

pub const NAMESPACE: &str = "db";

pub fn cluster(name: &str) -> PgCluster {
    let mut cluster = PgCluster::new(
        name,
        PgClusterSpec {
            instances: 2,
            postgres: PostgresSpec {
                version: "16".to_string(),
                parameters: BTreeMap::new(),
            },
            instance_profile: "size-s".to_string(),
            distributed_logs: None,
            replication: None,
            pods: PodsSpec {
                persistent_volume: PersistentVolumeSpec {
                    size: "10Gi".to_string(),
                    storage_class: None,
                },
            },
            resources: None,
            non_production_options: None,
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.metadata.uid = Some(format!("uid-{name}"));
    cluster
}

pub fn profile(name: &str) -> PgInstanceProfile {
    let mut profile = PgInstanceProfile::new(
        name,
        PgInstanceProfileSpec {
            cpu: "1".to_string(),
            memory: "2Gi".to_string(),
            containers: BTreeMap::new(),
            init_containers: BTreeMap::new(),
        },
    );
    profile.metadata.namespace = Some(NAMESPACE.to_string());
    profile
}

/// A cluster Conciliator over `store`, resolving `size-s` as its only profile.
pub fn cluster_conciliator(
    store: Arc<InMemoryObjectStore>,
    version: OperatorVersion,
) -> Conciliator<PgCluster> {
    let store: Arc<dyn ObjectStore> = store;
    let profiles = Arc::new(StaticFinder::<PgInstanceProfile>::new().with(profile("size-s")));
    let logs = Arc::new(StaticFinder::<PgDistributedLogs>::new());
    let context = ClusterContextBuilder::new(profiles, logs, store.clone(), "patroni:16");
    let generator = RegistryGenerator::new(
        Arc::new(context),
        Arc::new(registry(version).expect("cluster registry")),
    );
    Conciliator::new(
        Arc::new(generator),
        Arc::new(LabelScanner::new(store.clone(), MANAGED_KINDS)),
        Arc::new(ConditionStatusOracle),
        store,
        HandlerDispatch::standard(),
    )
}
