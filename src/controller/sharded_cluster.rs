//! PgShardedCluster controller. Its children are PgCluster resources, which
//! the PgCluster controller then reconciles in turn.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use kube::runtime::controller::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::Client;
use tracing::info;

use super::{drive, owned_watcher, Context};
use crate::conciliation::{
    ConditionStatusOracle, Conciliator, HandlerDispatch, LabelScanner, RegistryGenerator,
};
use crate::crd::{PgCluster, PgShardedCluster};
use crate::error::Result;
use crate::factory::sharded_cluster::{registry, ShardedClusterContextBuilder, MANAGED_KINDS};
use crate::resolver::KubeFinder;
use crate::store::ObjectStore;
use crate::version::OperatorVersion;

pub fn conciliator(
    client: Client,
    store: Arc<dyn ObjectStore>,
    version: OperatorVersion,
) -> Result<Conciliator<PgShardedCluster>> {
    let context = ShardedClusterContextBuilder::new(
        Arc::new(KubeFinder::new(client.clone())),
        Arc::new(KubeFinder::new(client)),
    );
    let generator = RegistryGenerator::new(Arc::new(context), Arc::new(registry(version)?));
    Ok(Conciliator::new(
        Arc::new(generator),
        Arc::new(LabelScanner::new(store.clone(), MANAGED_KINDS)),
        Arc::new(ConditionStatusOracle),
        store,
        HandlerDispatch::standard(),
    ))
}

pub async fn run(ctx: Arc<Context<PgShardedCluster>>) {
    let client = ctx.client.clone();
    let controller = Controller::new(
        Api::<PgShardedCluster>::all(client.clone()),
        WatcherConfig::default(),
    )
    .owns(Api::<PgCluster>::all(client.clone()), owned_watcher())
    .owns(Api::<Service>::all(client), owned_watcher());
    info!("starting PgShardedCluster controller");
    drive(controller, ctx).await;
}
