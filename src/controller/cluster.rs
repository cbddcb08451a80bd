//! PgCluster controller.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret, Service};
use kube::api::Api;
use kube::runtime::controller::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::Client;
use tracing::info;

use super::{drive, owned_watcher, Context};
use crate::conciliation::{
    ConditionStatusOracle, Conciliator, HandlerDispatch, LabelScanner, RegistryGenerator,
};
use crate::crd::PgCluster;
use crate::error::Result;
use crate::factory::cluster::{registry, ClusterContextBuilder, MANAGED_KINDS};
use crate::resolver::KubeFinder;
use crate::store::ObjectStore;
use crate::version::OperatorVersion;

/// Wire the cluster generators, scanner and handlers over `store`.
pub fn conciliator(
    client: Client,
    store: Arc<dyn ObjectStore>,
    version: OperatorVersion,
    image: &str,
) -> Result<Conciliator<PgCluster>> {
    let context = ClusterContextBuilder::new(
        Arc::new(KubeFinder::new(client.clone())),
        Arc::new(KubeFinder::new(client)),
        store.clone(),
        image,
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

/// Start the PgCluster controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context<PgCluster>>) {
    let client = ctx.client.clone();
    let controller = Controller::new(Api::<PgCluster>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<StatefulSet>::all(client.clone()), owned_watcher())
        .owns(Api::<Service>::all(client.clone()), owned_watcher())
        .owns(Api::<ConfigMap>::all(client.clone()), owned_watcher())
        .owns(Api::<Endpoints>::all(client.clone()), owned_watcher())
        .owns(Api::<Secret>::all(client), owned_watcher());
    info!("starting PgCluster controller");
    drive(controller, ctx).await;
}
