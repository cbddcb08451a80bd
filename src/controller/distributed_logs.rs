//! PgDistributedLogs controller.

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
use crate::crd::PgDistributedLogs;
use crate::error::Result;
use crate::factory::distributed_logs::{registry, DistributedLogsContextBuilder, MANAGED_KINDS};
use crate::resolver::KubeFinder;
use crate::store::ObjectStore;
use crate::version::OperatorVersion;

pub fn conciliator(
    client: Client,
    store: Arc<dyn ObjectStore>,
    version: OperatorVersion,
    image: &str,
) -> Result<Conciliator<PgDistributedLogs>> {
    let context =
        DistributedLogsContextBuilder::new(Arc::new(KubeFinder::new(client)), store.clone(), image);
    let generator = RegistryGenerator::new(Arc::new(context), Arc::new(registry(version)?));
    Ok(Conciliator::new(
        Arc::new(generator),
        Arc::new(LabelScanner::new(store.clone(), MANAGED_KINDS)),
        Arc::new(ConditionStatusOracle),
        store,
        HandlerDispatch::standard(),
    ))
}

pub async fn run(ctx: Arc<Context<PgDistributedLogs>>) {
    let client = ctx.client.clone();
    let controller = Controller::new(
        Api::<PgDistributedLogs>::all(client.clone()),
        WatcherConfig::default(),
    )
    .owns(Api::<StatefulSet>::all(client.clone()), owned_watcher())
    .owns(Api::<Service>::all(client.clone()), owned_watcher())
    .owns(Api::<ConfigMap>::all(client.clone()), owned_watcher())
    .owns(Api::<Endpoints>::all(client.clone()), owned_watcher())
    .owns(Api::<Secret>::all(client), owned_watcher());
    info!("starting PgDistributedLogs controller");
    drive(controller, ctx).await;
}
