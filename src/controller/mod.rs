//! Controllers driving each custom resource kind through the Conciliator.
//!
//! A cycle computes and applies the plan, then writes the outcome to the
//! resource status. Failed cycles are retried by the error policy; healthy
//! resources are revisited every `RESYNC_PERIOD` to catch drift the owned
//! watches miss.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::conciliation::{Conciliator, HasWorkloadStatus};
use crate::error::{Error, Result};
use crate::labels::{MANAGED_BY_KEY, MANAGED_BY_VALUE};
use crate::version::OperatorVersion;

pub mod cluster;
pub mod distributed_logs;
pub mod sharded_cluster;
pub mod status;

pub const RESYNC_PERIOD: Duration = Duration::from_secs(300);

/// Shared state of one controller.
pub struct Context<K> {
    pub client: Client,
    pub conciliator: Conciliator<K>,
    pub version: OperatorVersion,
}

/// Watch config for owned objects: only those the operator labelled.
pub(crate) fn owned_watcher() -> WatcherConfig {
    WatcherConfig::default().labels(&format!("{MANAGED_BY_KEY}={MANAGED_BY_VALUE}"))
}

async fn reconcile<K>(resource: Arc<K>, ctx: Arc<Context<K>>) -> Result<Action>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + HasWorkloadStatus
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync,
{
    let result = ctx.conciliator.reconcile(resource.as_ref()).await;
    let reported = status::report(
        &ctx.client,
        resource.as_ref(),
        ctx.version,
        result.as_ref().err(),
    )
    .await;
    if let Err(e) = &reported {
        warn!(name = %resource.name_any(), error = %e, "failed to write status");
    }
    result?;
    reported?;
    Ok(Action::requeue(RESYNC_PERIOD))
}

fn error_policy<K>(resource: Arc<K>, error: &Error, _ctx: Arc<Context<K>>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let delay = error.requeue_delay();
    if error.is_fatal() {
        error!(
            kind = %K::kind(&()),
            name = %resource.name_any(),
            reason = error.reason(),
            %error,
            "operator configuration is unusable, requeuing in {}s",
            delay.as_secs()
        );
        return Action::requeue(delay);
    }
    warn!(
        kind = %K::kind(&()),
        name = %resource.name_any(),
        reason = error.reason(),
        %error,
        "reconcile error, requeuing in {}s",
        delay.as_secs()
    );
    Action::requeue(delay)
}

/// Run `controller` until the watch streams end.
pub(crate) async fn drive<K>(controller: Controller<K>, ctx: Arc<Context<K>>)
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + HasWorkloadStatus
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    controller
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => debug!(name = %obj.name, "reconcile complete"),
                Err(e) => {
                    let msg = format!("{e:?}");
                    if msg.contains("ObjectNotFound") {
                        debug!("reconcile: object already deleted");
                    } else {
                        warn!("reconcile failed: {msg}");
                    }
                }
            }
        })
        .await;
}
