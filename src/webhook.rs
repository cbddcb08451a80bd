//! HTTPS surface for admission and conversion reviews.
//!
//! Every kind gets three endpoints keyed by its singular name:
//! `POST /pgstack/mutation/<singular>`, `POST /pgstack/validation/<singular>`
//! and `POST /pgstack/conversion/<singular>`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::conversion::ConversionReview;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};
use warp::reply::Json;
use warp::{Filter, Rejection};

use crate::admission::conversion::{convert_review, ApiVersionConverter, ClusterConverter, Converter};
use crate::admission::AdmissionPipeline;
use crate::crd::{PgCluster, PgDistributedLogs, PgInstanceProfile, PgShardedCluster};

pub const WEBHOOK_ROOT: &str = "pgstack";
pub const MUTATION: &str = "mutation";
pub const VALIDATION: &str = "validation";
pub const CONVERSION: &str = "conversion";

/// Path the API server calls for `phase` of the kind named `singular`.
pub fn webhook_path(phase: &str, singular: &str) -> String {
    format!("/{WEBHOOK_ROOT}/{phase}/{singular}")
}

fn singular<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_ascii_lowercase()
}

/// Admission pipelines served by the webhook, one per kind.
#[derive(Clone)]
pub struct Webhooks {
    pub cluster: Arc<AdmissionPipeline<PgCluster>>,
    pub sharded_cluster: Arc<AdmissionPipeline<PgShardedCluster>>,
    pub distributed_logs: Arc<AdmissionPipeline<PgDistributedLogs>>,
    pub instance_profile: Arc<AdmissionPipeline<PgInstanceProfile>>,
}

impl Webhooks {
    pub fn routes(&self) -> impl Filter<Extract = (Json,), Error = Rejection> + Clone {
        admission(self.cluster.clone())
            .or(admission(self.sharded_cluster.clone()))
            .unify()
            .or(admission(self.distributed_logs.clone()))
            .unify()
            .or(admission(self.instance_profile.clone()))
            .unify()
            .or(conversion::<PgCluster>(Arc::new(ClusterConverter)))
            .unify()
            .or(conversion::<PgShardedCluster>(Arc::new(ApiVersionConverter)))
            .unify()
            .or(conversion::<PgDistributedLogs>(Arc::new(ApiVersionConverter)))
            .unify()
            .or(conversion::<PgInstanceProfile>(Arc::new(ApiVersionConverter)))
            .unify()
    }

    /// Serve the webhook over TLS until the process stops.
    pub async fn run(self, addr: SocketAddr, tls_cert: &str, tls_key: &str) {
        info!(%addr, "starting admission webhook server");
        warp::serve(self.routes())
            .tls()
            .cert_path(tls_cert)
            .key_path(tls_key)
            .run(addr)
            .await;
    }
}

fn kind_path<K: Resource<DynamicType = ()>>(
    phase: &'static str,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::path(WEBHOOK_ROOT)
        .and(warp::path(phase))
        .and(warp::path(singular::<K>()))
        .and(warp::path::end())
}

fn admission<K>(
    pipeline: Arc<AdmissionPipeline<K>>,
) -> impl Filter<Extract = (Json,), Error = Rejection> + Clone
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    review_route(MUTATION, pipeline.clone())
        .or(review_route(VALIDATION, pipeline))
        .unify()
}

fn review_route<K>(
    phase: &'static str,
    pipeline: Arc<AdmissionPipeline<K>>,
) -> impl Filter<Extract = (Json,), Error = Rejection> + Clone
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    warp::post()
        .and(kind_path::<K>(phase))
        .and(warp::body::json())
        .and_then(move |review: AdmissionReview<K>| {
            let pipeline = pipeline.clone();
            async move {
                let request: Result<AdmissionRequest<K>, _> = review.try_into();
                let response = match request {
                    Ok(request) if phase == MUTATION => pipeline.review(request).await,
                    Ok(request) => pipeline.review_validation(request).await,
                    Err(e) => {
                        warn!(%e, kind = %K::kind(&()), "invalid admission request");
                        AdmissionResponse::invalid(format!("invalid request: {e}"))
                    }
                };
                Ok::<_, Infallible>(warp::reply::json(&response.into_review()))
            }
        })
}

fn conversion<K: Resource<DynamicType = ()>>(
    converter: Arc<dyn Converter>,
) -> impl Filter<Extract = (Json,), Error = Rejection> + Clone {
    warp::post()
        .and(kind_path::<K>(CONVERSION))
        .and(warp::body::json())
        .map(move |review: ConversionReview| {
            warp::reply::json(&convert_review(converter.as_ref(), review))
        })
}

/// Liveness and readiness probes.
pub fn health_routes() -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    healthz.or(readyz)
}
