//! CRD conversion between API versions.

use kube::core::conversion::{ConversionRequest, ConversionResponse, ConversionReview};
use kube::core::Status;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::crd::GROUP;
use crate::error::{Error, Result};

const V1: &str = "v1";
const V1BETA1: &str = "v1beta1";

/// Converts one object to the desired API version.
pub trait Converter: Send + Sync {
    fn convert(&self, object: Value, desired_api_version: &str) -> Result<Value>;
}

fn version_of(api_version: &str) -> Result<&str> {
    match api_version.split_once('/') {
        Some((group, version)) if group == GROUP && (version == V1 || version == V1BETA1) => {
            Ok(version)
        }
        _ => Err(Error::config(format!(
            "unsupported api version {api_version:?}"
        ))),
    }
}

fn set_api_version(object: &mut Value, desired: &str) {
    object["apiVersion"] = json!(desired);
}

/// Kinds whose schema is identical across versions: only `apiVersion` moves.
pub struct ApiVersionConverter;

impl Converter for ApiVersionConverter {
    fn convert(&self, mut object: Value, desired_api_version: &str) -> Result<Value> {
        version_of(desired_api_version)?;
        set_api_version(&mut object, desired_api_version);
        Ok(object)
    }
}

/// `PgCluster`: v1beta1 carries `spec.postgresVersion`, v1 nests it as
/// `spec.postgres.version`.
pub struct ClusterConverter;

impl Converter for ClusterConverter {
    fn convert(&self, mut object: Value, desired_api_version: &str) -> Result<Value> {
        let current = object["apiVersion"].as_str().unwrap_or_default().to_string();
        let from = version_of(&current)?;
        let to = version_of(desired_api_version)?;
        if let Some(spec) = object.get_mut("spec").and_then(Value::as_object_mut) {
            match (from, to) {
                (V1BETA1, V1) => {
                    if let Some(version) = spec.remove("postgresVersion") {
                        let postgres = spec
                            .entry("postgres")
                            .or_insert_with(|| Value::Object(Map::new()));
                        postgres["version"] = version;
                    }
                }
                (V1, V1BETA1) => {
                    let version = spec
                        .get_mut("postgres")
                        .and_then(Value::as_object_mut)
                        .and_then(|postgres| postgres.remove("version"));
                    if let Some(version) = version {
                        spec.insert("postgresVersion".to_string(), version);
                    }
                    if spec
                        .get("postgres")
                        .and_then(Value::as_object)
                        .is_some_and(Map::is_empty)
                    {
                        spec.remove("postgres");
                    }
                }
                _ => {}
            }
        }
        set_api_version(&mut object, desired_api_version);
        Ok(object)
    }
}

/// Convert every object of `review`. Any object failing fails the review.
pub fn convert_review(converter: &dyn Converter, review: ConversionReview) -> ConversionReview {
    let request = match ConversionRequest::from_review(review) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "invalid conversion review");
            return ConversionResponse::invalid(Status::failure(&e.to_string(), "InvalidRequest"))
                .into_review();
        }
    };
    let desired = request.desired_api_version.clone();
    let objects = request.objects.clone();
    let response = ConversionResponse::for_request(request);

    let converted: Result<Vec<Value>> = objects
        .into_iter()
        .map(|object| converter.convert(object, &desired))
        .collect();
    match converted {
        Ok(objects) => {
            debug!(count = objects.len(), %desired, "converted objects");
            response.success(objects).into_review()
        }
        Err(e) => {
            warn!(error = %e, %desired, "conversion failed");
            response
                .failure(Status::failure(&e.to_string(), "ConversionFailed"))
                .into_review()
        }
    }
}
