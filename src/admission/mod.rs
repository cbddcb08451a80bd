//! Admission pipeline: version-scoped mutators then validators, per kind.
//!
//! Mutators run first, in registration order, each on the output of the
//! previous one. Validators then run in registration order against the
//! mutated object; the first failure ends the review and nothing after it
//! runs.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::Resource;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::version::{OperatorVersion, VersionRange};

pub mod cluster;
pub mod conversion;
pub mod distributed_logs;
pub mod instance_profile;
pub mod sharded_cluster;
pub mod validators;

/// Reason of a rejected admission, written to the response status.
pub const CONSTRAINT_VIOLATION: &str = "constraint-violation";
pub const INVALID_CR_REFERENCE: &str = "invalid-cr-reference";
pub const FORBIDDEN_CR_UPDATE: &str = "forbidden-cr-update";
pub const FORBIDDEN_CR_DELETION: &str = "forbidden-cr-deletion";

/// Why a validator rejected a request. The message is returned verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationFailed {
    pub reason: String,
    pub message: String,
}

impl ValidationFailed {
    pub fn new(reason: &str, message: impl Into<String>) -> Self {
        Self {
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn constraint_violation(message: impl Into<String>) -> Self {
        Self::new(CONSTRAINT_VIOLATION, message)
    }

    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::new(INVALID_CR_REFERENCE, message)
    }

    pub fn forbidden_update(message: impl Into<String>) -> Self {
        Self::new(FORBIDDEN_CR_UPDATE, message)
    }

    pub fn forbidden_deletion(message: impl Into<String>) -> Self {
        Self::new(FORBIDDEN_CR_DELETION, message)
    }
}

impl From<Error> for ValidationFailed {
    fn from(err: Error) -> Self {
        Self::new(err.reason(), err.to_string())
    }
}

/// Rewrites the incoming object. `object` is the current state of the
/// object within the pipeline; the request carries the original.
#[async_trait]
pub trait Mutator<K: Resource>: Send + Sync {
    async fn mutate(&self, request: &AdmissionRequest<K>, object: &mut K) -> Result<()>;
}

/// Accepts or rejects a request. `request.object` is the mutated object.
#[async_trait]
pub trait Validator<K: Resource>: Send + Sync {
    async fn validate(&self, request: &AdmissionRequest<K>) -> Result<(), ValidationFailed>;
}

/// Result of running the pipeline over one request.
#[derive(Debug, PartialEq)]
pub enum Verdict {
    /// Accepted; `patch` rewrites the submitted object into the mutated one.
    Allowed { patch: Option<json_patch::Patch> },
    Denied(ValidationFailed),
}

struct Entry<T: ?Sized> {
    name: &'static str,
    range: VersionRange,
    item: Arc<T>,
}

/// Collects registrations before the running version is known.
pub struct PipelineBuilder<K: Resource> {
    mutators: Vec<Entry<dyn Mutator<K>>>,
    validators: Vec<Entry<dyn Validator<K>>>,
}

impl<K: Resource> Default for PipelineBuilder<K> {
    fn default() -> Self {
        Self {
            mutators: Vec::new(),
            validators: Vec::new(),
        }
    }
}

impl<K: Resource + 'static> PipelineBuilder<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mutator(
        mut self,
        name: &'static str,
        range: VersionRange,
        mutator: impl Mutator<K> + 'static,
    ) -> Self {
        self.mutators.push(Entry {
            name,
            range,
            item: Arc::new(mutator),
        });
        self
    }

    pub fn validator(
        mut self,
        name: &'static str,
        range: VersionRange,
        validator: impl Validator<K> + 'static,
    ) -> Self {
        self.validators.push(Entry {
            name,
            range,
            item: Arc::new(validator),
        });
        self
    }

    /// Keep the entries active for `version`. Two entries of the same name
    /// both covering `version` are a `ConfigurationAmbiguity`.
    pub fn build(self, version: OperatorVersion) -> Result<AdmissionPipeline<K>> {
        Ok(AdmissionPipeline {
            mutators: active(self.mutators, version)?,
            validators: active(self.validators, version)?,
        })
    }
}

fn active<T: ?Sized>(
    entries: Vec<Entry<T>>,
    version: OperatorVersion,
) -> Result<Vec<(&'static str, Arc<T>)>> {
    let mut names = BTreeSet::new();
    let mut active = Vec::new();
    for entry in entries.into_iter().filter(|e| e.range.contains(version)) {
        if !names.insert(entry.name) {
            return Err(Error::ambiguity(format!(
                "admission entry {:?} registered twice for operator version {version}",
                entry.name
            )));
        }
        active.push((entry.name, entry.item));
    }
    Ok(active)
}

/// Mutators and validators of one kind, active for one operator version.
pub struct AdmissionPipeline<K: Resource> {
    mutators: Vec<(&'static str, Arc<dyn Mutator<K>>)>,
    validators: Vec<(&'static str, Arc<dyn Validator<K>>)>,
}

impl<K> AdmissionPipeline<K>
where
    K: Resource + Clone + Serialize + Send + Sync + 'static,
{
    pub fn mutators(&self) -> Vec<&'static str> {
        self.mutators.iter().map(|(name, _)| *name).collect()
    }

    pub fn validators(&self) -> Vec<&'static str> {
        self.validators.iter().map(|(name, _)| *name).collect()
    }

    /// Run every mutator then every validator over `request`. On return
    /// `request.object` holds the mutated object.
    pub async fn admit(&self, request: &mut AdmissionRequest<K>) -> Result<Verdict> {
        let mut patch = None;
        if let Some(mut object) = request.object.clone() {
            let original = serde_json::to_value(&object)?;
            for (name, mutator) in &self.mutators {
                debug!(mutator = name, uid = %request.uid, "running mutator");
                mutator.mutate(request, &mut object).await?;
            }
            let mutated = serde_json::to_value(&object)?;
            let diff = json_patch::diff(&original, &mutated);
            if !diff.0.is_empty() {
                patch = Some(diff);
            }
            request.object = Some(object);
        }

        for (name, validator) in &self.validators {
            debug!(validator = name, uid = %request.uid, "running validator");
            if let Err(failure) = validator.validate(request).await {
                return Ok(Verdict::Denied(failure));
            }
        }
        Ok(Verdict::Allowed { patch })
    }

    /// Review one request for the mutating webhook: the response carries
    /// the mutation patch.
    pub async fn review(&self, request: AdmissionRequest<K>) -> AdmissionResponse {
        self.respond(request, true).await
    }

    /// Review one request for the validating webhook. The object reaching
    /// it was already mutated, so the verdict is returned without a patch.
    pub async fn review_validation(&self, request: AdmissionRequest<K>) -> AdmissionResponse {
        self.respond(request, false).await
    }

    async fn respond(&self, mut request: AdmissionRequest<K>, with_patch: bool) -> AdmissionResponse {
        let response = AdmissionResponse::from(&request);
        match self.admit(&mut request).await {
            Ok(Verdict::Allowed { patch: None }) => response,
            Ok(Verdict::Allowed { patch: Some(_) }) if !with_patch => response,
            Ok(Verdict::Allowed { patch: Some(patch) }) => match response.with_patch(patch) {
                Ok(response) => response,
                Err(e) => {
                    warn!(uid = %request.uid, error = %e, "failed to serialize admission patch");
                    AdmissionResponse::from(&request).deny(format!("patch serialization error: {e}"))
                }
            },
            Ok(Verdict::Denied(failure)) => {
                debug!(uid = %request.uid, reason = %failure.reason, message = %failure.message, "admission denied");
                let mut response = response.deny(failure.message);
                response.result.reason = failure.reason;
                response
            }
            Err(e) => {
                warn!(uid = %request.uid, error = %e, "admission review failed");
                let mut response = response.deny(e.to_string());
                response.result.reason = e.reason().to_string();
                response
            }
        }
    }
}

/// Display name used in messages: "Instance profile" from "instance profile".
pub(crate) fn capitalize(noun: &str) -> String {
    let mut chars = noun.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use kube::core::admission::{AdmissionRequest, AdmissionReview, Operation};
    use kube::Resource;
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use serde_json::json;

    /// Build an admission request the way the API server sends it.
    pub fn request<K>(operation: Operation, object: Option<&K>, old: Option<&K>) -> AdmissionRequest<K>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone,
    {
        let operation = match operation {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Connect => "CONNECT",
        };
        let review: AdmissionReview<K> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": K::group(&()), "version": K::version(&()), "kind": K::kind(&())},
                "resource": {"group": K::group(&()), "version": K::version(&()), "resource": K::plural(&())},
                "name": "pg",
                "namespace": "db",
                "operation": operation,
                "userInfo": {"username": "admin"},
                "object": object,
                "oldObject": old,
                "dryRun": false,
            },
        }))
        .unwrap();
        review.try_into().unwrap()
    }
}
