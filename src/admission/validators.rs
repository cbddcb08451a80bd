//! Validators shared by several kinds.

use std::sync::Arc;

use async_trait::async_trait;
use kube::core::admission::{AdmissionRequest, Operation};
use kube::{Resource, ResourceExt};

use super::{capitalize, ValidationFailed, Validator};
use crate::crd::shared::PersistentVolumeSpec;
use crate::resolver::CustomResourceFinder;

/// Checks that the custom resource named by a field exists in the request
/// namespace. DELETE requests and unset references pass.
pub struct ReferenceValidator<K, R>
where
    R: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    noun: &'static str,
    finder: Arc<dyn CustomResourceFinder<R>>,
    reference: fn(&K) -> Option<&str>,
}

impl<K, R> ReferenceValidator<K, R>
where
    R: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    /// `noun` is the lower-case display name of the referenced kind.
    pub fn new(
        noun: &'static str,
        finder: Arc<dyn CustomResourceFinder<R>>,
        reference: fn(&K) -> Option<&str>,
    ) -> Self {
        Self {
            noun,
            finder,
            reference,
        }
    }
}

#[async_trait]
impl<K, R> Validator<K> for ReferenceValidator<K, R>
where
    K: Resource + Send + Sync,
    R: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    async fn validate(&self, request: &AdmissionRequest<K>) -> Result<(), ValidationFailed> {
        if matches!(request.operation, Operation::Delete) {
            return Ok(());
        }
        let Some(object) = &request.object else {
            return Ok(());
        };
        let Some(name) = (self.reference)(object) else {
            return Ok(());
        };
        let namespace = request
            .namespace
            .clone()
            .or_else(|| object.namespace())
            .unwrap_or_default();
        if self.finder.find(&namespace, name).await?.is_some() {
            return Ok(());
        }
        let message = match request.operation {
            Operation::Update => format!(
                "Cannot update to {} {name} because it doesn't exists",
                self.noun
            ),
            _ => format!("{} {name} not found", capitalize(self.noun)),
        };
        Err(ValidationFailed::invalid_reference(message))
    }
}

/// Requires a positive persistent volume size and rejects updates that
/// shrink it: claims cannot shrink.
pub struct VolumeSizeValidator<K> {
    volume: fn(&K) -> &PersistentVolumeSpec,
}

impl<K> VolumeSizeValidator<K> {
    pub fn new(volume: fn(&K) -> &PersistentVolumeSpec) -> Self {
        Self { volume }
    }
}

#[async_trait]
impl<K> Validator<K> for VolumeSizeValidator<K>
where
    K: Resource + Send + Sync,
{
    async fn validate(&self, request: &AdmissionRequest<K>) -> Result<(), ValidationFailed> {
        if !matches!(request.operation, Operation::Create | Operation::Update) {
            return Ok(());
        }
        let Some(new) = &request.object else {
            return Ok(());
        };
        let new_size = &(self.volume)(new).size;
        let new_bytes = positive_quantity(new_size).map_err(ValidationFailed::constraint_violation)?;

        let (Operation::Update, Some(old)) = (&request.operation, &request.old_object) else {
            return Ok(());
        };
        let old_size = &(self.volume)(old).size;
        // A stored size that no longer parses cannot be compared against.
        let Ok(old_bytes) = parse_quantity(old_size) else {
            return Ok(());
        };
        if new_bytes < old_bytes {
            return Err(ValidationFailed::forbidden_update(format!(
                "Persistent volume size can not be decreased from {old_size} to {new_size}"
            )));
        }
        Ok(())
    }
}

/// Parse `size` and require it to be greater than zero.
fn positive_quantity(size: &str) -> Result<u64, String> {
    match parse_quantity(size) {
        Ok(0) => Err(format!("Persistent volume size {size} must be greater than zero")),
        Ok(bytes) => Ok(bytes),
        Err(e) => Err(format!("Invalid persistent volume size {size:?}: {e}")),
    }
}

/// Parse a Kubernetes resource quantity string into bytes.
/// Supports: Ki, Mi, Gi, Ti (binary) and k, M, G, T (decimal).
fn parse_quantity(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty quantity".to_string());
    }

    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num_str, suffix) = s.split_at(num_end);

    let num: f64 = num_str
        .parse()
        .map_err(|e| format!("invalid number {num_str:?}: {e}"))?;

    let multiplier: u64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        other => return Err(format!("unknown suffix {other:?}")),
    };

    Ok((num * multiplier as f64) as u64)
}
