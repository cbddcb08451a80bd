//! Admission of `PgShardedCluster`.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::core::admission::AdmissionRequest;

use super::validators::ReferenceValidator;
use super::{AdmissionPipeline, PipelineBuilder, ValidationFailed, Validator};
use crate::crd::sharded_cluster::LAST_RESERVED_SCRIPT_ID;
use crate::crd::{PgInstanceProfile, PgShardedCluster};
use crate::error::Result;
use crate::resolver::CustomResourceFinder;
use crate::version::{OperatorVersion, VersionRange};

/// Managed SQL script ids must be unique and outside the ids the operator
/// reserves for its own scripts.
struct ScriptsValidator;

#[async_trait]
impl Validator<PgShardedCluster> for ScriptsValidator {
    async fn validate(
        &self,
        request: &AdmissionRequest<PgShardedCluster>,
    ) -> Result<(), ValidationFailed> {
        let Some(sharded) = &request.object else {
            return Ok(());
        };
        let Some(managed_sql) = &sharded.spec.shards.managed_sql else {
            return Ok(());
        };
        let ids: Vec<i32> = managed_sql.scripts.iter().filter_map(|s| s.id).collect();
        let unique: BTreeSet<i32> = ids.iter().copied().collect();
        if unique.len() != ids.len() {
            return Err(ValidationFailed::constraint_violation(
                "Script entries must contain unique ids",
            ));
        }
        if ids.iter().any(|id| (0..=LAST_RESERVED_SCRIPT_ID).contains(id)) {
            return Err(ValidationFailed::constraint_violation(format!(
                "Script entries must not use reserved ids from 0 to {LAST_RESERVED_SCRIPT_ID}"
            )));
        }
        Ok(())
    }
}

fn coordinator_profile(sharded: &PgShardedCluster) -> Option<&str> {
    Some(sharded.spec.coordinator.instance_profile.as_str())
}

fn shards_profile(sharded: &PgShardedCluster) -> Option<&str> {
    Some(sharded.spec.shards.instance_profile.as_str())
}

pub fn pipeline(
    version: OperatorVersion,
    profiles: Arc<dyn CustomResourceFinder<PgInstanceProfile>>,
) -> Result<AdmissionPipeline<PgShardedCluster>> {
    PipelineBuilder::new()
        .validator("managed-sql", VersionRange::all(), ScriptsValidator)
        .validator(
            "coordinator-profile",
            VersionRange::all(),
            ReferenceValidator::new("instance profile", profiles.clone(), coordinator_profile),
        )
        .validator(
            "shards-profile",
            VersionRange::all(),
            ReferenceValidator::new("instance profile", profiles, shards_profile),
        )
        .build(version)
}
