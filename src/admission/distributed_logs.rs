//! Admission of `PgDistributedLogs`.

use std::sync::Arc;

use super::validators::{ReferenceValidator, VolumeSizeValidator};
use super::{AdmissionPipeline, PipelineBuilder};
use crate::crd::shared::PersistentVolumeSpec;
use crate::crd::{PgDistributedLogs, PgInstanceProfile};
use crate::error::Result;
use crate::resolver::CustomResourceFinder;
use crate::version::{OperatorVersion, VersionRange};

fn instance_profile(logs: &PgDistributedLogs) -> Option<&str> {
    logs.spec.instance_profile.as_deref()
}

fn persistent_volume(logs: &PgDistributedLogs) -> &PersistentVolumeSpec {
    &logs.spec.persistent_volume
}

pub fn pipeline(
    version: OperatorVersion,
    profiles: Arc<dyn CustomResourceFinder<PgInstanceProfile>>,
) -> Result<AdmissionPipeline<PgDistributedLogs>> {
    PipelineBuilder::new()
        .validator(
            "instance-profile",
            VersionRange::all(),
            ReferenceValidator::new("instance profile", profiles, instance_profile),
        )
        .validator(
            "volume-size",
            VersionRange::all(),
            VolumeSizeValidator::new(persistent_volume),
        )
        .build(version)
}
