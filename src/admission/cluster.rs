//! Admission of `PgCluster`.

use std::sync::Arc;

use async_trait::async_trait;
use kube::core::admission::{AdmissionRequest, Operation};

use super::validators::{ReferenceValidator, VolumeSizeValidator};
use super::{AdmissionPipeline, Mutator, PipelineBuilder, ValidationFailed, Validator};
use crate::crd::cluster::{ReplicationMode, ReplicationRole, ReplicationSpec};
use crate::crd::shared::PersistentVolumeSpec;
use crate::crd::{PgCluster, PgDistributedLogs, PgInstanceProfile};
use crate::error::Result;
use crate::helpers::VERSION_ANNOTATION;
use crate::resolver::CustomResourceFinder;
use crate::version::{OperatorVersion, VersionRange};

// ── Mutators ──────────────────────────────────────────────────────────────────

/// Fills in the replication defaults: `async` mode, `ha-read` role.
struct ReplicationDefaults;

#[async_trait]
impl Mutator<PgCluster> for ReplicationDefaults {
    async fn mutate(&self, _request: &AdmissionRequest<PgCluster>, cluster: &mut PgCluster) -> Result<()> {
        let replication = cluster
            .spec
            .replication
            .get_or_insert_with(ReplicationSpec::default);
        replication.mode.get_or_insert(ReplicationMode::Async);
        replication.role.get_or_insert(ReplicationRole::HaRead);
        Ok(())
    }
}

/// Records the operator version a cluster was created with.
struct CreationVersion(OperatorVersion);

#[async_trait]
impl Mutator<PgCluster> for CreationVersion {
    async fn mutate(&self, request: &AdmissionRequest<PgCluster>, cluster: &mut PgCluster) -> Result<()> {
        if matches!(request.operation, Operation::Create) {
            cluster
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(VERSION_ANNOTATION.to_string(), self.0.to_string());
        }
        Ok(())
    }
}

// ── Validators ────────────────────────────────────────────────────────────────

struct ReplicationValidator;

#[async_trait]
impl Validator<PgCluster> for ReplicationValidator {
    async fn validate(&self, request: &AdmissionRequest<PgCluster>) -> Result<(), ValidationFailed> {
        let Some(cluster) = &request.object else {
            return Ok(());
        };
        if !cluster.replication_mode().is_synchronous() {
            return Ok(());
        }
        let sync_instances = cluster.spec.replication.as_ref().and_then(|r| r.sync_instances);
        let Some(sync_instances) = sync_instances else {
            return Err(ValidationFailed::constraint_violation(
                "syncInstances must be set when mode is sync or strict-sync",
            ));
        };
        if sync_instances < 1 {
            return Err(ValidationFailed::constraint_violation(
                "syncInstances must be greater than zero",
            ));
        }
        let max = cluster.spec.instances - 1;
        if sync_instances > max {
            return Err(ValidationFailed::constraint_violation(format!(
                "Maximum syncInstances allowed is {max}"
            )));
        }
        Ok(())
    }
}

/// The Postgres version of an existing cluster is fixed; moving it is a
/// major version upgrade.
struct PostgresVersionValidator;

#[async_trait]
impl Validator<PgCluster> for PostgresVersionValidator {
    async fn validate(&self, request: &AdmissionRequest<PgCluster>) -> Result<(), ValidationFailed> {
        let (Some(old), Some(new)) = (&request.old_object, &request.object) else {
            return Ok(());
        };
        let (old, new) = (&old.spec.postgres.version, &new.spec.postgres.version);
        if matches!(request.operation, Operation::Update) && old != new {
            return Err(ValidationFailed::forbidden_update(format!(
                "postgres version can not be changed from {old} to {new}"
            )));
        }
        Ok(())
    }
}

fn instance_profile(cluster: &PgCluster) -> Option<&str> {
    Some(cluster.spec.instance_profile.as_str())
}

fn distributed_logs(cluster: &PgCluster) -> Option<&str> {
    cluster.spec.distributed_logs.as_deref()
}

fn persistent_volume(cluster: &PgCluster) -> &PersistentVolumeSpec {
    &cluster.spec.pods.persistent_volume
}

/// The `PgCluster` admission pipeline active for `version`.
pub fn pipeline(
    version: OperatorVersion,
    profiles: Arc<dyn CustomResourceFinder<PgInstanceProfile>>,
    logs: Arc<dyn CustomResourceFinder<PgDistributedLogs>>,
) -> Result<AdmissionPipeline<PgCluster>> {
    PipelineBuilder::new()
        .mutator("replication-defaults", VersionRange::all(), ReplicationDefaults)
        .mutator("creation-version", VersionRange::all(), CreationVersion(version))
        .validator(
            "instance-profile",
            VersionRange::all(),
            ReferenceValidator::new("instance profile", profiles, instance_profile),
        )
        .validator("replication", VersionRange::all(), ReplicationValidator)
        .validator(
            "distributed-logs",
            VersionRange::all(),
            ReferenceValidator::new("distributed logs", logs, distributed_logs),
        )
        .validator("postgres-version", VersionRange::all(), PostgresVersionValidator)
        .validator(
            "volume-size",
            VersionRange::all(),
            VolumeSizeValidator::new(persistent_volume),
        )
        .build(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::testing::request;
    use crate::admission::{Verdict, CONSTRAINT_VIOLATION, FORBIDDEN_CR_UPDATE, INVALID_CR_REFERENCE};
    use crate::crd::cluster::{PgClusterSpec, PodsSpec};
    use crate::crd::instance_profile::PgInstanceProfileSpec;
    use crate::crd::shared::PostgresSpec;
    use crate::resolver::StaticFinder;

    fn cluster(profile: &str) -> PgCluster {
        let mut cluster = PgCluster::new(
            "pg",
            PgClusterSpec {
                instances: 3,
                postgres: PostgresSpec {
                    version: "16".to_string(),
                    parameters: Default::default(),
                },
                instance_profile: profile.to_string(),
                distributed_logs: None,
                replication: None,
                pods: PodsSpec {
                    persistent_volume: PersistentVolumeSpec {
                        size: "10Gi".to_string(),
                        storage_class: None,
                    },
                },
                resources: None,
                non_production_options: None,
            },
        );
        cluster.metadata.namespace = Some("db".to_string());
        cluster
    }

    fn pipeline() -> AdmissionPipeline<PgCluster> {
        let mut profile = PgInstanceProfile::new(
            "size-s",
            PgInstanceProfileSpec {
                cpu: "1".to_string(),
                memory: "1Gi".to_string(),
                containers: Default::default(),
                init_containers: Default::default(),
            },
        );
        profile.metadata.namespace = Some("db".to_string());
        super::pipeline(
            OperatorVersion::V1_3,
            Arc::new(StaticFinder::new().with(profile)),
            Arc::new(StaticFinder::new()),
        )
        .unwrap()
    }

    async fn denied(mut req: AdmissionRequest<PgCluster>) -> ValidationFailed {
        match pipeline().admit(&mut req).await.unwrap() {
            Verdict::Denied(failure) => failure,
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_applies_defaults_and_version() {
        let mut req = request(Operation::Create, Some(&cluster("size-s")), None);
        let verdict = pipeline().admit(&mut req).await.unwrap();
        assert!(matches!(verdict, Verdict::Allowed { patch: Some(_) }));
        let mutated = req.object.unwrap();
        assert_eq!(mutated.replication_mode(), ReplicationMode::Async);
        assert_eq!(
            mutated.spec.replication.unwrap().role,
            Some(ReplicationRole::HaRead)
        );
        assert_eq!(mutated.metadata.annotations.unwrap()[VERSION_ANNOTATION], "1.3");
    }

    #[tokio::test]
    async fn test_missing_profile_messages() {
        let created = denied(request(Operation::Create, Some(&cluster("size-xl")), None)).await;
        assert_eq!(created.reason, INVALID_CR_REFERENCE);
        assert_eq!(created.message, "Instance profile size-xl not found");

        let updated = denied(request(
            Operation::Update,
            Some(&cluster("size-xl")),
            Some(&cluster("size-s")),
        ))
        .await;
        assert_eq!(
            updated.message,
            "Cannot update to instance profile size-xl because it doesn't exists"
        );
    }

    #[tokio::test]
    async fn test_delete_skips_reference_checks() {
        let mut req = request(Operation::Delete, None, Some(&cluster("size-xl")));
        let verdict = pipeline().admit(&mut req).await.unwrap();
        assert_eq!(verdict, Verdict::Allowed { patch: None });
    }

    #[tokio::test]
    async fn test_sync_replication_needs_sync_instances() {
        let mut sync = cluster("size-s");
        sync.spec.replication = Some(ReplicationSpec {
            mode: Some(ReplicationMode::Sync),
            ..Default::default()
        });
        let failure = denied(request(Operation::Create, Some(&sync), None)).await;
        assert_eq!(failure.reason, CONSTRAINT_VIOLATION);
        assert_eq!(
            failure.message,
            "syncInstances must be set when mode is sync or strict-sync"
        );

        sync.spec.replication.as_mut().unwrap().sync_instances = Some(3);
        let failure = denied(request(Operation::Create, Some(&sync), None)).await;
        assert_eq!(failure.message, "Maximum syncInstances allowed is 2");
    }

    #[tokio::test]
    async fn test_update_restrictions() {
        let old = cluster("size-s");
        let mut new = cluster("size-s");
        new.spec.postgres.version = "17".to_string();
        let failure = denied(request(Operation::Update, Some(&new), Some(&old))).await;
        assert_eq!(failure.reason, FORBIDDEN_CR_UPDATE);

        let mut new = cluster("size-s");
        new.spec.pods.persistent_volume.size = "5Gi".to_string();
        let failure = denied(request(Operation::Update, Some(&new), Some(&old))).await;
        assert_eq!(
            failure.message,
            "Persistent volume size can not be decreased from 10Gi to 5Gi"
        );
    }

    #[tokio::test]
    async fn test_volume_size_must_be_positive() {
        for size in ["0", "banana"] {
            let mut pg = cluster("size-s");
            pg.spec.pods.persistent_volume.size = size.to_string();
            let failure = denied(request(Operation::Create, Some(&pg), None)).await;
            assert_eq!(failure.reason, CONSTRAINT_VIOLATION, "size {size}");
        }

        let mut new = cluster("size-s");
        new.spec.pods.persistent_volume.size = "lots".to_string();
        let failure = denied(request(Operation::Update, Some(&new), Some(&cluster("size-s")))).await;
        assert_eq!(failure.reason, CONSTRAINT_VIOLATION);
        assert!(failure.message.starts_with("Invalid persistent volume size \"lots\""));
    }
}
