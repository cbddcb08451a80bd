//! Admission of `PgInstanceProfile`.

use std::sync::Arc;

use async_trait::async_trait;
use kube::core::admission::{AdmissionRequest, Operation};
use kube::ResourceExt;

use super::{AdmissionPipeline, PipelineBuilder, ValidationFailed, Validator};
use crate::crd::{PgCluster, PgDistributedLogs, PgInstanceProfile};
use crate::error::Result;
use crate::resolver::CustomResourceFinder;
use crate::version::{OperatorVersion, VersionRange};

/// A profile cannot be deleted while a cluster or distributed logs cluster
/// of its namespace still references it.
struct InUseValidator {
    clusters: Arc<dyn CustomResourceFinder<PgCluster>>,
    logs: Arc<dyn CustomResourceFinder<PgDistributedLogs>>,
}

#[async_trait]
impl Validator<PgInstanceProfile> for InUseValidator {
    async fn validate(
        &self,
        request: &AdmissionRequest<PgInstanceProfile>,
    ) -> Result<(), ValidationFailed> {
        if !matches!(request.operation, Operation::Delete) {
            return Ok(());
        }
        let namespace = request.namespace.clone().unwrap_or_default();
        let name = request.name.as_str();

        let mut users: Vec<String> = self
            .clusters
            .list(&namespace)
            .await?
            .into_iter()
            .filter(|c| c.spec.instance_profile == name)
            .map(|c| c.name_any())
            .collect();
        users.extend(
            self.logs
                .list(&namespace)
                .await?
                .into_iter()
                .filter(|l| l.spec.instance_profile.as_deref() == Some(name))
                .map(|l| l.name_any()),
        );
        if users.is_empty() {
            return Ok(());
        }
        Err(ValidationFailed::forbidden_deletion(format!(
            "Can't delete instance profile {name} because it is used by {}",
            users.join(", ")
        )))
    }
}

pub fn pipeline(
    version: OperatorVersion,
    clusters: Arc<dyn CustomResourceFinder<PgCluster>>,
    logs: Arc<dyn CustomResourceFinder<PgDistributedLogs>>,
) -> Result<AdmissionPipeline<PgInstanceProfile>> {
    PipelineBuilder::new()
        .validator(
            "in-use",
            VersionRange::from(OperatorVersion::V1_1),
            InUseValidator { clusters, logs },
        )
        .build(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::testing::request;
    use crate::admission::Verdict;
    use crate::crd::cluster::{PgClusterSpec, PodsSpec};
    use crate::crd::instance_profile::PgInstanceProfileSpec;
    use crate::crd::shared::{PersistentVolumeSpec, PostgresSpec};
    use crate::resolver::StaticFinder;

    fn profile() -> PgInstanceProfile {
        let mut profile = PgInstanceProfile::new(
            "pg",
            PgInstanceProfileSpec {
                cpu: "1".to_string(),
                memory: "1Gi".to_string(),
                containers: Default::default(),
                init_containers: Default::default(),
            },
        );
        profile.metadata.namespace = Some("db".to_string());
        profile
    }

    fn cluster(name: &str, profile: &str) -> PgCluster {
        let mut cluster = PgCluster::new(
            name,
            PgClusterSpec {
                instances: 1,
                postgres: PostgresSpec {
                    version: "16".to_string(),
                    parameters: Default::default(),
                },
                instance_profile: profile.to_string(),
                distributed_logs: None,
                replication: None,
                pods: PodsSpec {
                    persistent_volume: PersistentVolumeSpec {
                        size: "1Gi".to_string(),
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

    #[tokio::test]
    async fn test_profile_in_use_cannot_be_deleted() {
        // The test request names the profile "pg".
        let clusters = StaticFinder::new()
            .with(cluster("orders", "pg"))
            .with(cluster("billing", "other"));
        let pipeline = pipeline(
            OperatorVersion::V1_3,
            Arc::new(clusters),
            Arc::new(StaticFinder::new()),
        )
        .unwrap();

        let mut req = request(Operation::Delete, None, Some(&profile()));
        assert_eq!(
            pipeline.admit(&mut req).await.unwrap(),
            Verdict::Denied(ValidationFailed::forbidden_deletion(
                "Can't delete instance profile pg because it is used by orders"
            ))
        );

        let mut req = request(Operation::Update, Some(&profile()), Some(&profile()));
        assert_eq!(
            pipeline.admit(&mut req).await.unwrap(),
            Verdict::Allowed { patch: None }
        );
    }

    #[test]
    fn test_not_active_before_1_1() {
        let pipeline = pipeline(
            OperatorVersion::V1_0,
            Arc::new(StaticFinder::new()),
            Arc::new(StaticFinder::new()),
        )
        .unwrap();
        assert!(pipeline.validators().is_empty());
    }
}
