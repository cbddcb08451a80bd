//! Generated CRD manifests.

use kube::CustomResourceExt;

use pgstack_operator::crd::{all_crds, PgCluster, PgDistributedLogs, GROUP};

#[test]
fn test_every_crd_is_namespaced_in_the_operator_group() {
    let crds = all_crds();
    assert_eq!(crds.len(), 5);
    for crd in &crds {
        assert_eq!(crd.spec.group, GROUP);
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.versions.len(), 1);
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1");
        assert!(version.served && version.storage);
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some(format!("{}.{GROUP}", crd.spec.names.plural).as_str())
        );
    }
}

#[test]
fn test_workload_kinds_expose_status_subresource() {
    for crd in [PgCluster::crd(), PgDistributedLogs::crd()] {
        let version = &crd.spec.versions[0];
        assert!(
            version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some(),
            "{} has no status subresource",
            crd.spec.names.kind
        );
    }
}

#[test]
fn test_cluster_schema_names_its_references() {
    let crd = PgCluster::crd();
    assert_eq!(crd.spec.names.short_names, Some(vec!["pgc".to_string()]));
    let schema = serde_json::to_value(&crd.spec.versions[0].schema).unwrap();
    let spec = &schema["openAPIV3Schema"]["properties"]["spec"]["properties"];
    assert!(spec.get("instanceProfile").is_some());
    assert!(spec.get("distributedLogs").is_some());
    assert_eq!(spec["postgres"]["properties"]["version"]["type"], "string");
}
