//! Reconcile cycles of the cluster controller against the in-memory store.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::DynamicObject;
use serde_json::{json, Value};

use pgstack_operator::conciliation::merge::COORDINATION_CONFIG_ANNOTATION;
use pgstack_operator::conciliation::PAUSE_ANNOTATION;
use pgstack_operator::crd::shared::{WorkloadStatus, CONDITION_PENDING_RESTART};
use pgstack_operator::crd::PgCluster;
use pgstack_operator::error::Error;
use pgstack_operator::labels;
use pgstack_operator::store::{InMemoryObjectStore, ObjectKey, ObjectStore};
use pgstack_operator::version::OperatorVersion;

use common::{cluster, cluster_conciliator, NAMESPACE};

fn key(kind: &str, name: &str) -> ObjectKey {
    ObjectKey::new(kind, Some(NAMESPACE), name)
}

async fn fetch(store: &InMemoryObjectStore, kind: &str, name: &str) -> DynamicObject {
    store
        .get(&key(kind, name))
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("{kind} {name} missing"))
}

fn document(endpoints: &DynamicObject) -> Value {
    let raw = &endpoints.metadata.annotations.as_ref().unwrap()[COORDINATION_CONFIG_ANNOTATION];
    serde_json::from_str(raw).unwrap()
}

fn pending_restart(cluster: &mut PgCluster) {
    cluster.status = Some(WorkloadStatus {
        conditions: vec![Condition {
            type_: CONDITION_PENDING_RESTART.to_string(),
            status: "True".to_string(),
            reason: "ParametersChanged".to_string(),
            message: String::new(),
            observed_generation: None,
            last_transition_time: Time(chrono::Utc::now()),
        }],
        operator_version: None,
    });
}

fn service(name: &str, labels: BTreeMap<String, String>) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": name, "namespace": NAMESPACE, "labels": labels},
        "spec": {"ports": [{"port": 5432}]},
    }))
    .unwrap()
}

#[tokio::test]
async fn test_second_cycle_writes_nothing() {
    let store = Arc::new(InMemoryObjectStore::new());
    let conciliator = cluster_conciliator(store.clone(), OperatorVersion::V1_3);
    let pg = cluster("pg");

    let first = conciliator.reconcile(&pg).await.unwrap();
    assert!(first.created > 0);
    assert_eq!(first.created, store.len());
    assert_eq!((first.patched, first.deleted), (0, 0));

    let before = store.snapshot();
    let second = conciliator.reconcile(&pg).await.unwrap();
    assert!(second.up_to_date);
    assert_eq!(
        (second.created, second.patched, second.deleted, second.deferred),
        (0, 0, 0, 0)
    );
    assert_eq!(store.snapshot(), before);
}

#[tokio::test]
async fn test_every_generated_object_is_owned() {
    let store = Arc::new(InMemoryObjectStore::new());
    let conciliator = cluster_conciliator(store.clone(), OperatorVersion::V1_3);
    let pg = cluster("pg");
    conciliator.reconcile(&pg).await.unwrap();

    let ownership = labels::ownership_labels(&pg);
    for object in store.snapshot() {
        assert!(
            labels::matches(object.metadata.labels.as_ref(), &ownership),
            "{} lacks ownership labels",
            ObjectKey::of(&object)
        );
        let owner = &object.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.uid, "uid-pg");
    }
}

#[tokio::test]
async fn test_credentials_survive_spec_changes() {
    let store = Arc::new(InMemoryObjectStore::new());
    let conciliator = cluster_conciliator(store.clone(), OperatorVersion::V1_3);
    let mut pg = cluster("pg");
    conciliator.reconcile(&pg).await.unwrap();
    let credentials = fetch(&store, "Secret", "pg").await.data["data"].clone();

    pg.spec.instances = 3;
    pg.spec
        .postgres
        .parameters
        .insert("work_mem".to_string(), "16MB".to_string());
    let outcome = conciliator.reconcile(&pg).await.unwrap();
    assert!(outcome.patched > 0);

    let secret = fetch(&store, "Secret", "pg").await;
    assert_eq!(secret.data["data"], credentials);
}

#[tokio::test]
async fn test_agent_state_survives_configuration_update() {
    let store = Arc::new(InMemoryObjectStore::new());
    let conciliator = cluster_conciliator(store.clone(), OperatorVersion::V1_3);
    let mut pg = cluster("pg");
    conciliator.reconcile(&pg).await.unwrap();

    // The agent records its leader and extends the document.
    let mut endpoints = fetch(&store, "Endpoints", "pg-config").await;
    let mut doc = document(&endpoints);
    doc["slots"] = json!({"logical_a": {"type": "logical"}});
    let annotations = endpoints.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert("leader".to_string(), "pg-0".to_string());
    annotations.insert(
        COORDINATION_CONFIG_ANNOTATION.to_string(),
        serde_json::to_string(&doc).unwrap(),
    );
    store.put(endpoints);

    let idle = conciliator.reconcile(&pg).await.unwrap();
    assert!(idle.up_to_date);
    assert_eq!(idle.patched, 0);

    pg.spec
        .postgres
        .parameters
        .insert("work_mem".to_string(), "16MB".to_string());
    let outcome = conciliator.reconcile(&pg).await.unwrap();
    assert_eq!(outcome.patched, 1);

    let endpoints = fetch(&store, "Endpoints", "pg-config").await;
    assert_eq!(endpoints.metadata.annotations.as_ref().unwrap()["leader"], "pg-0");
    let doc = document(&endpoints);
    assert_eq!(doc["slots"]["logical_a"]["type"], "logical");
    assert_eq!(doc["postgresql"]["parameters"]["work_mem"], "16MB");
    assert_eq!(doc["postgresql"]["parameters"]["wal_level"], "logical");
}

#[tokio::test]
async fn test_agent_scope_label_does_not_force_patches() {
    let store = Arc::new(InMemoryObjectStore::new());
    let conciliator = cluster_conciliator(store.clone(), OperatorVersion::V1_3);
    let pg = cluster("pg");
    conciliator.reconcile(&pg).await.unwrap();

    let mut endpoints = fetch(&store, "Endpoints", "pg-config").await;
    endpoints
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels::scope_labels("pg"));
    store.put(endpoints);

    for _ in 0..3 {
        let outcome = conciliator.reconcile(&pg).await.unwrap();
        assert!(outcome.up_to_date);
        assert_eq!(outcome.patched, 0);
    }
    let endpoints = fetch(&store, "Endpoints", "pg-config").await;
    assert_eq!(
        endpoints.metadata.labels.as_ref().unwrap()[labels::SCOPE_KEY],
        "pg"
    );
}

#[tokio::test]
async fn test_paused_orphan_is_kept_until_restart() {
    let store = Arc::new(InMemoryObjectStore::new());
    let conciliator = cluster_conciliator(store.clone(), OperatorVersion::V1_3);
    let mut pg = cluster("pg");
    conciliator.reconcile(&pg).await.unwrap();

    let mut stale = service("pg-stale", labels::ownership_labels(&pg));
    stale.metadata.annotations = Some(BTreeMap::from([(
        PAUSE_ANNOTATION.to_string(),
        "true".to_string(),
    )]));
    store.put(stale);

    pending_restart(&mut pg);
    let plan = conciliator.evaluate(&pg).await.unwrap();
    assert!(plan.deletions.is_empty());
    assert!(plan.is_up_to_date());

    pg.status = None;
    let plan = conciliator.evaluate(&pg).await.unwrap();
    assert_eq!(plan.deletions.len(), 1);
    assert!(!plan.is_up_to_date());
}

#[tokio::test]
async fn test_paused_objects_wait_for_restart_but_creations_do_not() {
    let store = Arc::new(InMemoryObjectStore::new());
    let conciliator = cluster_conciliator(store.clone(), OperatorVersion::V1_3);
    let mut pg = cluster("pg");
    conciliator.reconcile(&pg).await.unwrap();

    let mut endpoints = fetch(&store, "Endpoints", "pg-config").await;
    endpoints
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(PAUSE_ANNOTATION.to_string(), "true".to_string());
    store.put(endpoints);
    store.delete(&key("Secret", "pg")).await.unwrap();
    pg.spec
        .postgres
        .parameters
        .insert("work_mem".to_string(), "16MB".to_string());

    pending_restart(&mut pg);
    let plan = conciliator.evaluate(&pg).await.unwrap();
    assert!(plan.patches.is_empty());
    assert!(plan.is_up_to_date());
    assert_eq!(plan.creations.len(), 1);
    assert_eq!(plan.creations[0].metadata.name.as_deref(), Some("pg"));

    pg.status = None;
    let plan = conciliator.evaluate(&pg).await.unwrap();
    assert_eq!(plan.patches.len(), 1);
    assert_eq!(
        ObjectKey::of(&plan.patches[0].1),
        key("Endpoints", "pg-config")
    );
}

#[tokio::test]
async fn test_orphans_are_deleted_and_foreign_objects_left_alone() {
    let store = Arc::new(InMemoryObjectStore::new());
    let conciliator = cluster_conciliator(store.clone(), OperatorVersion::V1_3);
    let pg = cluster("pg");
    conciliator.reconcile(&pg).await.unwrap();

    store.put(service("pg-stale", labels::ownership_labels(&pg)));
    store.put(service("pg-foreign", BTreeMap::new()));

    let outcome = conciliator.reconcile(&pg).await.unwrap();
    assert_eq!(outcome.deleted, 1);
    assert!(!outcome.up_to_date);
    assert!(store.get(&key("Service", "pg-stale")).await.unwrap().is_none());
    assert!(store.get(&key("Service", "pg-foreign")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_clusters_do_not_see_each_others_objects() {
    let store = Arc::new(InMemoryObjectStore::new());
    let conciliator = cluster_conciliator(store.clone(), OperatorVersion::V1_3);
    let first = conciliator.reconcile(&cluster("pg")).await.unwrap();
    let second = conciliator.reconcile(&cluster("other")).await.unwrap();

    assert_eq!(first.created, second.created);
    assert_eq!(second.deleted, 0);
    assert_eq!(store.len(), first.created * 2);
}

#[tokio::test]
async fn test_missing_profile_fails_before_any_write() {
    let store = Arc::new(InMemoryObjectStore::new());
    let conciliator = cluster_conciliator(store.clone(), OperatorVersion::V1_3);
    let mut pg = cluster("pg");
    pg.spec.instance_profile = "size-xl".to_string();

    let err = conciliator.reconcile(&pg).await.unwrap_err();
    assert!(matches!(err, Error::ReferenceNotFound { .. }), "{err}");
    assert!(store.is_empty());
}
