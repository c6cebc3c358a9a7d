use crate::support::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use weaver::weaver::api::types::{BundleConditionType, ConditionStatus};
use weaver::weaver::controller::error::SyncError;
use weaver::weaver::controller::ready::{ReadyChecker, ReadyError};
use weaver::weaver::controller::worker::{BundleKey, BundleReconciler, WorkerPool};
use weaver::weaver::k8s::client::ApiError;
use weaver::weaver::k8s::dynamic::DynamicObject;
use weaver::weaver::k8s::memory::{MemoryCluster, Verb};

fn two_resource_chain() -> Vec<weaver::weaver::api::types::Resource> {
    vec![
        resource("db", &[], config_map("db", json!({"host": "db.internal"}))),
        resource(
            "app",
            &["db"],
            deployment("app", "{{db:data/host}}"),
        ),
    ]
}

#[tokio::test]
async fn chain_creates_resources_in_dependency_order() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(two_resource_chain());
    cluster.put_bundle(bundle.clone());

    run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect("pass succeeds");

    let creates = cluster.calls_with_verb(Verb::Create);
    assert_eq!(creates.len(), 2);
    assert_eq!(creates[0].name, "db", "dependency must be created first");
    assert_eq!(creates[1].name, "app");

    // The reference against the observed dependency must be resolved in the
    // created object.
    let app = cluster
        .object(&deployment_gvk(), NAMESPACE, "app")
        .expect("app was created");
    assert_eq!(
        app.path("spec/template/spec/containers/0/env/0/value"),
        Some(&json!("db.internal"))
    );

    let stored = cluster.bundle(NAMESPACE, BUNDLE_NAME).expect("bundle exists");
    assert_condition(&stored, BundleConditionType::Ready, ConditionStatus::True, None);
    assert_condition(
        &stored,
        BundleConditionType::InProgress,
        ConditionStatus::False,
        None,
    );
    assert_condition(&stored, BundleConditionType::Error, ConditionStatus::False, None);
}

#[tokio::test]
async fn children_carry_ownership_and_the_bundle_label() {
    let cluster = MemoryCluster::new();
    let mut bundle = bundle(two_resource_chain());
    bundle
        .metadata
        .labels
        .insert("team".to_string(), "payments".to_string());
    cluster.put_bundle(bundle.clone());
    let controller_ref = bundle.controller_owner_ref();

    run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect("pass succeeds");

    let app = cluster
        .object(&deployment_gvk(), NAMESPACE, "app")
        .expect("app was created");
    assert_eq!(app.labels().get("bundleName").map(String::as_str), Some(BUNDLE_NAME));
    assert_eq!(
        app.labels().get("team").map(String::as_str),
        Some("payments"),
        "bundle labels propagate to children"
    );

    let owners = app.owner_references();
    assert_eq!(owners.len(), 2);
    let controller = app.controller_owner().expect("controller owner present");
    assert_eq!(controller.key(), controller_ref.key());
    let dependency = owners
        .iter()
        .find(|owner| !owner.is_controller())
        .expect("dependency owner present");
    assert_eq!(dependency.kind, "ConfigMap");
    assert_eq!(dependency.name, "db");
    assert_eq!(dependency.block_owner_deletion, Some(true));
}

#[tokio::test]
async fn unready_dependency_skips_dependents() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(two_resource_chain());
    cluster.put_bundle(bundle.clone());

    let mut checker = ReadyChecker::new();
    checker.register(
        "",
        "ConfigMap",
        Arc::new(|_: &DynamicObject| -> Result<bool, ReadyError> { Ok(false) }),
    );

    run_pass(&cluster, bundle, checker)
        .await
        .expect("pass succeeds even while converging");

    // The dependency was applied, the dependent never touched.
    assert_eq!(cluster.calls_with_verb(Verb::Create).len(), 1);
    assert!(cluster
        .calls()
        .iter()
        .all(|call| call.gvk != deployment_gvk()));

    let stored = cluster.bundle(NAMESPACE, BUNDLE_NAME).expect("bundle exists");
    assert_condition(
        &stored,
        BundleConditionType::InProgress,
        ConditionStatus::True,
        None,
    );
    assert_condition(&stored, BundleConditionType::Ready, ConditionStatus::False, None);
    assert_condition(&stored, BundleConditionType::Error, ConditionStatus::False, None);
}

#[tokio::test]
async fn second_pass_over_converged_bundle_writes_nothing() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(two_resource_chain());
    cluster.put_bundle(bundle.clone());

    run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect("first pass succeeds");

    let converged = cluster.bundle(NAMESPACE, BUNDLE_NAME).expect("bundle exists");
    cluster.clear_calls();

    run_pass(&cluster, converged, ReadyChecker::new())
        .await
        .expect("second pass succeeds");

    assert!(cluster.calls_with_verb(Verb::Create).is_empty());
    assert!(cluster.calls_with_verb(Verb::Update).is_empty());
    assert!(cluster.calls_with_verb(Verb::Delete).is_empty());
    assert!(
        cluster.calls_with_verb(Verb::BundleUpdate).is_empty(),
        "an unchanged status must not be written back"
    );
}

#[tokio::test]
async fn foreign_controller_owner_is_a_terminal_error() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(vec![resource(
        "db",
        &[],
        config_map("db", json!({"host": "db.internal"})),
    )]);
    cluster.put_bundle(bundle.clone());

    // An object with the same coordinates already exists and belongs to
    // someone else.
    let mut foreign = config_map("db", json!({"host": "theirs"}));
    foreign.set_owner_references(vec![weaver::weaver::k8s::dynamic::OwnerReference {
        api_version: "example.io/v1".to_string(),
        kind: "Widget".to_string(),
        name: "intruder".to_string(),
        uid: "intruder-uid".to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    foreign.set_uid("foreign-uid");
    foreign.set_resource_version("1");
    cluster.seed_object(NAMESPACE, foreign);

    let failure = run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect_err("pass must fail");
    assert!(!failure.retriable);
    assert!(matches!(failure.error, SyncError::NotOwned { .. }));

    assert!(cluster.calls_with_verb(Verb::Update).is_empty());
    assert!(cluster.calls_with_verb(Verb::Delete).is_empty());
    let untouched = cluster
        .object(&config_map_gvk(), NAMESPACE, "db")
        .expect("foreign object survives");
    assert_eq!(untouched.path("data/host"), Some(&json!("theirs")));

    let stored = cluster.bundle(NAMESPACE, BUNDLE_NAME).expect("bundle exists");
    assert_condition(
        &stored,
        BundleConditionType::Error,
        ConditionStatus::True,
        Some("TerminalError"),
    );
    assert_condition(
        &stored,
        BundleConditionType::InProgress,
        ConditionStatus::False,
        None,
    );
}

#[tokio::test]
async fn declared_foreign_controller_reference_is_rejected() {
    let cluster = MemoryCluster::new();
    let mut spec = config_map("db", json!({}));
    spec.set_owner_references(vec![weaver::weaver::k8s::dynamic::OwnerReference {
        api_version: "example.io/v1".to_string(),
        kind: "Widget".to_string(),
        name: "intruder".to_string(),
        uid: "intruder-uid".to_string(),
        controller: Some(true),
        block_owner_deletion: None,
    }]);
    let bundle = bundle(vec![resource("db", &[], spec)]);
    cluster.put_bundle(bundle.clone());

    let failure = run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect_err("a declared foreign controller must fail");
    assert!(!failure.retriable);
    assert!(matches!(failure.error, SyncError::ForeignController { .. }));
    assert!(cluster.calls_with_verb(Verb::Create).is_empty());
}

#[tokio::test]
async fn create_race_reprocesses_without_status_change() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(vec![resource(
        "db",
        &[],
        config_map("db", json!({"host": "db.internal"})),
    )]);
    cluster.put_bundle(bundle.clone());

    // The object exists on the server but the store has not caught up, so
    // the pass tries to create and collides.
    let mut racing = config_map("db", json!({"host": "db.internal"}));
    racing.set_uid("racer-uid");
    racing.set_resource_version("1");
    cluster.seed_object(NAMESPACE, racing);
    cluster.hide_from_store(&config_map_gvk(), NAMESPACE, "db");

    let failure = run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect_err("pass must report the race");
    assert!(!failure.retriable);
    assert!(failure.error.is_conflict());
    assert!(
        cluster.calls_with_verb(Verb::BundleUpdate).is_empty(),
        "conflicts must not disturb the recorded status"
    );
}

#[tokio::test]
async fn cycle_fails_terminally_before_any_write() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(vec![
        resource("a", &["b"], config_map("a", json!({}))),
        resource("b", &["a"], config_map("b", json!({}))),
    ]);
    cluster.put_bundle(bundle.clone());

    let failure = run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect_err("cycle must fail");
    assert!(!failure.retriable);
    assert!(matches!(failure.error, SyncError::Graph(_)));

    assert!(cluster.calls_with_verb(Verb::Create).is_empty());
    assert!(cluster.calls_with_verb(Verb::Update).is_empty());
    assert!(cluster.calls_with_verb(Verb::Delete).is_empty());
    assert_eq!(
        cluster.calls_with_verb(Verb::BundleUpdate).len(),
        1,
        "exactly one status update records the terminal error"
    );

    let stored = cluster.bundle(NAMESPACE, BUNDLE_NAME).expect("bundle exists");
    assert_condition(
        &stored,
        BundleConditionType::Error,
        ConditionStatus::True,
        Some("TerminalError"),
    );
}

#[tokio::test]
async fn duplicate_resource_names_fail_terminally() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(vec![
        resource("db", &[], config_map("db", json!({}))),
        resource("db", &[], config_map("db-two", json!({}))),
    ]);
    cluster.put_bundle(bundle.clone());

    let failure = run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect_err("duplicate names must fail");
    assert!(!failure.retriable);
    assert!(matches!(failure.error, SyncError::DuplicateResource(_)));
    assert!(cluster.calls_with_verb(Verb::Create).is_empty());
}

#[tokio::test]
async fn transport_errors_are_retriable() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(vec![resource(
        "db",
        &[],
        config_map("db", json!({})),
    )]);
    cluster.put_bundle(bundle.clone());
    cluster.queue_error(Verb::Create, ApiError::server("the server choked"));

    let failure = run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect_err("server error must surface");
    assert!(failure.retriable);

    let stored = cluster.bundle(NAMESPACE, BUNDLE_NAME).expect("bundle exists");
    assert_condition(
        &stored,
        BundleConditionType::Error,
        ConditionStatus::True,
        Some("RetriableError"),
    );
    assert_condition(
        &stored,
        BundleConditionType::InProgress,
        ConditionStatus::True,
        None,
    );
}

#[tokio::test]
async fn cancellation_skips_the_status_write() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(vec![resource(
        "db",
        &[],
        config_map("db", json!({})),
    )]);
    cluster.put_bundle(bundle.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let failure = run_pass_with_cancel(&cluster, bundle, ReadyChecker::new(), cancel)
        .await
        .expect_err("cancelled pass must fail");
    assert!(!failure.retriable);
    assert!(failure.error.is_cancelled());
    assert!(cluster.calls_with_verb(Verb::BundleUpdate).is_empty());
}

#[tokio::test]
async fn status_write_conflicts_are_swallowed() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(vec![resource(
        "db",
        &[],
        config_map("db", json!({})),
    )]);
    cluster.put_bundle(bundle.clone());
    cluster.queue_error(Verb::BundleUpdate, ApiError::conflict("concurrent update"));

    run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect("a conflicting status write must not fail the pass");
}

#[tokio::test]
async fn failed_status_write_overrides_a_successful_pass() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(vec![resource(
        "db",
        &[],
        config_map("db", json!({})),
    )]);
    cluster.put_bundle(bundle.clone());
    cluster.queue_error(Verb::BundleUpdate, ApiError::server("etcd is down"));

    let failure = run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect_err("the failed status write must surface");
    assert!(failure.retriable);
}

#[tokio::test]
async fn worker_pool_drives_a_bundle_to_ready() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(two_resource_chain());
    cluster.put_bundle(bundle.clone());

    let reconciler = Arc::new(BundleReconciler::new(
        Arc::new(cluster.clone()),
        Arc::new(cluster.clone()),
        Arc::new(cluster.clone()),
        Arc::new(ReadyChecker::new()),
    ));
    let pool = WorkerPool::new(reconciler, 2, CancellationToken::new());
    pool.enqueue(BundleKey::new(NAMESPACE, BUNDLE_NAME));

    let mut ready = false;
    for _ in 0..100 {
        if let Some(stored) = cluster.bundle(NAMESPACE, BUNDLE_NAME) {
            if stored
                .condition(BundleConditionType::Ready)
                .is_some_and(|condition| condition.status == ConditionStatus::True)
            {
                ready = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ready, "the worker pool must converge the bundle");
}
