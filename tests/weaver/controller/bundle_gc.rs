use crate::support::*;
use serde_json::json;

use weaver::weaver::api::types::{BundleConditionType, ConditionStatus, BUNDLE_NAME_LABEL};
use weaver::weaver::controller::ready::ReadyChecker;
use weaver::weaver::k8s::client::{ApiError, DeletionPropagation};
use weaver::weaver::k8s::memory::{MemoryCluster, Verb};

/// Seeds a cluster that previously converged with resources a, b and c and
/// returns a bundle that now only declares a and b.
fn cluster_with_orphan() -> (MemoryCluster, weaver::weaver::api::types::Bundle) {
    let cluster = MemoryCluster::new();
    let bundle = bundle(vec![
        resource("a", &[], config_map("a", json!({"k": "1"}))),
        resource("b", &[], config_map("b", json!({"k": "2"}))),
    ]);
    cluster.put_bundle(bundle.clone());

    for name in ["a", "b", "c"] {
        let data = match name {
            "a" => json!({"k": "1"}),
            "b" => json!({"k": "2"}),
            _ => json!({"k": "3"}),
        };
        let child = owned_child(&bundle, config_map(name, data));
        cluster.seed_object(NAMESPACE, child);
    }
    (cluster, bundle)
}

#[tokio::test]
async fn removed_resources_are_deleted_with_preconditions() {
    let (cluster, bundle) = cluster_with_orphan();

    run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect("pass succeeds");

    let deletes = cluster.calls_with_verb(Verb::Delete);
    assert_eq!(deletes.len(), 1, "only the undeclared object is deleted");
    assert_eq!(deletes[0].name, "c");
    let options = deletes[0]
        .delete_options
        .as_ref()
        .expect("delete options recorded");
    assert_eq!(options.uid_precondition.as_deref(), Some("uid-c"));
    assert_eq!(options.propagation, DeletionPropagation::Foreground);

    assert!(cluster.object(&config_map_gvk(), NAMESPACE, "c").is_none());
    assert!(cluster.object(&config_map_gvk(), NAMESPACE, "a").is_some());
    assert!(cluster.object(&config_map_gvk(), NAMESPACE, "b").is_some());
    // Matching declared objects are left entirely alone.
    assert!(cluster.calls_with_verb(Verb::Update).is_empty());
}

#[tokio::test]
async fn objects_already_marked_for_deletion_are_skipped() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(vec![resource("a", &[], config_map("a", json!({})))]);
    cluster.put_bundle(bundle.clone());
    cluster.seed_object(NAMESPACE, owned_child(&bundle, config_map("a", json!({}))));

    let mut leaving = owned_child(&bundle, config_map("old", json!({})));
    leaving.set_deletion_timestamp("2025-06-01T12:00:00Z");
    cluster.seed_object(NAMESPACE, leaving);

    run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect("pass succeeds");
    assert!(cluster.calls_with_verb(Verb::Delete).is_empty());
}

#[tokio::test]
async fn labelled_but_unowned_objects_are_left_alone() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(vec![resource("a", &[], config_map("a", json!({})))]);
    cluster.put_bundle(bundle.clone());
    cluster.seed_object(NAMESPACE, owned_child(&bundle, config_map("a", json!({}))));

    // Carries our label but no controller reference back to the bundle.
    let mut impostor = config_map("impostor", json!({}));
    let mut labels = impostor.labels();
    labels.insert(BUNDLE_NAME_LABEL.to_string(), BUNDLE_NAME.to_string());
    impostor.set_labels(labels);
    impostor.set_uid("impostor-uid");
    impostor.set_resource_version("1");
    cluster.seed_object(NAMESPACE, impostor);

    run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect("pass succeeds");
    assert!(cluster.calls_with_verb(Verb::Delete).is_empty());
    assert!(cluster
        .object(&config_map_gvk(), NAMESPACE, "impostor")
        .is_some());
}

#[tokio::test]
async fn delete_races_count_as_success() {
    let (cluster, bundle) = cluster_with_orphan();
    // The orphan was deleted and re-created by someone else; the UID
    // precondition turns our delete into a conflict.
    cluster.queue_error(Verb::Delete, ApiError::conflict("uid mismatch"));

    run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect("a raced delete is not a failure");
}

#[tokio::test]
async fn delete_failures_are_retriable_and_reported() {
    let (cluster, bundle) = cluster_with_orphan();
    cluster.queue_error(Verb::Delete, ApiError::server("boom"));

    let failure = run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect_err("the failed delete must surface");
    assert!(failure.retriable);

    let stored = cluster.bundle(NAMESPACE, BUNDLE_NAME).expect("bundle exists");
    assert_condition(
        &stored,
        BundleConditionType::Error,
        ConditionStatus::True,
        Some("RetriableError"),
    );
}

#[tokio::test]
async fn unresolvable_client_makes_the_failure_structural() {
    let (cluster, bundle) = cluster_with_orphan();
    cluster.make_unresolvable(&config_map_gvk());

    // Declared resources also need the client, so this pass fails before
    // GC; drop the declared resources to reach the deletion path.
    let mut gc_only = bundle.clone();
    gc_only.spec.resources.clear();
    cluster.put_bundle(gc_only.clone());

    let failure = run_pass(&cluster, gc_only, ReadyChecker::new())
        .await
        .expect_err("client resolution failure must surface");
    assert!(
        !failure.retriable,
        "a missing client is structural, retrying will not help"
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
async fn first_delete_error_wins_but_all_deletes_are_attempted() {
    let cluster = MemoryCluster::new();
    let bundle = bundle(Vec::new());
    cluster.put_bundle(bundle.clone());

    for name in ["left", "right"] {
        let seeded = bundle_with_children_helper(&bundle, name);
        cluster.seed_object(NAMESPACE, seeded);
    }
    cluster.queue_error(Verb::Delete, ApiError::server("first failure"));

    let failure = run_pass(&cluster, bundle, ReadyChecker::new())
        .await
        .expect_err("the first delete error must surface");
    assert!(failure.retriable);
    assert_eq!(
        cluster.calls_with_verb(Verb::Delete).len(),
        2,
        "the remaining orphan must still be attempted"
    );
}

fn bundle_with_children_helper(
    bundle: &weaver::weaver::api::types::Bundle,
    name: &str,
) -> weaver::weaver::k8s::dynamic::DynamicObject {
    owned_child(bundle, config_map(name, json!({})))
}
