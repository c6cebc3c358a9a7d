#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use weaver::weaver::api::types::{
    Bundle, BundleConditionType, BundleSpec, ConditionStatus, Resource, BUNDLE_NAME_LABEL,
};
use weaver::weaver::controller::error::SyncFailure;
use weaver::weaver::controller::ready::ReadyChecker;
use weaver::weaver::controller::sync::SyncTask;
use weaver::weaver::k8s::dynamic::{DynamicObject, GroupVersionKind};
use weaver::weaver::k8s::memory::MemoryCluster;

pub const NAMESPACE: &str = "default";
pub const BUNDLE_NAME: &str = "shop";
pub const BUNDLE_UID: &str = "bundle-uid";

pub fn config_map_gvk() -> GroupVersionKind {
    GroupVersionKind::new("", "v1", "ConfigMap")
}

pub fn deployment_gvk() -> GroupVersionKind {
    GroupVersionKind::new("apps", "v1", "Deployment")
}

pub fn config_map(name: &str, data: serde_json::Value) -> DynamicObject {
    DynamicObject::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name},
        "data": data
    }))
    .expect("config map payload")
}

pub fn deployment(name: &str, env_value: &str) -> DynamicObject {
    DynamicObject::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name},
        "spec": {
            "replicas": 1,
            "template": {
                "spec": {
                    "containers": [{
                        "name": "main",
                        "env": [{"name": "DB_HOST", "value": env_value}]
                    }]
                }
            }
        }
    }))
    .expect("deployment payload")
}

pub fn resource(name: &str, depends_on: &[&str], spec: DynamicObject) -> Resource {
    Resource {
        name: name.to_string(),
        depends_on: depends_on.iter().map(|dep| dep.to_string()).collect(),
        spec,
    }
}

pub fn bundle(resources: Vec<Resource>) -> Bundle {
    let mut bundle = Bundle::new(NAMESPACE, BUNDLE_NAME);
    bundle.metadata.uid = Some(BUNDLE_UID.to_string());
    bundle.spec = BundleSpec { resources };
    bundle
}

/// Prepares an object the way a previous pass would have left it on the
/// server: bundle label, controller owner reference, UID and version.
pub fn owned_child(bundle: &Bundle, mut object: DynamicObject) -> DynamicObject {
    let mut labels = object.labels();
    labels.insert(BUNDLE_NAME_LABEL.to_string(), bundle.name().to_string());
    object.set_labels(labels);
    object.set_owner_references(vec![bundle.controller_owner_ref()]);
    let uid = format!("uid-{}", object.name().expect("child has a name"));
    object.set_uid(&uid);
    object.set_resource_version("1");
    object
}

/// Runs one full pass (process + status folding) over the bundle.
pub async fn run_pass(
    cluster: &MemoryCluster,
    bundle: Bundle,
    checker: ReadyChecker,
) -> Result<(), SyncFailure> {
    run_pass_with_cancel(cluster, bundle, checker, CancellationToken::new()).await
}

pub async fn run_pass_with_cancel(
    cluster: &MemoryCluster,
    bundle: Bundle,
    checker: ReadyChecker,
    cancel: CancellationToken,
) -> Result<(), SyncFailure> {
    let mut task = SyncTask::new(
        bundle,
        Arc::new(cluster.clone()),
        Arc::new(cluster.clone()),
        Arc::new(cluster.clone()),
        Arc::new(checker),
        cancel,
    );
    let result = task.process().await;
    task.handle_process_result(result).await
}

pub fn assert_condition(
    bundle: &Bundle,
    condition_type: BundleConditionType,
    status: ConditionStatus,
    reason: Option<&str>,
) {
    let condition = bundle
        .condition(condition_type)
        .unwrap_or_else(|| panic!("condition {condition_type:?} missing"));
    assert_eq!(
        condition.status, status,
        "unexpected status for condition {condition_type:?}"
    );
    if let Some(reason) = reason {
        assert_eq!(
            condition.reason.as_deref(),
            Some(reason),
            "unexpected reason for condition {condition_type:?}"
        );
    }
}
