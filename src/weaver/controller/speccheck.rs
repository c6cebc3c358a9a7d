/*
 * Copyright (C) 2025 The Weaver Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Purely functional comparison of a desired object against the observed
//! one. Produces the object an update should write plus a flag telling the
//! caller whether an update is needed at all.

use crate::weaver::k8s::dynamic::{DynamicObject, OwnerReference};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Metadata fields the server owns; the observed side always wins for these.
const SERVER_MANAGED_METADATA: [&str; 5] = [
    "uid",
    "resourceVersion",
    "creationTimestamp",
    "generation",
    "deletionTimestamp",
];

/// Merges `desired` over `observed` and reports whether they already match.
///
/// Fields explicitly set on the desired side win; everything else, including
/// `status` and server-assigned metadata, is preserved from the observed
/// side. Owner references are reconciled as a set. `equal` is true exactly
/// when applying the merge would write back the observed object unchanged.
pub fn compare_actual_vs_spec(
    desired: &DynamicObject,
    observed: &DynamicObject,
) -> (DynamicObject, bool) {
    let mut merged_value = observed.value().clone();
    overlay(&mut merged_value, desired.value());

    let mut merged = DynamicObject::from_value(merged_value)
        .expect("merge of two objects is an object");
    let owners = merge_owner_references(desired.owner_references(), observed.owner_references());
    if !owners.is_empty() {
        merged.set_owner_references(owners);
    }
    restore_server_managed(&mut merged, observed);

    let equal = merged.value() == observed.value();
    (merged, equal)
}

/// Deep merge: desired map keys overlay recursively, any other desired value
/// replaces the observed one. Owner references are handled by the caller.
fn overlay(base: &mut Value, desired: &Value) {
    match (base, desired) {
        (Value::Object(base_map), Value::Object(desired_map)) => {
            for (key, desired_value) in desired_map {
                if key == "ownerReferences" {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(base_value)
                        if base_value.is_object() && desired_value.is_object() =>
                    {
                        overlay(base_value, desired_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), desired_value.clone());
                    }
                }
            }
        }
        (base, desired) => {
            *base = desired.clone();
        }
    }
}

fn merge_owner_references(
    desired: Vec<OwnerReference>,
    observed: Vec<OwnerReference>,
) -> Vec<OwnerReference> {
    let produced: HashSet<(String, String, String, String)> = desired
        .iter()
        .map(|reference| {
            let (api_version, kind, name, uid) = reference.key();
            (
                api_version.to_string(),
                kind.to_string(),
                name.to_string(),
                uid.to_string(),
            )
        })
        .collect();

    let mut merged = desired;
    for reference in observed {
        let (api_version, kind, name, uid) = reference.key();
        let key = (
            api_version.to_string(),
            kind.to_string(),
            name.to_string(),
            uid.to_string(),
        );
        if !reference.is_controller() && !produced.contains(&key) {
            merged.push(reference);
        }
    }
    merged
}

fn restore_server_managed(merged: &mut DynamicObject, observed: &DynamicObject) {
    let observed_metadata: Map<String, Value> = observed
        .value()
        .get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let root = merged
        .value_mut()
        .as_object_mut()
        .expect("merged root is an object");
    if let Some(metadata) = root.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in SERVER_MANAGED_METADATA {
            match observed_metadata.get(field) {
                Some(value) => {
                    metadata.insert(field.to_string(), value.clone());
                }
                None => {
                    metadata.remove(field);
                }
            }
        }
    }

    match observed.value().get("status") {
        Some(status) => {
            root.insert("status".to_string(), status.clone());
        }
        None => {
            root.remove("status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> DynamicObject {
        DynamicObject::from_value(value).expect("object payload")
    }

    fn bundle_ref(controller: bool) -> Value {
        json!({
            "apiVersion": "weaver.io/v1",
            "kind": "Bundle",
            "name": "shop",
            "uid": "bundle-uid",
            "controller": controller,
            "blockOwnerDeletion": true
        })
    }

    #[test]
    fn matching_objects_compare_equal() {
        let desired = object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cfg", "ownerReferences": [bundle_ref(true)]},
            "data": {"key": "value"}
        }));
        let observed = object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cfg",
                "uid": "uid-1",
                "resourceVersion": "7",
                "ownerReferences": [bundle_ref(true)]
            },
            "data": {"key": "value"}
        }));
        let (merged, equal) = compare_actual_vs_spec(&desired, &observed);
        assert!(equal, "identical specs must not require an update");
        assert_eq!(merged.value(), observed.value());
    }

    #[test]
    fn desired_fields_win_and_server_fields_survive() {
        let desired = object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cfg"},
            "data": {"key": "new"}
        }));
        let observed = object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cfg",
                "uid": "uid-1",
                "resourceVersion": "7",
                "creationTimestamp": "2025-02-01T00:00:00Z"
            },
            "data": {"key": "old", "extra": "kept"},
            "status": {"observed": true}
        }));
        let (merged, equal) = compare_actual_vs_spec(&desired, &observed);
        assert!(!equal);
        assert_eq!(merged.path("data/key"), Some(&json!("new")));
        assert_eq!(merged.path("data/extra"), Some(&json!("kept")));
        assert_eq!(merged.resource_version(), Some("7"));
        assert_eq!(merged.uid(), Some("uid-1"));
        assert_eq!(merged.path("status/observed"), Some(&json!(true)));
    }

    #[test]
    fn desired_resource_version_never_reaches_the_merge() {
        let desired = object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cfg", "resourceVersion": "999"},
            "data": {}
        }));
        let observed = object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cfg", "resourceVersion": "7"},
            "data": {}
        }));
        let (merged, equal) = compare_actual_vs_spec(&desired, &observed);
        assert!(equal);
        assert_eq!(merged.resource_version(), Some("7"));
    }

    #[test]
    fn foreign_non_controller_owners_survive_the_merge() {
        let desired = object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cfg", "ownerReferences": [bundle_ref(true)]},
            "data": {}
        }));
        let foreign = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "name": "other",
            "uid": "other-uid"
        });
        let observed = object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cfg",
                "ownerReferences": [bundle_ref(true), foreign]
            },
            "data": {}
        }));
        let (merged, equal) = compare_actual_vs_spec(&desired, &observed);
        assert!(equal, "owner set is unchanged, no update needed");
        let owners = merged.owner_references();
        assert_eq!(owners.len(), 2);
        assert!(owners.iter().any(|o| o.uid == "other-uid"));
    }

    #[test]
    fn repeated_merges_are_idempotent() {
        let desired = object(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "app",
                "labels": {"bundleName": "shop"},
                "ownerReferences": [bundle_ref(true)]
            },
            "spec": {"replicas": 2}
        }));
        let observed = object(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "app", "uid": "uid-9", "resourceVersion": "3"},
            "spec": {"replicas": 1},
            "status": {"readyReplicas": 1}
        }));
        let (first, first_equal) = compare_actual_vs_spec(&desired, &observed);
        assert!(!first_equal);
        let (second, second_equal) = compare_actual_vs_spec(&desired, &first);
        assert!(second_equal, "applying the merge twice must be a no-op");
        assert_eq!(second.value(), first.value());
    }
}
