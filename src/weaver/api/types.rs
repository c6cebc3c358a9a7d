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

use crate::weaver::k8s::dynamic::{DynamicObject, GroupVersionKind, OwnerReference};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const BUNDLE_GROUP: &str = "weaver.io";
pub const BUNDLE_VERSION: &str = "v1";
pub const BUNDLE_API_VERSION: &str = "weaver.io/v1";
pub const BUNDLE_KIND: &str = "Bundle";

/// Label written on every managed child, pointing back at the parent Bundle.
pub const BUNDLE_NAME_LABEL: &str = "bundleName";

/// Minimal object metadata carried by Bundles.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// A named collection of declaratively specified resources reconciled as a
/// unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bundle {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: BundleSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BundleStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BundleSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
}

/// One entry in a Bundle: a single API object specification plus its
/// in-Bundle dependencies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "dependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub spec: DynamicObject,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BundleStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<BundleCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BundleConditionType {
    InProgress,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleCondition {
    #[serde(rename = "type")]
    pub condition_type: BundleConditionType,
    pub status: ConditionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl BundleCondition {
    pub fn new(condition_type: BundleConditionType, status: ConditionStatus) -> Self {
        Self {
            condition_type,
            status,
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    fn effectively_equal(&self, other: &BundleCondition) -> bool {
        self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Bundle {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            api_version: BUNDLE_API_VERSION.to_string(),
            kind: BUNDLE_KIND.to_string(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: BundleSpec::default(),
            status: None,
        }
    }

    pub fn gvk() -> GroupVersionKind {
        GroupVersionKind::new(BUNDLE_GROUP, BUNDLE_VERSION, BUNDLE_KIND)
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }

    /// The controller owner reference managed children carry back to this
    /// Bundle.
    pub fn controller_owner_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: BUNDLE_API_VERSION.to_string(),
            kind: BUNDLE_KIND.to_string(),
            name: self.name().to_string(),
            uid: self.uid().to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Updates the condition with the matching type in place, inserting it
    /// when absent. Returns whether the effective value (status, reason or
    /// message) changed; the transition timestamp is refreshed only then.
    pub fn update_condition(&mut self, mut condition: BundleCondition) -> bool {
        let status = self.status.get_or_insert_with(BundleStatus::default);
        match status
            .conditions
            .iter_mut()
            .find(|existing| existing.condition_type == condition.condition_type)
        {
            Some(existing) => {
                if existing.effectively_equal(&condition) {
                    return false;
                }
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.clone()
                } else {
                    Some(now_timestamp())
                };
                *existing = condition;
                true
            }
            None => {
                condition.last_transition_time = Some(now_timestamp());
                status.conditions.push(condition);
                true
            }
        }
    }

    pub fn condition(&self, condition_type: BundleConditionType) -> Option<&BundleCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|condition| condition.condition_type == condition_type)
    }
}

/// List wrapper returned by the Bundle collection endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleList {
    #[serde(default)]
    pub items: Vec<Bundle>,
}
