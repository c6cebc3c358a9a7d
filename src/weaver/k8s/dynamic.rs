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

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Errors produced while interpreting a dynamic object payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynamicError {
    NotAnObject,
    MissingField(&'static str),
    InvalidApiVersion(String),
}

impl fmt::Display for DynamicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynamicError::NotAnObject => write!(f, "object payload is not a JSON object"),
            DynamicError::MissingField(field) => {
                write!(f, "object payload is missing field {field:?}")
            }
            DynamicError::InvalidApiVersion(value) => {
                write!(f, "invalid apiVersion {value:?}")
            }
        }
    }
}

impl Error for DynamicError {}

/// Identifies an API resource type by group, version and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Parses an `apiVersion` value, which is `version` for the core group
    /// and `group/version` otherwise.
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self, DynamicError> {
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) if !group.is_empty() && !version.is_empty() => (group, version),
            Some(_) => return Err(DynamicError::InvalidApiVersion(api_version.to_string())),
            None if !api_version.is_empty() => ("", api_version),
            None => return Err(DynamicError::InvalidApiVersion(api_version.to_string())),
        };
        Ok(Self::new(group, version, kind))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// The `(group, kind)` pair used to key readiness checkers.
    pub fn group_kind(&self) -> (String, String) {
        (self.group.clone(), self.kind.clone())
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// Keys a managed child object for deletion reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub gvk: GroupVersionKind,
    pub name: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.gvk, self.name)
    }
}

/// A single owner reference carried in object metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(rename = "blockOwnerDeletion", skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerReference {
    pub fn is_controller(&self) -> bool {
        self.controller.unwrap_or(false)
    }

    /// Identity used for set semantics over owner-reference lists.
    pub fn key(&self) -> (&str, &str, &str, &str) {
        (&self.api_version, &self.kind, &self.name, &self.uid)
    }
}

/// Free-form structured API object.
///
/// The wrapped value is always a JSON object; map key order is preserved so
/// repeated serialization is byte-stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct DynamicObject {
    root: Value,
}

impl TryFrom<Value> for DynamicObject {
    type Error = DynamicError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if !value.is_object() {
            return Err(DynamicError::NotAnObject);
        }
        Ok(Self { root: value })
    }
}

impl From<DynamicObject> for Value {
    fn from(object: DynamicObject) -> Value {
        object.root
    }
}

impl DynamicObject {
    pub fn from_value(value: Value) -> Result<Self, DynamicError> {
        Self::try_from(value)
    }

    pub fn value(&self) -> &Value {
        &self.root
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    fn top_str(&self, field: &str) -> Option<&str> {
        self.root.get(field).and_then(Value::as_str)
    }

    fn metadata(&self) -> Option<&Map<String, Value>> {
        self.root.get("metadata").and_then(Value::as_object)
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let root = self
            .root
            .as_object_mut()
            .expect("dynamic object root is always a JSON object");
        root.entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .expect("metadata is always a JSON object")
    }

    pub fn api_version(&self) -> Option<&str> {
        self.top_str("apiVersion")
    }

    pub fn kind(&self) -> Option<&str> {
        self.top_str("kind")
    }

    pub fn gvk(&self) -> Result<GroupVersionKind, DynamicError> {
        let api_version = self
            .api_version()
            .ok_or(DynamicError::MissingField("apiVersion"))?;
        let kind = self.kind().ok_or(DynamicError::MissingField("kind"))?;
        GroupVersionKind::from_api_version(api_version, kind)
    }

    fn metadata_str(&self, field: &str) -> Option<&str> {
        self.metadata()?.get(field).and_then(Value::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata_str("name")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata_str("namespace")
    }

    pub fn uid(&self) -> Option<&str> {
        self.metadata_str("uid")
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata_str("resourceVersion")
    }

    pub fn deletion_timestamp(&self) -> Option<&str> {
        self.metadata_str("deletionTimestamp")
    }

    pub fn set_uid(&mut self, uid: &str) {
        self.metadata_mut()
            .insert("uid".to_string(), Value::String(uid.to_string()));
    }

    pub fn set_resource_version(&mut self, resource_version: &str) {
        self.metadata_mut().insert(
            "resourceVersion".to_string(),
            Value::String(resource_version.to_string()),
        );
    }

    pub fn set_deletion_timestamp(&mut self, timestamp: &str) {
        self.metadata_mut().insert(
            "deletionTimestamp".to_string(),
            Value::String(timestamp.to_string()),
        );
    }

    pub fn labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        if let Some(map) = self.metadata().and_then(|m| m.get("labels")).and_then(Value::as_object) {
            for (key, value) in map {
                if let Some(value) = value.as_str() {
                    labels.insert(key.clone(), value.to_string());
                }
            }
        }
        labels
    }

    pub fn set_labels(&mut self, labels: HashMap<String, String>) {
        let mut sorted: Vec<_> = labels.into_iter().collect();
        sorted.sort_by(|(a, _), (b, _)| a.cmp(b));
        let mut map = Map::new();
        for (key, value) in sorted {
            map.insert(key, Value::String(value));
        }
        self.metadata_mut()
            .insert("labels".to_string(), Value::Object(map));
    }

    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.metadata()
            .and_then(|m| m.get("ownerReferences"))
            .and_then(|refs| serde_json::from_value(refs.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_owner_references(&mut self, references: Vec<OwnerReference>) {
        let value = serde_json::to_value(references)
            .expect("owner references serialize to JSON");
        self.metadata_mut()
            .insert("ownerReferences".to_string(), value);
    }

    /// Returns the single owner reference marked `controller=true`, if any.
    pub fn controller_owner(&self) -> Option<OwnerReference> {
        self.owner_references()
            .into_iter()
            .find(OwnerReference::is_controller)
    }

    /// True when the object's controller owner carries `uid`.
    pub fn is_controlled_by(&self, uid: &str) -> bool {
        self.controller_owner()
            .is_some_and(|owner| owner.uid == uid)
    }

    pub fn object_ref(&self) -> Result<ObjectRef, DynamicError> {
        Ok(ObjectRef {
            gvk: self.gvk()?,
            name: self
                .name()
                .ok_or(DynamicError::MissingField("metadata.name"))?
                .to_string(),
        })
    }

    /// Reads a value at a `/`-separated path relative to the object root.
    /// Path segments index into maps by key and into sequences by position.
    pub fn path(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.root, path)
    }
}

/// Shared path reader over the dynamic value tree.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
